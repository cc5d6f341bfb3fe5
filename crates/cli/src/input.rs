//! Reading CRDs, resources and dependency bundles from YAML or JSON files.

use std::path::Path;

use anyhow::{bail, Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use refmap_core::Document;
use refmap_refs::Entity;
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_MAX_INPUT_BYTES: usize = 1 << 20;

pub fn max_input_bytes() -> usize {
    std::env::var("REFMAP_MAX_INPUT_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_INPUT_BYTES)
}

fn read_bytes(path: &Path, max: usize) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() > max {
        bail!("{} is {} bytes, over the {} byte input limit (REFMAP_MAX_INPUT_BYTES)", path.display(), bytes.len(), max);
    }
    Ok(bytes)
}

/// A single YAML or JSON document. JSON parses as YAML.
pub fn parse_document(bytes: &[u8]) -> Result<Document> {
    Ok(serde_yaml::from_slice(bytes)?)
}

pub fn read_document(path: &Path) -> Result<Document> {
    let bytes = read_bytes(path, max_input_bytes())?;
    parse_document(&bytes).with_context(|| format!("parsing {}", path.display()))
}

pub fn read_crd(path: &Path) -> Result<CustomResourceDefinition> {
    let doc = read_document(path)?;
    serde_json::from_value(doc).with_context(|| format!("{} is not a CustomResourceDefinition", path.display()))
}

/// Entities from a multi-document stream; sequences and `*List` objects are flattened.
pub fn parse_entities(bytes: &[u8]) -> Result<Vec<Entity>> {
    let mut out = Vec::new();
    for de in serde_yaml::Deserializer::from_slice(bytes) {
        let doc = Value::deserialize(de)?;
        flatten(doc, &mut out)?;
    }
    Ok(out)
}

pub fn read_entities(path: &Path) -> Result<Vec<Entity>> {
    let bytes = read_bytes(path, max_input_bytes())?;
    parse_entities(&bytes).with_context(|| format!("parsing dependencies in {}", path.display()))
}

fn is_list(map: &serde_json::Map<String, Value>) -> bool {
    let kind = map.get("kind").and_then(Value::as_str).unwrap_or("");
    kind.ends_with("List") && map.get("items").map(Value::is_array).unwrap_or(false)
}

fn flatten(doc: Value, out: &mut Vec<Entity>) -> Result<()> {
    match doc {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                flatten(item, out)?;
            }
        }
        Value::Object(mut map) if is_list(&map) => {
            if let Some(Value::Array(items)) = map.remove("items") {
                for item in items {
                    flatten(item, out)?;
                }
            }
        }
        other => {
            let entity = Entity::from_document(other).context("decoding dependency object")?;
            out.push(entity);
        }
    }
    Ok(())
}
