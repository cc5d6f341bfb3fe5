//! refmap translate: move values between a Kubernetes resource pinned to an
//! API major version and the flat payload of that API.
//!
//! `to_api` reads `spec.<major>` (with its `entry` mirror on top) after
//! collapsing references; `from_api` fills `spec.<major>`, `spec.<major>.entry`
//! and `status.<major>` from the payload and expands references into new
//! entities returned alongside the resource.

#![forbid(unsafe_code)]

mod config;

pub use config::Limits;

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use metrics::{counter, histogram};
use refmap_core::{copy_fields, exceeds_budget, get, get_object_mut, get_or_create, skip_keys, DocError, Document, Object};
use refmap_refs::{Capabilities, Entity, EntityContext, Handler, MappingTree, ObjectKey, RefError};
use refmap_schema::{BindError, SchemaBinding, ValidationError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// CRD annotation holding the reference mapping document (YAML).
pub const API_MAPPINGS_ANNOTATION: &str = "api-mappings";
/// Field of `spec.<major>` mirroring the last payload read from the API.
pub const ENTRY_FIELD: &str = "entry";

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("failed to validate {stage} object: {source}")]
    Validation { stage: &'static str, source: ValidationError },
    #[error("failed to process API mappings: {0}")]
    Reference(RefError),
    #[error("failed to parse the api-mappings annotation: {0}")]
    Mappings(RefError),
    #[error(transparent)]
    Document(#[from] DocError),
    #[error("translator is bound to {expected} but the document is {found}")]
    KindMismatch { expected: String, found: String },
    #[error("document exceeds {max_nodes} nodes or depth {max_depth}")]
    BudgetExceeded { max_nodes: usize, max_depth: usize },
    #[error("failed to convert between typed and document form: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A schema binding plus the parsed reference mappings of its CRD. Immutable;
/// clones share state.
#[derive(Debug, Clone)]
pub struct Translator {
    binding: Arc<SchemaBinding>,
    mappings: Option<Arc<MappingTree>>,
    caps: Arc<Capabilities>,
    limits: Limits,
}

impl Translator {
    pub fn new(binding: SchemaBinding, caps: Arc<Capabilities>) -> Result<Self, TranslateError> {
        let text = binding.annotation(API_MAPPINGS_ANNOTATION);
        let mappings = if text.trim().is_empty() {
            None
        } else {
            Some(Arc::new(MappingTree::parse_yaml(text).map_err(TranslateError::Mappings)?))
        };
        debug!(major = %binding.major_version(), mapped = mappings.is_some(), "translator ready");
        Ok(Self { binding: Arc::new(binding), mappings, caps, limits: Limits::from_env() })
    }

    /// Bind `crd` at `crd_version` (first version when empty) to `major_version`.
    pub fn bind(
        crd: &CustomResourceDefinition,
        crd_version: &str,
        major_version: &str,
        caps: Arc<Capabilities>,
    ) -> Result<Self, TranslateError> {
        Self::new(SchemaBinding::bind(crd, crd_version, major_version)?, caps)
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn major_version(&self) -> &str { self.binding.major_version() }
    pub fn annotation(&self, key: &str) -> &str { self.binding.annotation(key) }
    pub fn binding(&self) -> &SchemaBinding { &self.binding }
    pub fn mappings(&self) -> Option<&MappingTree> { self.mappings.as_deref() }
    pub fn capabilities(&self) -> &Capabilities { &self.caps }
    pub fn limits(&self) -> Limits { self.limits }

    pub fn validate(&self, doc: &Document) -> Result<(), ValidationError> { self.binding.validate(doc) }

    fn check_budget(&self, doc: &Document) -> Result<(), TranslateError> {
        if exceeds_budget(doc, self.limits.max_nodes, self.limits.max_depth) {
            return Err(TranslateError::BudgetExceeded {
                max_nodes: self.limits.max_nodes,
                max_depth: self.limits.max_depth,
            });
        }
        Ok(())
    }

    /// Reject resources whose `apiVersion`/`kind` name another type.
    fn check_kind(&self, doc: &Document) -> Result<(), TranslateError> {
        let gvk = self.binding.gvk();
        let expected_api = if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) };
        let api_version = doc.get("apiVersion").and_then(Value::as_str);
        let kind = doc.get("kind").and_then(Value::as_str);
        let api_ok = api_version.map(|a| a == expected_api).unwrap_or(true);
        let kind_ok = kind.map(|k| k == gvk.kind).unwrap_or(true);
        if api_ok && kind_ok {
            return Ok(());
        }
        Err(TranslateError::KindMismatch {
            expected: format!("{}/{}", expected_api, gvk.kind),
            found: format!("{}/{}", api_version.unwrap_or("?"), kind.unwrap_or("?")),
        })
    }
}

/// Parameters of one translation call.
#[derive(Debug, Clone)]
pub struct Request<'t> {
    pub translator: &'t Translator,
    /// Entities references may point at.
    pub dependencies: Vec<Entity>,
}

impl<'t> Request<'t> {
    pub fn new(translator: &'t Translator, dependencies: Vec<Entity>) -> Self { Self { translator, dependencies } }

    fn handler(&self, main: &Document) -> Handler<'t> {
        let ctx = EntityContext::new(main_key(main), self.dependencies.iter().cloned());
        Handler::new(&self.translator.caps, ctx)
    }
}

/// Result of `from_api`: the resource plus the entities expansion created.
#[derive(Debug, Clone)]
pub struct Translated {
    pub primary: Document,
    pub added: Vec<Entity>,
}

impl Translated {
    pub fn primary_as<T: DeserializeOwned>(&self) -> Result<T, TranslateError> {
        Ok(serde_json::from_value(self.primary.clone())?)
    }
}

fn main_key(doc: &Document) -> ObjectKey {
    let name = get::<&str, _>(doc, &["metadata", "name"]).unwrap_or("");
    let namespace = get::<&str, _>(doc, &["metadata", "namespace"]).ok();
    ObjectKey::new(namespace, name)
}

fn record(direction: &'static str, started: Instant, ok: bool) {
    histogram!("translate_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "direction" => direction);
    match (ok, direction) {
        (false, _) => counter!("translate_err_total", 1u64, "direction" => direction),
        (true, "to_api") => counter!("translate_to_api_total", 1u64),
        (true, _) => counter!("translate_from_api_total", 1u64),
    }
}

/// Typed wrapper over [`to_api_document`].
pub fn to_api<T: DeserializeOwned, S: Serialize>(req: &Request<'_>, source: &S) -> Result<T, TranslateError> {
    let doc = serde_json::to_value(source)?;
    Ok(serde_json::from_value(to_api_document(req, &doc)?)?)
}

/// API payload for the Kubernetes resource `source`. Only the spec is read.
pub fn to_api_document(req: &Request<'_>, source: &Document) -> Result<Document, TranslateError> {
    let started = Instant::now();
    let out = export(req, source);
    record("to_api", started, out.is_ok());
    out
}

fn export(req: &Request<'_>, source: &Document) -> Result<Document, TranslateError> {
    let t = req.translator;
    t.check_kind(source)?;
    t.check_budget(source)?;
    t.validate(source).map_err(|source| TranslateError::Validation { stage: "input", source })?;

    let major = t.major_version();
    let mut doc = source.clone();
    if let Some(tree) = t.mappings() {
        req.handler(source)
            .collapse_references(&mut doc, tree, &["spec", major])
            .map_err(TranslateError::Reference)?;
    }
    let spec: &Object = get(&doc, &["spec", major])?;
    let mut target = skip_keys(spec, &[ENTRY_FIELD]);
    if let Some(Value::Object(entry)) = spec.get(ENTRY_FIELD) {
        copy_fields(&mut target, entry);
    }
    info!(major = %major, fields = target.len(), "translated resource to API payload");
    Ok(Value::Object(target))
}

/// Typed wrapper over [`from_api_document`].
pub fn from_api<T: Serialize, S: Serialize>(
    req: &Request<'_>,
    template: &T,
    source: &S,
) -> Result<Translated, TranslateError> {
    let template = serde_json::to_value(template)?;
    let source = serde_json::to_value(source)?;
    from_api_document(req, template, &source)
}

/// Kubernetes resource built on `template` from the API payload `source`.
pub fn from_api_document(req: &Request<'_>, template: Document, source: &Document) -> Result<Translated, TranslateError> {
    let started = Instant::now();
    let out = import(req, template, source);
    record("from_api", started, out.is_ok());
    out
}

fn import(req: &Request<'_>, template: Document, source: &Document) -> Result<Translated, TranslateError> {
    let t = req.translator;
    t.check_budget(source)?;
    t.check_budget(&template)?;
    let payload: &Object = get(source, &[] as &[&str])?;
    let mut target = if template.is_null() { Value::Object(Object::new()) } else { template };
    t.check_kind(&target)?;

    let major = t.major_version();
    get_or_create(&mut target, Value::Object(Object::new()), &["spec", major])?;
    get_or_create(&mut target, Value::Object(Object::new()), &["status", major])?;
    {
        let spec = get_object_mut(&mut target, &["spec", major])?;
        copy_fields(spec, payload);
        spec.insert(ENTRY_FIELD.to_owned(), Value::Object(payload.clone()));
    }
    copy_fields(get_object_mut(&mut target, &["status", major])?, payload);

    let added = match t.mappings() {
        None => Vec::new(),
        Some(tree) => {
            let mut handler = req.handler(&target);
            let spec_path = ["spec", major];
            let entry_path = ["spec", major, ENTRY_FIELD];
            let status_path = ["status", major];
            for (title, path) in [("spec", &spec_path[..]), ("spec entry", &entry_path[..]), ("status", &status_path[..])] {
                handler
                    .expand_references(&mut target, tree, path)
                    .map_err(|e| TranslateError::Reference(e.at(format!("failed to map properties of {:?}", title))))?;
            }
            handler.into_added()
        }
    };
    t.validate(&target).map_err(|source| TranslateError::Validation { stage: "output", source })?;
    info!(major = %major, added = added.len(), "translated API payload to resource");
    Ok(Translated { primary: target, added })
}
