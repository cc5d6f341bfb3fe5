//! Value transforms and the registry of kinds the engine may create.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use refmap_core::type_name;
use serde_json::Value;

use crate::{EntityKind, KubeMapping, OpenApiMapping, RefError, CONFIGMAPS_GVR, SECRETS_GVR};

/// Reversible transform applied to values moving into (encode) and out of
/// (decode) an entity.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Value, RefError>;
    fn decode(&self, value: &Value) -> Result<Value, RefError>;
}

/// Standard padded base64 over UTF-8 strings, as Secret `data` stores them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Codec;

impl ValueCodec for Base64Codec {
    fn encode(&self, value: &Value) -> Result<Value, RefError> {
        let s = value.as_str().ok_or_else(|| RefError::Codec {
            codec: "base64",
            reason: format!("expected a string for secret encoding, but got {}", type_name(value)),
        })?;
        Ok(Value::String(STANDARD.encode(s)))
    }

    fn decode(&self, value: &Value) -> Result<Value, RefError> {
        let s = value.as_str().ok_or_else(|| RefError::Codec {
            codec: "base64",
            reason: format!("expected a string for secret decoding, but got {}", type_name(value)),
        })?;
        let bytes = STANDARD
            .decode(s)
            .map_err(|e| RefError::Codec { codec: "base64", reason: e.to_string() })?;
        let text = String::from_utf8(bytes)
            .map_err(|e| RefError::Codec { codec: "base64", reason: format!("decoded secret is not UTF-8: {}", e) })?;
        Ok(Value::String(text))
    }
}

/// Everything the engine can do with a given entity type: codecs, kinds it
/// can create, and references whose expansion may be skipped. Built once
/// and shared read-only.
#[derive(Clone)]
pub struct Capabilities {
    codecs_by_gvr: BTreeMap<String, Arc<dyn ValueCodec>>,
    codecs_by_content_type: BTreeMap<String, Arc<dyn ValueCodec>>,
    kinds: BTreeMap<String, EntityKind>,
    optional_expansions: BTreeSet<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::empty()
            .with_codec(SECRETS_GVR, Base64Codec)
            .with_kind(SECRETS_GVR, EntityKind::Secret)
            .with_kind(CONFIGMAPS_GVR, EntityKind::ConfigMap)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("codecs_by_gvr", &self.codecs_by_gvr.keys().collect::<Vec<_>>())
            .field("codecs_by_content_type", &self.codecs_by_content_type.keys().collect::<Vec<_>>())
            .field("kinds", &self.kinds)
            .field("optional_expansions", &self.optional_expansions)
            .finish()
    }
}

impl Capabilities {
    /// No codecs, no kinds.
    pub fn empty() -> Self {
        Self {
            codecs_by_gvr: BTreeMap::new(),
            codecs_by_content_type: BTreeMap::new(),
            kinds: BTreeMap::new(),
            optional_expansions: BTreeSet::new(),
        }
    }

    pub fn with_codec(mut self, gvr: &str, codec: impl ValueCodec + 'static) -> Self {
        self.codecs_by_gvr.insert(gvr.to_owned(), Arc::new(codec));
        self
    }

    /// Codec selected by the API-side content type tag; wins over the GVR codec.
    pub fn with_content_type_codec(mut self, content_type: &str, codec: impl ValueCodec + 'static) -> Self {
        self.codecs_by_content_type.insert(content_type.to_owned(), Arc::new(codec));
        self
    }

    pub fn with_kind(mut self, gvr: &str, kind: EntityKind) -> Self {
        self.kinds.insert(gvr.to_owned(), kind);
        self
    }

    /// Reference field names whose expansion is skipped when no selector fits.
    pub fn with_optional_expansion(mut self, reference: &str) -> Self {
        self.optional_expansions.insert(reference.to_owned());
        self
    }

    pub fn codec_for(&self, kube: &KubeMapping, openapi: &OpenApiMapping) -> Option<&dyn ValueCodec> {
        self.codecs_by_content_type
            .get(&openapi.content_type)
            .or_else(|| self.codecs_by_gvr.get(&kube.type_.gvr_key()))
            .map(|c| c.as_ref())
    }

    pub fn kind_for(&self, gvr: &str) -> Option<&EntityKind> { self.kinds.get(gvr) }

    pub fn is_optional_expansion(&self, reference: &str) -> bool { self.optional_expansions.contains(reference) }
}
