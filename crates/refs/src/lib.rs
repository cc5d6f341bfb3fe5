//! refmap refs: reference mapping descriptors, external entities and the
//! engine that moves inline values out into entities (expand) and back (collapse).

#![forbid(unsafe_code)]

mod codec;
mod context;
mod descriptor;
mod entity;
mod handler;
mod naming;

pub use codec::{Base64Codec, Capabilities, ValueCodec};
pub use context::EntityContext;
pub use descriptor::{
    is_reference, KubeMapping, MappingNode, MappingProps, MappingTree, OpenApiMapping, ReferenceDescriptor,
    ReferenceSite, TypeIdentity,
};
pub use entity::{Entity, EntityKind, ObjectKey};
pub use handler::{Direction, Handler};
pub use naming::{entity_name, prefixed_name, safe_encode};

use refmap_core::DocError;

/// Marker key of the Kubernetes-side mapping block.
pub const KUBE_MAPPING_KEY: &str = "x-kubernetes-mapping";
/// Marker key of the API-side mapping block.
pub const OPENAPI_MAPPING_KEY: &str = "x-openapi-mapping";
/// Selector templates ending with this suffix take the target field name.
pub const PROPERTY_SELECTOR_SUFFIX: &str = ".#";
pub const REF_NAME: &str = "name";
pub const REF_KEY: &str = "key";

pub const SECRETS_GVR: &str = "v1/secrets";
pub const CONFIGMAPS_GVR: &str = "v1/configmaps";

#[derive(Debug, thiserror::Error)]
pub enum RefError {
    #[error(transparent)]
    Document(#[from] DocError),
    #[error("invalid reference mapping: {0}")]
    InvalidMapping(String),
    #[error("too many matches for key {key:?}: {count} array elements carry it")]
    AmbiguousMatch { key: String, count: usize },
    #[error("no matching property selector found to set value")]
    NoMatchingSelector,
    #[error("{0}")]
    UnresolvedReference(String),
    #[error("{0}")]
    UnsupportedMapping(String),
    #[error("unsupported kube object for GVR {0:?}")]
    UnknownEntityType(String),
    #[error("{codec} codec: {reason}")]
    Codec { codec: &'static str, reason: String },
    #[error("entity conversion failed: {0}")]
    Entity(#[from] serde_json::Error),
    #[error("{at}: {inner}")]
    Context { at: String, inner: Box<RefError> },
}

impl RefError {
    /// Innermost error, stripped of every breadcrumb.
    pub fn root(&self) -> &RefError {
        let mut cur = self;
        while let RefError::Context { inner, .. } = cur {
            cur = inner.as_ref();
        }
        cur
    }

    /// Wrap with a breadcrumb naming where the error happened.
    pub fn at(self, at: impl Into<String>) -> Self {
        RefError::Context { at: at.into(), inner: Box::new(self) }
    }
}

/// Attach a breadcrumb to the error of a fallible engine step.
pub(crate) trait Breadcrumb<T> {
    fn at<F: FnOnce() -> String>(self, f: F) -> Result<T, RefError>;
}

impl<T, E: Into<RefError>> Breadcrumb<T> for Result<T, E> {
    fn at<F: FnOnce() -> String>(self, f: F) -> Result<T, RefError> {
        self.map_err(|e| e.into().at(f()))
    }
}
