//! refmap schema: bind one CRD version to an API major version and validate
//! documents against its `openAPIV3Schema`.
//!
//! Given a resource such as
//!
//! ```yaml
//! apiVersion: atlas.generated.mongodb.com/v1
//! kind: DatabaseUser
//! spec:
//!   v20250312:
//!     username: alice
//! ```
//!
//! the CRD version is `v1` and the major version is `v20250312`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kube::core::GroupVersionKind;
use refmap_core::Document;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("binding not found: no version {version:?} in {kind} CRD")]
    VersionNotFound { kind: String, version: String },
    #[error("missing version {version:?} schema from {kind} spec")]
    MissingSchema { kind: String, version: String },
    #[error("missing version {version:?} OpenAPI properties from {kind} spec")]
    MissingProperties { kind: String, version: String },
    #[error("kind {kind} schema is missing an object field \"spec\"")]
    MissingSpec { kind: String },
    #[error("failed to match the CRD spec version {major:?} in {kind} schema")]
    MajorVersionAbsent { kind: String, major: String },
    #[error("failed to marshal CRD schema to JSON: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to compile CRD schema: {0}")]
    Compile(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub error: String,
    pub hint: Option<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        write!(f, "{}: {}", path, self.error)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("object validation failed against CRD schema: {}", join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ")
}

/// Return the version from the CRD spec that matches `version`, or the first
/// one when `version` is empty.
pub fn select_version<'a>(
    spec: &'a apiextv1::CustomResourceDefinitionSpec,
    version: &str,
) -> Option<&'a apiextv1::CustomResourceDefinitionVersion> {
    if version.is_empty() {
        return spec.versions.first();
    }
    spec.versions.iter().find(|v| v.name == version)
}

/// A CRD version pinned to one API major version, with its compiled validator.
/// Immutable once built; clones share the validator.
#[derive(Clone)]
pub struct SchemaBinding {
    major_version: String,
    gvk: GroupVersionKind,
    validator: Arc<JSONSchema>,
    annotations: BTreeMap<String, String>,
}

impl fmt::Debug for SchemaBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaBinding")
            .field("major_version", &self.major_version)
            .field("gvk", &self.gvk)
            .field("annotations", &self.annotations)
            .finish_non_exhaustive()
    }
}

impl SchemaBinding {
    pub fn bind(crd: &apiextv1::CustomResourceDefinition, crd_version: &str, major_version: &str) -> Result<Self, BindError> {
        let kind = crd.spec.names.kind.clone();
        let version = select_version(&crd.spec, crd_version).ok_or_else(|| BindError::VersionNotFound {
            kind: kind.clone(),
            version: crd_version.to_string(),
        })?;
        let openapi = version
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.as_ref())
            .ok_or_else(|| BindError::MissingSchema { kind: kind.clone(), version: version.name.clone() })?;
        assert_major_version(openapi, &kind, &version.name, major_version)?;

        let schema = serde_json::to_value(openapi)?;
        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| BindError::Compile(e.to_string()))?;
        debug!(kind = %kind, version = %version.name, major = %major_version, "schema bound");

        Ok(Self {
            major_version: major_version.to_string(),
            gvk: GroupVersionKind { group: crd.spec.group.clone(), version: version.name.clone(), kind },
            validator: Arc::new(validator),
            annotations: crd.metadata.annotations.clone().unwrap_or_default(),
        })
    }

    /// Bind every major version in `majors` against the same CRD version.
    pub fn bind_all(
        crd: &apiextv1::CustomResourceDefinition,
        crd_version: &str,
        majors: &[&str],
    ) -> Result<BTreeMap<String, SchemaBinding>, BindError> {
        let mut out = BTreeMap::new();
        for major in majors {
            out.insert(major.to_string(), Self::bind(crd, crd_version, major)?);
        }
        Ok(out)
    }

    pub fn major_version(&self) -> &str { &self.major_version }

    /// Group, CRD version and kind of the bound resource.
    pub fn gvk(&self) -> &GroupVersionKind { &self.gvk }

    /// Annotation value from the CRD metadata; empty when absent.
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn validate(&self, doc: &Document) -> Result<(), ValidationError> {
        let issues: Vec<ValidationIssue> = match self.validator.validate(doc) {
            Ok(()) => return Ok(()),
            Err(errors) => errors
                .map(|err| {
                    let error = err.to_string();
                    ValidationIssue { path: err.instance_path.to_string(), hint: hint_for(&error), error }
                })
                .collect(),
        };
        Err(ValidationError { issues })
    }
}

fn hint_for(error: &str) -> Option<String> {
    // Message text only; error kinds differ across jsonschema releases
    if error.contains("required property") {
        Some("missing required field".into())
    } else if error.contains("type:") || error.contains("is not of type") {
        Some("mismatched type".into())
    } else if error.contains("enum") {
        Some("value not in allowed set".into())
    } else {
        None
    }
}

fn assert_major_version(openapi: &apiextv1::JSONSchemaProps, kind: &str, version: &str, major: &str) -> Result<(), BindError> {
    let props = openapi
        .properties
        .as_ref()
        .ok_or_else(|| BindError::MissingProperties { kind: kind.to_string(), version: version.to_string() })?;
    let spec = props
        .get("spec")
        .filter(|s| s.type_.as_deref() == Some("object"))
        .ok_or_else(|| BindError::MissingSpec { kind: kind.to_string() })?;
    let present = spec.properties.as_ref().map(|p| p.contains_key(major)).unwrap_or(false);
    if !present {
        return Err(BindError::MajorVersionAbsent { kind: kind.to_string(), major: major.to_string() });
    }
    Ok(())
}
