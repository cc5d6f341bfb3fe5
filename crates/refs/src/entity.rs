//! External entities: the Kubernetes objects references point at.

use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use refmap_core::Document;
use serde_json::Value;

use crate::TypeIdentity;

/// Namespace and name of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(str::to_owned), name: name.to_owned() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Entity {
    Secret(Secret),
    ConfigMap(ConfigMap),
    /// Any other kind, custom resources included.
    Dynamic(DynamicObject),
}

impl Entity {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Entity::Secret(s) => &s.metadata,
            Entity::ConfigMap(c) => &c.metadata,
            Entity::Dynamic(d) => &d.metadata,
        }
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Entity::Secret(s) => &mut s.metadata,
            Entity::ConfigMap(c) => &mut c.metadata,
            Entity::Dynamic(d) => &mut d.metadata,
        }
    }

    pub fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> Option<&str> { self.meta().namespace.as_deref() }
    pub fn set_name(&mut self, name: impl Into<String>) { self.meta_mut().name = Some(name.into()); }
    pub fn set_namespace(&mut self, namespace: Option<String>) { self.meta_mut().namespace = namespace; }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.namespace(), self.name()) }

    /// Group, version and kind of the entity. The resource is only known for
    /// built-in kinds.
    pub fn type_identity(&self) -> TypeIdentity {
        match self {
            Entity::Secret(_) => TypeIdentity::new("", "v1", "Secret", "secrets"),
            Entity::ConfigMap(_) => TypeIdentity::new("", "v1", "ConfigMap", "configmaps"),
            Entity::Dynamic(d) => match &d.types {
                Some(tm) => {
                    let (group, version) = tm.api_version.split_once('/').unwrap_or(("", tm.api_version.as_str()));
                    TypeIdentity::new(group, version, &tm.kind, "")
                }
                None => TypeIdentity::default(),
            },
        }
    }

    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        match self {
            Entity::Secret(s) => serde_json::to_value(s),
            Entity::ConfigMap(c) => serde_json::to_value(c),
            Entity::Dynamic(d) => serde_json::to_value(d),
        }
    }

    /// Typed entity from its document form, dispatching on `apiVersion`/`kind`.
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        let api_version = doc.get("apiVersion").and_then(Value::as_str).unwrap_or("");
        let kind = doc.get("kind").and_then(Value::as_str).unwrap_or("");
        match (api_version, kind) {
            ("v1", "Secret") => serde_json::from_value(doc).map(Entity::Secret),
            ("v1", "ConfigMap") => serde_json::from_value(doc).map(Entity::ConfigMap),
            _ => serde_json::from_value(doc).map(Entity::Dynamic),
        }
    }
}

/// Constructor for entities of one registered type.
#[derive(Debug, Clone)]
pub enum EntityKind {
    Secret,
    ConfigMap,
    Custom(ApiResource),
}

impl EntityKind {
    /// An entity of this kind with nothing but its type set.
    pub fn empty(&self) -> Entity {
        match self {
            EntityKind::Secret => Entity::Secret(Secret::default()),
            EntityKind::ConfigMap => Entity::ConfigMap(ConfigMap::default()),
            EntityKind::Custom(ar) => Entity::Dynamic(DynamicObject {
                types: Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() }),
                metadata: ObjectMeta::default(),
                data: Value::Object(Default::default()),
            }),
        }
    }

    /// Build the typed entity from `doc`; fields the type does not know are dropped.
    pub fn materialize(&self, doc: Document) -> Result<Entity, serde_json::Error> {
        match self {
            EntityKind::Secret => serde_json::from_value(doc).map(Entity::Secret),
            EntityKind::ConfigMap => serde_json::from_value(doc).map(Entity::ConfigMap),
            EntityKind::Custom(_) => serde_json::from_value(doc).map(Entity::Dynamic),
        }
    }
}
