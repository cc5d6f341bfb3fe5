//! Reference mapping model: the `api-mappings` document parsed once into a tree.

use std::collections::BTreeMap;
use std::fmt;

use refmap_core::{Object, Path};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RefError, KUBE_MAPPING_KEY, OPENAPI_MAPPING_KEY, PROPERTY_SELECTOR_SUFFIX};

/// Kubernetes type of a referenced entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeIdentity {
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    #[serde(default)]
    pub version: String,
}

impl TypeIdentity {
    pub fn new(group: &str, version: &str, kind: &str, resource: &str) -> Self {
        Self { kind: kind.into(), group: group.into(), resource: resource.into(), version: version.into() }
    }

    /// `group/version` or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String { format!("{}/{}", self.api_version(), self.kind) }

    pub fn gvr_key(&self) -> String { format!("{}/{}", self.api_version(), self.resource) }

    /// Structural equality over group, version and kind.
    pub fn matches(&self, other: &TypeIdentity) -> bool {
        self.group == other.group && self.version == other.version && self.kind == other.kind
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.gvk_key()) }
}

/// `x-kubernetes-mapping`: where the value lives on the Kubernetes side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeMapping {
    #[serde(default)]
    pub name_selector: String,
    #[serde(default)]
    pub property_selectors: Vec<String>,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default, rename = "type")]
    pub type_: TypeIdentity,
    /// Tolerate expansions where no selector persists the value.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl KubeMapping {
    /// Concrete path of a selector template, `.#` replaced with `.{field}`.
    pub fn selector_path(selector: &str, field: &str) -> Path {
        match selector.strip_suffix(PROPERTY_SELECTOR_SUFFIX) {
            Some(prefix) => Path::parse_xpath(&format!("{}.{}", prefix, field)),
            None => Path::parse_xpath(selector),
        }
    }
}

/// `x-openapi-mapping`: where the value lives on the API side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenApiMapping {
    #[serde(default)]
    pub property: String,
    #[serde(default, rename = "type")]
    pub content_type: String,
}

impl OpenApiMapping {
    pub fn target_path(&self) -> Path { Path::parse_xpath(&self.property) }

    /// Base field name of the API property; empty when no property is declared.
    pub fn target_field(&self) -> String { self.target_path().base().unwrap_or_default().to_owned() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDescriptor {
    #[serde(rename = "x-kubernetes-mapping")]
    pub kube: KubeMapping,
    #[serde(rename = "x-openapi-mapping")]
    pub openapi: OpenApiMapping,
}

/// A mapping node is a reference when both marker blocks are present and non-null.
pub fn is_reference(node: &Object) -> bool {
    let present = |k: &str| node.get(k).map(|v| !v.is_null()).unwrap_or(false);
    present(KUBE_MAPPING_KEY) && present(OPENAPI_MAPPING_KEY)
}

pub type MappingProps = BTreeMap<String, MappingNode>;

#[derive(Debug, Clone, PartialEq)]
pub enum MappingNode {
    Reference(Box<ReferenceDescriptor>),
    /// Nested `properties`.
    Object(MappingProps),
    /// Per-item `items.properties` of a list field.
    Array(MappingProps),
    /// Neither a reference nor a container; kept to report the authoring error
    /// when data actually reaches it.
    Unsupported { fields: Vec<String> },
}

/// A reference field found in a mapping tree, for listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSite<'a> {
    /// Data path of the reference field; list items show up as `[]`.
    pub path: Path,
    pub descriptor: &'a ReferenceDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTree {
    root: MappingProps,
}

impl MappingTree {
    pub fn parse_yaml(text: &str) -> Result<Self, RefError> {
        let doc: Value =
            serde_yaml::from_str(text).map_err(|e| RefError::InvalidMapping(format!("mappings YAML: {}", e)))?;
        Self::from_document(&doc)
    }

    pub fn from_document(doc: &Value) -> Result<Self, RefError> {
        let root = match doc {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => return Err(RefError::InvalidMapping("mappings document must be a map".into())),
        };
        let root = match root.get("properties") {
            None | Some(Value::Null) => MappingProps::new(),
            Some(Value::Object(props)) => parse_props(&Path::root(), props)?,
            Some(_) => return Err(RefError::InvalidMapping("top level properties must be a map".into())),
        };
        Ok(Self { root })
    }

    pub fn is_empty(&self) -> bool { self.root.is_empty() }

    /// Properties declared under the data path `path`. `None` when the path
    /// carries no mappings.
    pub fn props_at<S: AsRef<str>>(&self, path: &[S]) -> Result<Option<&MappingProps>, RefError> {
        let mut cur = &self.root;
        for (i, seg) in path.iter().enumerate() {
            cur = match cur.get(seg.as_ref()) {
                None => return Ok(None),
                Some(MappingNode::Object(props)) => props,
                Some(_) => {
                    let at: Path = path[..=i].iter().map(|s| s.as_ref()).collect();
                    return Err(RefError::UnsupportedMapping(format!("mapping at {} has no properties", at)));
                }
            };
        }
        Ok(Some(cur))
    }

    /// Every reference field of the tree, in key order.
    pub fn reference_sites(&self) -> Vec<ReferenceSite<'_>> {
        let mut out = Vec::new();
        collect_sites(&Path::root(), &self.root, &mut out);
        out
    }
}

fn collect_sites<'a>(path: &Path, props: &'a MappingProps, out: &mut Vec<ReferenceSite<'a>>) {
    for (key, node) in props {
        let sub = path.child(key.as_str());
        match node {
            MappingNode::Reference(desc) => out.push(ReferenceSite { path: sub, descriptor: desc }),
            MappingNode::Object(nested) => collect_sites(&sub, nested, out),
            MappingNode::Array(items) => collect_sites(&sub.child("[]"), items, out),
            MappingNode::Unsupported { .. } => {}
        }
    }
}

fn parse_props(path: &Path, props: &Object) -> Result<MappingProps, RefError> {
    let mut out = MappingProps::new();
    for (key, raw) in props {
        // Non-map entries carry no mapping information
        let Some(node) = raw.as_object() else { continue };
        out.insert(key.clone(), parse_node(&path.child(key.as_str()), node)?);
    }
    Ok(out)
}

fn parse_node(path: &Path, node: &Object) -> Result<MappingNode, RefError> {
    if is_reference(node) {
        let desc: ReferenceDescriptor = serde_json::from_value(Value::Object(node.clone()))
            .map_err(|e| RefError::InvalidMapping(format!("reference at {}: {}", path, e)))?;
        return Ok(MappingNode::Reference(Box::new(desc)));
    }
    match node.get("properties") {
        None | Some(Value::Null) => {}
        Some(Value::Object(props)) => return Ok(MappingNode::Object(parse_props(path, props)?)),
        Some(_) => return Err(RefError::InvalidMapping(format!("properties at {} must be a map", path))),
    }
    if let Some(items) = node.get("items").and_then(|i| i.get("properties")).and_then(Value::as_object) {
        return Ok(MappingNode::Array(parse_props(&path.child("[]"), items)?));
    }
    Ok(MappingNode::Unsupported { fields: node.keys().cloned().collect() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAPPINGS: &str = r#"
properties:
  spec:
    properties:
      v20250312:
        properties:
          passwordSecretRef:
            x-kubernetes-mapping:
              nameSelector: .name
              propertySelectors: [$.data.#]
              type: { kind: Secret, resource: secrets, version: v1 }
            x-openapi-mapping:
              property: .password
              type: string
          groupRef:
            x-kubernetes-mapping:
              nameSelector: .name
              properties: [$.status.id]
              type: { group: atlas.generated.mongodb.com, kind: Group, resource: groups, version: v1 }
            x-openapi-mapping:
              property: .groupId
          scopes:
            items:
              properties:
                name: { type: string }
"#;

    #[test]
    fn type_identity_keys() {
        let secret = TypeIdentity::new("", "v1", "Secret", "secrets");
        assert_eq!(secret.gvk_key(), "v1/Secret");
        assert_eq!(secret.gvr_key(), "v1/secrets");
        let group = TypeIdentity::new("atlas.generated.mongodb.com", "v1", "Group", "groups");
        assert_eq!(group.gvr_key(), "atlas.generated.mongodb.com/v1/groups");
        assert_eq!(group.to_string(), "atlas.generated.mongodb.com/v1/Group");
        assert!(group.matches(&TypeIdentity::new("atlas.generated.mongodb.com", "v1", "Group", "")));
        assert!(!group.matches(&secret));
    }

    #[test]
    fn reference_needs_both_markers() {
        let both = json!({"x-kubernetes-mapping": {}, "x-openapi-mapping": {}});
        let one = json!({"x-kubernetes-mapping": {}});
        let null = json!({"x-kubernetes-mapping": {}, "x-openapi-mapping": null});
        assert!(is_reference(both.as_object().unwrap()));
        assert!(!is_reference(one.as_object().unwrap()));
        assert!(!is_reference(null.as_object().unwrap()));
    }

    #[test]
    fn selector_templates_take_field_name() {
        assert_eq!(KubeMapping::selector_path("$.data.#", "password"), Path::parse("data.password"));
        assert_eq!(KubeMapping::selector_path("$.status.id", "password"), Path::parse("status.id"));
    }

    #[test]
    fn parses_tree_and_lists_sites() {
        let tree = MappingTree::parse_yaml(MAPPINGS).unwrap();
        let props = tree.props_at(&["spec", "v20250312"]).unwrap().unwrap();
        assert_eq!(props.len(), 3);
        match &props["passwordSecretRef"] {
            MappingNode::Reference(desc) => {
                assert_eq!(desc.kube.type_.gvr_key(), "v1/secrets");
                assert_eq!(desc.openapi.target_field(), "password");
                assert_eq!(desc.openapi.content_type, "string");
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert!(matches!(props["scopes"], MappingNode::Array(_)));
        assert!(tree.props_at(&["spec", "v20990101"]).unwrap().is_none());
        assert!(tree.props_at(&["spec", "v20250312", "groupRef"]).is_err());

        let sites: Vec<String> = tree.reference_sites().iter().map(|s| s.path.to_string()).collect();
        assert_eq!(sites, vec!["spec.v20250312.groupRef", "spec.v20250312.passwordSecretRef"]);
    }

    #[test]
    fn malformed_reference_fails_at_parse_time() {
        let doc = json!({"properties": {"spec": {"properties": {"ref": {
            "x-kubernetes-mapping": {"propertySelectors": "not-a-list"},
            "x-openapi-mapping": {"property": ".x"}
        }}}}});
        let err = MappingTree::from_document(&doc).unwrap_err();
        assert!(matches!(err, RefError::InvalidMapping(_)), "err={}", err);
    }

    #[test]
    fn empty_documents_give_empty_trees() {
        assert!(MappingTree::parse_yaml("{}").unwrap().is_empty());
        assert!(MappingTree::from_document(&Value::Null).unwrap().is_empty());
    }
}
