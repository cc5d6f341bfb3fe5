#![forbid(unsafe_code)]

use kube::core::{ApiResource, GroupVersionKind};
use refmap_refs::{Capabilities, Entity, EntityContext, EntityKind, Handler, MappingTree, ObjectKey, RefError};
use serde_json::{json, Value};

const GROUPS_GVR: &str = "atlas.generated.mongodb.com/v1/groups";

const MAPPINGS: &str = r#"
properties:
  spec:
    properties:
      v1:
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
              propertySelectors: [$.status.id]
              type: { group: atlas.generated.mongodb.com, kind: Group, resource: groups, version: v1 }
            x-openapi-mapping:
              property: .groupId
          credentials:
            items:
              properties:
                apiKeyRef:
                  x-kubernetes-mapping:
                    nameSelector: .name
                    propertySelectors: [$.data.#]
                    type: { kind: Secret, resource: secrets, version: v1 }
                  x-openapi-mapping:
                    property: .apiKey
                    type: string
"#;

fn mappings() -> MappingTree { MappingTree::parse_yaml(MAPPINGS).expect("mappings parse") }

fn caps() -> Capabilities {
    let gvk = GroupVersionKind::gvk("atlas.generated.mongodb.com", "v1", "Group");
    Capabilities::default().with_kind(GROUPS_GVR, EntityKind::Custom(ApiResource::from_gvk_with_plural(&gvk, "groups")))
}

fn main_key(name: &str) -> ObjectKey { ObjectKey::new(Some("ns"), name) }

fn group(name: &str, id: &str) -> Entity {
    Entity::from_document(json!({
        "apiVersion": "atlas.generated.mongodb.com/v1",
        "kind": "Group",
        "metadata": {"name": name, "namespace": "ns"},
        "status": {"id": id}
    }))
    .unwrap()
}

fn expand(caps: &Capabilities, main: &str, deps: Vec<Entity>, doc: &mut Value, path: &[&str]) -> Result<Vec<Entity>, RefError> {
    let mut h = Handler::new(caps, EntityContext::new(main_key(main), deps));
    h.expand_references(doc, &mappings(), path)?;
    Ok(h.into_added())
}

fn collapse(caps: &Capabilities, main: &str, deps: Vec<Entity>, doc: &mut Value, path: &[&str]) -> Result<(), RefError> {
    let mut h = Handler::new(caps, EntityContext::new(main_key(main), deps));
    h.collapse_references(doc, &mappings(), path)
}

#[test]
fn password_moves_into_a_secret() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"password": "s3cr3t", "username": "alice"}}});
    let added = expand(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap();

    assert_eq!(
        doc,
        json!({"spec": {"v1": {
            "passwordSecretRef": {"name": "my-user-9855c5d7f87947cfd44", "key": "password"},
            "username": "alice"
        }}})
    );
    assert_eq!(added.len(), 1);
    let secret = added[0].to_document().unwrap();
    assert_eq!(secret["kind"], json!("Secret"));
    assert_eq!(secret["metadata"]["name"], json!("my-user-9855c5d7f87947cfd44"));
    assert_eq!(secret["metadata"]["namespace"], json!("ns"));
    assert_eq!(secret["data"]["password"], json!("czNjcjN0"));
}

#[test]
fn collapse_restores_the_inline_password() {
    let caps = caps();
    let original = json!({"spec": {"v1": {"password": "s3cr3t"}}});
    let mut doc = original.clone();
    let added = expand(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap();

    collapse(&caps, "my-user", added, &mut doc, &["spec", "v1"]).unwrap();
    assert_eq!(doc["spec"]["v1"]["password"], json!("s3cr3t"));

    doc["spec"]["v1"].as_object_mut().unwrap().remove("passwordSecretRef");
    assert_eq!(doc, original);
}

#[test]
fn unicode_and_empty_values_survive_the_round_trip() {
    let caps = caps();
    for value in ["", "p@ss:w0rd/with;punct!?", "héllo, wörld! ✓"] {
        let mut doc = json!({"spec": {"v1": {"password": value}}});
        let added = expand(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap();
        collapse(&caps, "my-user", added, &mut doc, &["spec", "v1"]).unwrap();
        assert_eq!(doc["spec"]["v1"]["password"], json!(value));
    }
}

#[test]
fn expand_is_idempotent() {
    let caps = caps();
    let mut h = Handler::new(&caps, EntityContext::new(main_key("my-user"), vec![]));
    let tree = mappings();

    let mut doc = json!({"spec": {"v1": {"password": "s3cr3t"}}});
    h.expand_references(&mut doc, &tree, &["spec", "v1"]).unwrap();
    let once = doc.clone();
    h.expand_references(&mut doc, &tree, &["spec", "v1"]).unwrap();
    assert_eq!(doc, once);

    // A second copy of the same input resolves to the already known entity
    let mut copy = json!({"spec": {"v1": {"password": "s3cr3t"}}});
    h.expand_references(&mut copy, &tree, &["spec", "v1"]).unwrap();
    assert_eq!(copy, json!({"spec": {"v1": {"password": "s3cr3t"}}}));
    assert_eq!(h.added().len(), 1);
}

#[test]
fn list_items_are_matched_by_field() {
    let caps = caps();
    let mut doc = json!({"spec": {"credentials": [{"apiKey": "the-real-key"}, {"other": 1}]}});
    let tree = MappingTree::from_document(&json!({"properties": {"spec": {"properties": {"credentials": {
        "items": {"properties": {"apiKeyRef": {
            "x-kubernetes-mapping": {
                "nameSelector": ".name",
                "propertySelectors": ["$.data.#"],
                "type": {"kind": "Secret", "resource": "secrets", "version": "v1"}
            },
            "x-openapi-mapping": {"property": ".apiKey", "type": "string"}
        }}}
    }}}}}))
    .unwrap();

    let mut h = Handler::new(&caps, EntityContext::new(main_key("main"), vec![]));
    h.expand_references(&mut doc, &tree, &["spec"]).unwrap();
    assert_eq!(
        doc["spec"]["credentials"],
        json!([{"apiKeyRef": {"name": "main-89467cc86dbc9c79fdb", "key": "apiKey"}}, {"other": 1}])
    );
    let added = h.into_added();
    assert_eq!(added[0].to_document().unwrap()["data"]["apiKey"], json!("dGhlLXJlYWwta2V5"));

    let mut h = Handler::new(&caps, EntityContext::new(main_key("main"), added));
    h.collapse_references(&mut doc, &tree, &["spec"]).unwrap();
    assert_eq!(doc["spec"]["credentials"][0]["apiKey"], json!("the-real-key"));
}

#[test]
fn ambiguous_list_items_fail() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"credentials": [{"apiKey": "a"}, {"apiKey": "b"}]}}});
    let err = expand(&caps, "main", vec![], &mut doc, &["spec", "v1"]).unwrap_err();
    assert!(matches!(err.root(), RefError::AmbiguousMatch { count: 2, .. }), "err={}", err);
}

#[test]
fn unmatched_list_items_are_skipped() {
    let caps = caps();
    let input = json!({"spec": {"v1": {"credentials": [{"other": "a"}]}}});
    let mut doc = input.clone();
    let added = expand(&caps, "main", vec![], &mut doc, &["spec", "v1"]).unwrap();
    assert!(added.is_empty());
    assert_eq!(doc, input);
}

#[test]
fn existing_dependency_is_referenced_instead_of_created() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"groupId": "g-123"}}});
    let added = expand(&caps, "my-user", vec![group("my-group", "g-123")], &mut doc, &["spec", "v1"]).unwrap();
    assert!(added.is_empty());
    assert_eq!(doc, json!({"spec": {"v1": {"groupRef": {"name": "my-group"}}}}));

    collapse(&caps, "my-user", vec![group("my-group", "g-123")], &mut doc, &["spec", "v1"]).unwrap();
    assert_eq!(doc["spec"]["v1"]["groupId"], json!("g-123"));
}

#[test]
fn unknown_group_id_creates_a_group() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"groupId": "g-999"}}});
    let added = expand(&caps, "my-user", vec![group("my-group", "g-123")], &mut doc, &["spec", "v1"]).unwrap();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].name(), "my-user-557cfffb8c5bb65789");
    assert_eq!(added[0].to_document().unwrap()["status"]["id"], json!("g-999"));
    assert_eq!(doc["spec"]["v1"]["groupRef"]["key"], json!("groupId"));
}

#[test]
fn optional_references_tolerate_unpersisted_values() {
    let yaml = r#"
properties:
  spec:
    properties:
      groupRef:
        x-kubernetes-mapping:
          nameSelector: .name
          propertySelectors: [$.metadata.bogus.#]
          type: { kind: Secret, resource: secrets, version: v1 }
        x-openapi-mapping:
          property: .groupId
"#;
    let tree = MappingTree::parse_yaml(yaml).unwrap();
    let input = json!({"spec": {"groupId": "abc"}});

    let strict = Capabilities::default();
    let mut doc = input.clone();
    let mut h = Handler::new(&strict, EntityContext::new(main_key("main"), vec![]));
    let err = h.expand_references(&mut doc, &tree, &["spec"]).unwrap_err();
    assert!(matches!(err.root(), RefError::NoMatchingSelector), "err={}", err);

    let lenient = Capabilities::default().with_optional_expansion("groupRef");
    let mut doc = input.clone();
    let mut h = Handler::new(&lenient, EntityContext::new(main_key("main"), vec![]));
    h.expand_references(&mut doc, &tree, &["spec"]).unwrap();
    assert_eq!(doc, input);
    assert!(h.added().is_empty());

    let marked = MappingTree::parse_yaml(&yaml.replace("nameSelector: .name", "nameSelector: .name\n          optional: true"))
        .unwrap();
    let mut doc = input.clone();
    let mut h = Handler::new(&strict, EntityContext::new(main_key("main"), vec![]));
    h.expand_references(&mut doc, &marked, &["spec"]).unwrap();
    assert_eq!(doc, input);
}

#[test]
fn unregistered_kinds_cannot_be_expanded() {
    let mut doc = json!({"spec": {"v1": {"groupId": "g-1"}}});
    let err = expand(&Capabilities::default(), "main", vec![], &mut doc, &["spec", "v1"]).unwrap_err();
    assert!(matches!(err.root(), RefError::UnknownEntityType(gvr) if gvr == GROUPS_GVR), "err={}", err);
}

#[test]
fn collapse_requires_a_known_entity_of_the_right_type() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"passwordSecretRef": {"name": "missing"}}}});
    let err = collapse(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap_err();
    assert!(matches!(err.root(), RefError::UnresolvedReference(msg) if msg.contains("missing")), "err={}", err);

    let mut doc = json!({"spec": {"v1": {"passwordSecretRef": {"name": "my-group"}}}});
    let err = collapse(&caps, "my-user", vec![group("my-group", "g-1")], &mut doc, &["spec", "v1"]).unwrap_err();
    assert!(matches!(err.root(), RefError::UnresolvedReference(msg) if msg.contains("had to be")), "err={}", err);
}

#[test]
fn collapse_never_overwrites_inline_values() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"password": "s3cr3t"}}});
    let added = expand(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap();
    doc["spec"]["v1"]["password"] = json!("inline");
    let err = collapse(&caps, "my-user", added, &mut doc, &["spec", "v1"]).unwrap_err();
    assert!(matches!(err.root(), RefError::Document(e) if matches!(e, refmap_core::DocError::AlreadyExists { .. })));
}

#[test]
fn empty_or_absent_references_are_no_ops() {
    let caps = caps();
    let input = json!({"spec": {"v1": {"passwordSecretRef": {}, "username": "alice"}}});
    let mut doc = input.clone();
    collapse(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap();
    assert_eq!(doc, input);
}

#[test]
fn paths_without_mappings_are_untouched() {
    let caps = caps();
    let input = json!({"status": {"v1": {"password": "s3cr3t"}}});
    let mut doc = input.clone();
    let added = expand(&caps, "my-user", vec![], &mut doc, &["status", "v1"]).unwrap();
    assert!(added.is_empty());
    assert_eq!(doc, input);

    // Mapped path missing from the data is an error
    let mut doc = json!({"status": {}});
    let err = expand(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap_err();
    assert!(matches!(err.root(), RefError::Document(e) if e.is_not_found()), "err={}", err);
}

#[test]
fn scalars_under_container_mappings_are_rejected() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": "flat"}});
    let err = expand(&caps, "main", vec![], &mut doc, &["spec"]).unwrap_err();
    assert!(matches!(err.root(), RefError::UnsupportedMapping(_)), "err={}", err);
}

#[test]
fn recopied_value_next_to_its_reference_is_dropped() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"password": "s3cr3t"}}});
    let added = expand(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap();
    let reference = doc["spec"]["v1"]["passwordSecretRef"].clone();

    // The payload lands again beside the reference written last time
    doc["spec"]["v1"]["password"] = json!("s3cr3t");
    let again = expand(&caps, "my-user", added.clone(), &mut doc, &["spec", "v1"]).unwrap();
    assert!(again.is_empty());
    assert_eq!(doc, json!({"spec": {"v1": {"passwordSecretRef": reference}}}));

    collapse(&caps, "my-user", added, &mut doc, &["spec", "v1"]).unwrap();
    assert_eq!(doc["spec"]["v1"]["password"], json!("s3cr3t"));
}

#[test]
fn value_pointing_elsewhere_is_left_inline() {
    let caps = caps();
    let mut doc = json!({"spec": {"v1": {"password": "s3cr3t"}}});
    let added = expand(&caps, "my-user", vec![], &mut doc, &["spec", "v1"]).unwrap();

    let mut other = json!({"spec": {"v1": {"password": "s3cr3t", "passwordSecretRef": {"name": "hand-made"}}}});
    let before = other.clone();
    expand(&caps, "my-user", added, &mut other, &["spec", "v1"]).unwrap();
    assert_eq!(other, before);
}

const UNSUPPORTED_MAPPINGS: &str = r#"
properties:
  spec:
    properties:
      foo:
        type: object
      creds:
        items:
          properties:
            apiKey:
              type: string
"#;

fn expand_unsupported(doc: &mut Value) -> RefError {
    let caps = caps();
    let tree = MappingTree::parse_yaml(UNSUPPORTED_MAPPINGS).unwrap();
    let mut h = Handler::new(&caps, EntityContext::new(main_key("main"), vec![]));
    h.expand_references(doc, &tree, &["spec"]).unwrap_err()
}

#[test]
fn objects_under_plain_mappings_are_rejected() {
    let mut doc = json!({"spec": {"foo": {"a": 1}}});
    let err = expand_unsupported(&mut doc);
    assert!(matches!(err.root(), RefError::UnsupportedMapping(_)), "err={}", err);
    assert!(err.to_string().contains("unsupported extension"), "err={}", err);
}

#[test]
fn list_items_under_plain_mappings_are_rejected() {
    let mut doc = json!({"spec": {"creds": [{"apiKey": "k"}]}});
    let err = expand_unsupported(&mut doc);
    assert!(matches!(err.root(), RefError::UnsupportedMapping(_)), "err={}", err);

    // Items without the mapped field are skipped
    let mut doc = json!({"spec": {"creds": [{"other": "k"}]}});
    let tree = MappingTree::parse_yaml(UNSUPPORTED_MAPPINGS).unwrap();
    let caps = caps();
    let mut h = Handler::new(&caps, EntityContext::new(main_key("main"), vec![]));
    h.expand_references(&mut doc, &tree, &["spec"]).unwrap();
}
