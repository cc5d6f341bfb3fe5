//! Reference resolution: a recursive co-walk of a document and its mapping
//! tree that expands inline values into entities or collapses references back.

use metrics::counter;
use refmap_core::{create, create_in, get, get_in, get_object_mut, type_name, DocError, Document, Object, Path};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    entity_name, Breadcrumb, Capabilities, Entity, EntityContext, EntityKind, KubeMapping, MappingNode,
    MappingProps, MappingTree, RefError, ReferenceDescriptor, KUBE_MAPPING_KEY, REF_KEY, REF_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inline API values move out into entities; references take their place.
    Expand,
    /// References are replaced with the values they point at.
    Collapse,
}

impl Direction {
    fn verb(self) -> &'static str {
        match self {
            Direction::Expand => "expand",
            Direction::Collapse => "collapse",
        }
    }
}

/// One engine instance per translation call; it owns the call's entity context.
#[derive(Debug)]
pub struct Handler<'c> {
    ctx: EntityContext,
    caps: &'c Capabilities,
    direction: Direction,
}

impl<'c> Handler<'c> {
    pub fn new(caps: &'c Capabilities, ctx: EntityContext) -> Self {
        Self { ctx, caps, direction: Direction::Collapse }
    }

    /// Expand every reference mapped under `path` of `doc`.
    pub fn expand_references<S: AsRef<str>>(
        &mut self,
        doc: &mut Document,
        mappings: &MappingTree,
        path: &[S],
    ) -> Result<(), RefError> {
        self.run(Direction::Expand, doc, mappings, path)
    }

    /// Collapse every reference mapped under `path` of `doc`.
    pub fn collapse_references<S: AsRef<str>>(
        &mut self,
        doc: &mut Document,
        mappings: &MappingTree,
        path: &[S],
    ) -> Result<(), RefError> {
        self.run(Direction::Collapse, doc, mappings, path)
    }

    pub fn context(&self) -> &EntityContext { &self.ctx }

    /// Entities created by expansion so far, in creation order.
    pub fn added(&self) -> &[Entity] { self.ctx.added() }

    pub fn into_added(self) -> Vec<Entity> { self.ctx.into_added() }

    fn run<S: AsRef<str>>(
        &mut self,
        direction: Direction,
        doc: &mut Document,
        mappings: &MappingTree,
        path: &[S],
    ) -> Result<(), RefError> {
        self.direction = direction;
        let at: Path = path.iter().map(|s| s.as_ref()).collect();
        let Some(props) = mappings.props_at(path).at(|| format!("failed to access mappings at {}", at))? else {
            return Ok(());
        };
        let holder = get_object_mut(doc, path).at(|| format!("failed to access object's {}", at))?;
        self.scan_properties(&Path::root(), props, holder)
            .at(|| format!("failed to {} references at {}", direction.verb(), at))
    }

    fn scan_properties(&mut self, path: &Path, props: &MappingProps, holder: &mut Object) -> Result<(), RefError> {
        for (key, node) in props {
            let sub = path.child(key.as_str());
            if let MappingNode::Reference(desc) = node {
                self.process_reference(&sub, key, desc, holder)
                    .at(|| format!("failed to process reference {}", sub))?;
                continue;
            }
            match holder.get_mut(key.as_str()) {
                // Optional fields may be absent
                None | Some(Value::Null) => continue,
                Some(Value::Array(list)) => {
                    self.scan_array(&sub, node, list).at(|| format!("failed to process array mapping {:?}", key))?
                }
                Some(Value::Object(obj)) => {
                    self.scan_object(&sub, key, node, obj).at(|| format!("failed to process object mapping {:?}", key))?
                }
                Some(other) => {
                    return Err(RefError::UnsupportedMapping(format!(
                        "unsupported mapping of type {} at {}",
                        type_name(other),
                        sub
                    )))
                }
            }
        }
        Ok(())
    }

    /// List items are told apart by the fields they carry: each item mapping
    /// applies to the single element holding its key.
    fn scan_array(&mut self, path: &Path, node: &MappingNode, list: &mut [Value]) -> Result<(), RefError> {
        let MappingNode::Array(items) = node else {
            return Err(RefError::InvalidMapping(format!("list field {} has no items.properties mapping", path)));
        };
        for (map_name, item) in items {
            // Expanding looks for the inline API field, collapsing for the reference field
            let key = match (self.direction, item) {
                (Direction::Expand, MappingNode::Reference(desc)) => desc.openapi.target_field(),
                _ => map_name.clone(),
            };
            let Some(idx) = unique_element(list, &key)? else { continue };
            if let Some(Value::Object(element)) = list.get_mut(idx) {
                let sub = path.child(key.as_str());
                self.scan_object(&sub, map_name, item, element)
                    .at(|| format!("failed to map property from array item {:?} at {}", key, path))?;
            }
        }
        Ok(())
    }

    fn scan_object(&mut self, path: &Path, map_name: &str, node: &MappingNode, obj: &mut Object) -> Result<(), RefError> {
        match node {
            MappingNode::Object(props) => self.scan_properties(path, props, obj),
            MappingNode::Reference(desc) => self.process_reference(path, map_name, desc, obj),
            MappingNode::Array(_) => {
                Err(RefError::UnsupportedMapping(format!("unsupported extension at {} with fields [\"items\"]", path)))
            }
            MappingNode::Unsupported { fields } => {
                Err(RefError::UnsupportedMapping(format!("unsupported extension at {} with fields {:?}", path, fields)))
            }
        }
    }

    fn process_reference(
        &mut self,
        path: &Path,
        reference: &str,
        desc: &ReferenceDescriptor,
        holder: &mut Object,
    ) -> Result<(), RefError> {
        debug!(path = %path, reference = %reference, direction = ?self.direction, "processing reference");
        match self.direction {
            Direction::Expand => self.expand(path, reference, desc, holder),
            Direction::Collapse => self.collapse(path, desc, holder),
        }
    }

    fn expand(&mut self, hint: &Path, reference: &str, desc: &ReferenceDescriptor, holder: &mut Object) -> Result<(), RefError> {
        let caps = self.caps;
        // The hint names the reference field; the inline value sits under the API field name
        let field = desc.openapi.target_field();
        let path = hint.with_base(field.as_str());
        let raw = match holder.get(&field) {
            None | Some(Value::Null) => return Ok(()),
            Some(v) => v.clone(),
        };

        if let Some(existing) = self.matching_dependency(&desc.kube, &raw)? {
            debug!(reference = %reference, entity = %existing, "inline value matches an existing dependency");
            let mut payload = Object::new();
            payload.insert(REF_NAME.into(), Value::String(existing));
            holder.insert(reference.to_owned(), Value::Object(payload));
            if field != reference {
                holder.remove(&field);
            }
            counter!("refs_expanded_total", 1u64);
            return Ok(());
        }

        let value = match caps.codec_for(&desc.kube, &desc.openapi) {
            Some(codec) => codec.encode(&raw).at(|| format!("failed to encode value at {}", path))?,
            None => raw,
        };
        let gvr = desc.kube.type_.gvr_key();
        let kind = caps.kind_for(&gvr).ok_or_else(|| RefError::UnknownEntityType(gvr.clone()))?;
        let mut entity = match populate(kind, &desc.kube, &field, &value) {
            Ok(entity) => entity,
            Err(e) if desc.kube.optional || caps.is_optional_expansion(reference) => {
                warn!(reference = %reference, path = %path, error = %e, "optional reference left unexpanded");
                return Ok(());
            }
            Err(e) => return Err(e.at("failed to populate final dependency object")),
        };

        let name = entity_name(&self.ctx.main().name, &path);
        if self.ctx.has(&name) {
            debug!(reference = %reference, entity = %name, "reference already expanded");
            // A payload re-copied next to its own reference must not stay inline
            let points_here = holder
                .get(reference)
                .and_then(|r| r.get(REF_NAME))
                .and_then(Value::as_str)
                .map(|n| n == name)
                .unwrap_or(false);
            if points_here && field != reference {
                holder.remove(&field);
            }
            return Ok(());
        }
        entity.set_name(name.clone());
        entity.set_namespace(self.ctx.main().namespace.clone());

        let mut payload = Object::new();
        payload.insert(REF_NAME.into(), Value::String(name));
        if !desc.openapi.property.is_empty() {
            payload.insert(REF_KEY.into(), Value::String(field.clone()));
        }
        holder.insert(reference.to_owned(), Value::Object(payload));
        if field != reference {
            holder.remove(&field);
        }
        debug!(reference = %reference, entity = %entity.key(), gvr = %gvr, "entity created");
        self.ctx.add(entity);
        counter!("refs_expanded_total", 1u64);
        counter!("refs_entities_added_total", 1u64, "gvr" => gvr);
        Ok(())
    }

    /// Name of a dependency of the mapped type whose direct properties already
    /// hold `raw`.
    fn matching_dependency(&self, kube: &KubeMapping, raw: &Value) -> Result<Option<String>, RefError> {
        if kube.properties.is_empty() {
            return Ok(None);
        }
        for entity in self.ctx.in_scope() {
            if !kube.type_.matches(&entity.type_identity()) {
                continue;
            }
            let doc = entity.to_document()?;
            for prop in &kube.properties {
                let path = Path::parse_xpath(prop);
                match get::<&Value, _>(&doc, path.segments()) {
                    Ok(v) if v == raw => return Ok(Some(entity.name().to_owned())),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(RefError::from(e).at(format!("dependency {}", entity.key()))),
                }
            }
        }
        Ok(None)
    }

    fn collapse(&mut self, path: &Path, desc: &ReferenceDescriptor, holder: &mut Object) -> Result<(), RefError> {
        let field = path.base().unwrap_or_default();
        let reference = match holder.get(field) {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Object(r)) if r.is_empty() => return Ok(()),
            Some(Value::Object(r)) => r.clone(),
            Some(other) => {
                return Err(DocError::TypeMismatch { path: path.clone(), expected: "object", found: type_name(other) }.into())
            }
        };
        let target = desc.openapi.target_path();
        let key = reference
            .get(REF_KEY)
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| desc.openapi.target_field());
        let value = self.fetch_referenced_value(desc, &key, &reference).at(|| format!("failed to fetch referenced value {}", key))?;
        create_in(holder, value, target.segments())?;
        counter!("refs_collapsed_total", 1u64);
        Ok(())
    }

    fn fetch_referenced_value(&self, desc: &ReferenceDescriptor, key: &str, reference: &Object) -> Result<Value, RefError> {
        let kube = &desc.kube;
        if kube.name_selector.is_empty() {
            return Err(RefError::UnresolvedReference(format!(
                "cannot solve reference without a {}.nameSelector",
                KUBE_MAPPING_KEY
            )));
        }
        let selector = Path::parse_xpath(&kube.name_selector);
        let name: &str = get_in(reference, selector.segments())
            .at(|| format!("failed to access field {:?} of the reference", kube.name_selector))?;
        let entity = self
            .ctx
            .find(name)
            .ok_or_else(|| RefError::UnresolvedReference(format!("failed to find Kubernetes resource {:?}", name)))?;
        let actual = entity.type_identity();
        if !kube.type_.kind.is_empty() && !kube.type_.matches(&actual) {
            return Err(RefError::UnresolvedReference(format!(
                "resource {:?} had to be a {} but got {}",
                name, kube.type_, actual
            )));
        }

        let doc = entity.to_document()?;
        let from_properties = first_present(&doc, kube.properties.iter().map(|p| Path::parse_xpath(p)))?;
        let value = match from_properties {
            Some(v) => v,
            None => first_present(&doc, kube.property_selectors.iter().map(|s| KubeMapping::selector_path(s, key)))?
                .ok_or_else(|| {
                    RefError::UnresolvedReference(format!(
                        "failed to resolve reference properties or property selectors of {:?}",
                        name
                    ))
                })?,
        };
        match self.caps.codec_for(kube, &desc.openapi) {
            Some(codec) => codec.decode(&value),
            None => Ok(value),
        }
    }
}

/// Build an entity of `kind` holding `value` under the first selector that
/// survives a round trip through the typed object.
fn populate(kind: &EntityKind, kube: &KubeMapping, field: &str, value: &Value) -> Result<Entity, RefError> {
    let empty = kind.empty().to_document()?;
    for selector in &kube.property_selectors {
        let path = KubeMapping::selector_path(selector, field);
        let mut doc = empty.clone();
        create(&mut doc, value.clone(), path.segments()).at(|| format!("failed to set value at {}", path))?;
        let entity = kind.materialize(doc).at(|| "failed to initialize Kubernetes object".to_owned())?;
        let persisted = entity.to_document()?;
        match get::<&Value, _>(&persisted, path.segments()) {
            Ok(v) if v == value => return Ok(entity),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(RefError::from(e).at("failed to check Kubernetes object contents")),
        }
    }
    Err(RefError::NoMatchingSelector)
}

fn first_present(doc: &Value, paths: impl IntoIterator<Item = Path>) -> Result<Option<Value>, RefError> {
    for path in paths {
        match get::<&Value, _>(doc, path.segments()) {
            Ok(v) => return Ok(Some(v.clone())),
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(RefError::from(e).at(format!("failed to access property {}", path))),
        }
    }
    Ok(None)
}

/// Index of the one list element carrying `key`; `None` when no element does.
fn unique_element(list: &[Value], key: &str) -> Result<Option<usize>, RefError> {
    let hits: Vec<usize> = list
        .iter()
        .enumerate()
        .filter(|(_, v)| v.as_object().map(|o| o.contains_key(key)).unwrap_or(false))
        .map(|(i, _)| i)
        .collect();
    match hits.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(*one)),
        many => Err(RefError::AmbiguousMatch { key: key.to_owned(), count: many.len() }),
    }
}
