//! Per-call registry of the entities references may point at.

use std::collections::BTreeMap;

use crate::{Entity, ObjectKey};

/// Entities visible to one translation call: the caller's dependencies plus
/// whatever expansion creates. Lookups are scoped to the main object's namespace.
#[derive(Debug, Clone)]
pub struct EntityContext {
    main: ObjectKey,
    known: BTreeMap<ObjectKey, Entity>,
    added: Vec<Entity>,
}

impl EntityContext {
    pub fn new(main: ObjectKey, dependencies: impl IntoIterator<Item = Entity>) -> Self {
        let known = dependencies.into_iter().map(|e| (e.key(), e)).collect();
        Self { main, known, added: Vec::new() }
    }

    pub fn main(&self) -> &ObjectKey { &self.main }

    pub fn find(&self, name: &str) -> Option<&Entity> {
        self.known.get(&ObjectKey { namespace: self.main.namespace.clone(), name: name.to_owned() })
    }

    pub fn has(&self, name: &str) -> bool { self.find(name).is_some() }

    /// Register a newly created entity; it becomes visible to later lookups.
    pub fn add(&mut self, entity: Entity) {
        self.known.insert(entity.key(), entity.clone());
        self.added.push(entity);
    }

    /// Entities in the main object's namespace, in key order.
    pub fn in_scope(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.known.iter().filter(move |(k, _)| k.namespace == self.main.namespace).map(|(_, e)| e)
    }

    pub fn added(&self) -> &[Entity] { &self.added }
    pub fn into_added(self) -> Vec<Entity> { self.added }
}
