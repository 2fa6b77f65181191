//! Type registry abstraction.
//!
//! The graph never enumerates types on its own. Whatever hosts it (an engine,
//! a simulator, a test) describes its entity classes through [`TypeRegistry`]
//! once at startup, and again only for types that show up later.

use crate::error::RegistryError;
use crate::types::TypeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse role of a type, used where the graph treats a family of types specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TypeRole {
    /// Plain networked entity
    #[default]
    Actor,
    /// Owner of a connection's viewpoint (never opens channels for multicasts)
    Controller,
    /// Entity a controller possesses
    Pawn,
    /// Per-player status record, rotated by the frequency limiter
    StatusRecord,
    /// Server statistics replicator
    ServerStats,
}

/// Class-default replication settings of a type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TypeDefaults {
    pub replicated: bool,
    pub always_relevant: bool,
    pub only_relevant_to_owner: bool,
    pub net_use_owner_relevancy: bool,

    /// Squared distance beyond which the type is culled
    pub net_cull_distance_squared: f64,

    /// Desired updates per second
    pub net_update_frequency: f64,
}

impl TypeDefaults {
    /// Defaults of a replicated, spatially culled entity.
    pub fn replicated() -> Self {
        Self {
            replicated: true,
            ..Self::default()
        }
    }

    pub fn with_always_relevant(mut self, value: bool) -> Self {
        self.always_relevant = value;
        self
    }

    pub fn with_only_relevant_to_owner(mut self, value: bool) -> Self {
        self.only_relevant_to_owner = value;
        self
    }

    pub fn with_owner_relevancy(mut self, value: bool) -> Self {
        self.net_use_owner_relevancy = value;
        self
    }

    pub fn with_cull_distance(mut self, distance: f64) -> Self {
        self.net_cull_distance_squared = distance * distance;
        self
    }

    pub fn with_update_frequency(mut self, hz: f64) -> Self {
        self.net_update_frequency = hz;
        self
    }

    /// True if both defaults would route the same way.
    pub fn same_relevancy(&self, other: &TypeDefaults) -> bool {
        self.replicated == other.replicated
            && self.always_relevant == other.always_relevant
            && self.only_relevant_to_owner == other.only_relevant_to_owner
            && self.net_use_owner_relevancy == other.net_use_owner_relevancy
    }
}

impl Default for TypeDefaults {
    fn default() -> Self {
        Self {
            replicated: false,
            always_relevant: false,
            only_relevant_to_owner: false,
            net_use_owner_relevancy: false,
            net_cull_distance_squared: 225_000_000.0, // 15000 units
            net_update_frequency: 100.0,
        }
    }
}

/// Everything the graph needs to know about one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub id: TypeId,
    pub name: String,
    pub parent: Option<TypeId>,

    /// Stable base type (as opposed to a scripted or data-defined subtype)
    pub native: bool,

    pub role: TypeRole,
    pub defaults: TypeDefaults,
}

/// Source of type metadata.
pub trait TypeRegistry {
    /// All types whose class defaults are replicated.
    fn list_replicated_types(&self) -> Vec<TypeDescriptor>;

    /// Describes a single type, replicated or not.
    fn describe(&self, id: TypeId) -> Option<TypeDescriptor>;

    /// Resolves a type by name.
    fn find_type(&self, name: &str) -> Option<TypeId>;
}

/// Registry backed by a vector, used by the simulator and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTypeRegistry {
    types: Vec<TypeDescriptor>,
    by_name: HashMap<String, TypeId>,
}

impl InMemoryTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a type. Parents must be registered before their children.
    pub fn register(
        &mut self,
        name: &str,
        parent: Option<TypeId>,
        role: TypeRole,
        native: bool,
        defaults: TypeDefaults,
    ) -> Result<TypeId, RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::duplicate(name));
        }
        if let Some(parent) = parent {
            if parent.index() >= self.types.len() {
                return Err(RegistryError::UnknownParent {
                    name: name.to_string(),
                    parent,
                });
            }
        }

        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDescriptor {
            id,
            name: name.to_string(),
            parent,
            native,
            role,
            defaults,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Adds a subtype inheriting its parent's role and defaults.
    pub fn derive(&mut self, name: &str, parent: TypeId) -> Result<TypeId, RegistryError> {
        let base = self
            .types
            .get(parent.index())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownParent {
                name: name.to_string(),
                parent,
            })?;
        self.register(name, Some(parent), base.role, false, base.defaults)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl TypeRegistry for InMemoryTypeRegistry {
    fn list_replicated_types(&self) -> Vec<TypeDescriptor> {
        self.types
            .iter()
            .filter(|t| t.defaults.replicated)
            .cloned()
            .collect()
    }

    fn describe(&self, id: TypeId) -> Option<TypeDescriptor> {
        self.types.get(id.index()).cloned()
    }

    fn find_type(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }
}
