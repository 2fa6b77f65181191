//! Replication Graph Environment Layer
//!
//! Everything the relevance graph consumes from its host but does not own:
//! identifier types for entities, connections and regions, and the type
//! registry through which the host describes its entity classes.
//!
//! # Example
//!
//! ```
//! use repgraph_env::{InMemoryTypeRegistry, TypeDefaults, TypeRegistry, TypeRole};
//!
//! let mut registry = InMemoryTypeRegistry::new();
//! let actor = registry
//!     .register("Actor", None, TypeRole::Actor, true, TypeDefaults::default())
//!     .unwrap();
//! registry
//!     .register("Projectile", Some(actor), TypeRole::Actor, true, TypeDefaults::replicated())
//!     .unwrap();
//!
//! assert_eq!(registry.list_replicated_types().len(), 1);
//! ```

mod error;
mod registry;
mod types;

pub use error::RegistryError;
pub use registry::{InMemoryTypeRegistry, TypeDefaults, TypeDescriptor, TypeRegistry, TypeRole};
pub use types::{ConnectionId, EntityId, RegionId, TypeId};
