//! Error types for the replication graph environment layer.

use crate::types::TypeId;
use thiserror::Error;

/// Errors raised while building a type registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A type with the same name was already registered
    #[error("Duplicate type: {0}")]
    DuplicateType(String),

    /// Parent link points outside the registry
    #[error("Unknown parent {parent:?} for type {name}")]
    UnknownParent { name: String, parent: TypeId },
}

impl RegistryError {
    /// Creates a duplicate-type error.
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateType(name.into())
    }
}
