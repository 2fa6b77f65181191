//! Error types for the replication graph.
//!
//! None of these are fatal. The graph logs them on the tick path and keeps
//! going, dropping or ignoring the offending entity.

use repgraph_env::{ConnectionId, EntityId};
use thiserror::Error;

/// Configuration could not be loaded or is out of range.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Class settings reference a type the registry does not know
    #[error("Unknown type in class settings: {0}")]
    UnknownType(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Add/remove routing went somewhere the entity is not.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    /// Remove called for an entity missing from the expected list
    #[error("{entity} was not found in {route}")]
    NotFound { entity: EntityId, route: String },

    #[error("{0} is already registered")]
    AlreadyRegistered(EntityId),

    #[error("{0} is not registered")]
    UnknownEntity(EntityId),

    #[error("Connection {0} is not open")]
    UnknownConnection(ConnectionId),
}

impl RouteError {
    pub fn not_found(entity: EntityId, route: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            route: route.into(),
        }
    }
}

/// A rewind query could not be answered from the retained history.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RewindError {
    #[error("No history recorded")]
    Empty,

    /// Rewind limit exceeded
    #[error("Requested time {requested:.3}s is older than the oldest snapshot ({oldest:.3}s)")]
    BeforeHistory { requested: f64, oldest: f64 },

    #[error("{0} has no rewind history")]
    Untracked(EntityId),
}
