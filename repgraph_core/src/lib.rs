//! RepGraph Core - Per-tick replication relevance and rewindable history
//!
//! This library decides, once per tick, which entities each remote
//! connection must receive, and keeps a bounded per-entity history for
//! lag-compensated queries:
//! 1. **Routing**: types resolve to one of five categories, memoized along the type hierarchy
//! 2. **Relevance**: a spatial grid, always-relevant lists, region gating and a frequency limiter
//! 3. **Rewind**: age-bounded snapshot histories with interpolated lookups
//!
//! # Example
//!
//! ```
//! use nalgebra::Vector3;
//! use repgraph_core::{GraphConfig, NetViewer, ReplicationGraph};
//! use repgraph_env::{ConnectionId, EntityId, InMemoryTypeRegistry, TypeDefaults, TypeRole};
//!
//! let mut registry = InMemoryTypeRegistry::new();
//! let actor = registry
//!     .register("Actor", None, TypeRole::Actor, true, TypeDefaults::default())
//!     .unwrap();
//! let pickup = registry
//!     .register("Pickup", Some(actor), TypeRole::Actor, true, TypeDefaults::replicated())
//!     .unwrap();
//!
//! let mut graph = ReplicationGraph::with_default_provider(GraphConfig::default(), Box::new(registry));
//! let connection = ConnectionId::from_seed(1);
//! graph.open_connection(connection);
//! graph.register_entity(EntityId(7), pickup, Vector3::new(100.0, 0.0, 0.0), None);
//!
//! let viewer = NetViewer::new(connection, EntityId(1), Vector3::zeros(), None);
//! let frame = graph.tick(0, &[viewer]);
//! assert!(frame.list(connection).contains(&EntityId(7)));
//! ```

pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod graph_runtime;
pub mod node;
pub mod repgraph_limiter;
pub mod repgraph_policy;
pub mod repgraph_relevance;
pub mod repgraph_space;
pub mod repgraph_time;
pub mod type_info;

// Re-export key types for convenience
pub use config::{ClassSettings, FastSharedPathConfig, GraphConfig, SpatialConfig};
pub use connection::{ConnectionActorInfo, ConnectionManager, NetViewer};
pub use diagnostics::RoutingReport;
pub use error::{ConfigError, RewindError, RouteError};
pub use graph_runtime::{EntityRecord, FastSharedPathConstants, ReplicationFrame, ReplicationGraph};
pub use node::{GatherParams, GlobalGraphNode};
pub use repgraph_limiter::FrequencyLimiterNode;
pub use repgraph_policy::{ClassPolicyResolver, RoutingCategory, TypeHierarchy};
pub use repgraph_relevance::{AlwaysRelevantForConnectionNode, AlwaysRelevantNode, PawnReplacement, PawnSlot, RegionGatedLists};
pub use repgraph_space::{CellCoord, GridStats, SpatialGrid};
pub use repgraph_time::{BoundingBox, FrozenRewindState, RewindHistory, RewindRegistry, RewindSnapshot, RewindableComponent};
pub use type_info::{DefaultTypeInfoProvider, TypeInfoProvider, TypeReplicationInfo};
