//! RepGraph Deterministic Simulation Harness
//!
//! This crate drives a [`repgraph_core::ReplicationGraph`] with a synthetic,
//! seeded game world and checks every frame it produces:
//! - **World**: players, pawns and props moving under a single ChaCha8 stream
//! - **Scenarios**: crowd, region streaming, status flood and rewind
//! - **Runner**: ticks the world and turns frame checks into a pass/fail result
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ Ground truth (positions, velocities, ChaCha8Rng)      │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │ register / move / viewers        │ pawn bounds       │
//! │  ┌────▼─────────────┐              ┌─────▼──────────┐       │
//! │  │ ReplicationGraph │              │ RewindRegistry │       │
//! │  └────┬─────────────┘              └─────┬──────────┘       │
//! │       │ ReplicationFrame                 │ FrozenRewindState │
//! │  ┌────▼──────────────────────────────────▼──────────┐       │
//! │  │              ScenarioRunner (checks)              │       │
//! │  └───────────────────────────────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use repgraph_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42, 8).with_ticks(300).run(ScenarioId::Crowd);
//! assert!(result.passed);
//! ```

mod error;
mod runner;
pub mod scenarios;
mod world;

pub use error::SimError;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use world::{build_registry, sim_graph_config, EntityKind, SimConfig, SimEntity, SimPlayer, SimTypes, SimWorld, PAWN_EXTENT};
