//! Shared node interface.
//!
//! Global nodes are prepared once per tick (the only place they mutate) and
//! then gathered once per connection through `&self`, so gathers for different
//! connections never observe each other.

use crate::connection::NetViewer;
use repgraph_env::{ConnectionId, EntityId};

/// Inputs of one connection's gather.
#[derive(Debug, Clone, Copy)]
pub struct GatherParams<'a> {
    pub tick: u64,
    pub connection: ConnectionId,

    /// Viewers owned by the connection (a split-screen client has several)
    pub viewers: &'a [NetViewer],
}

/// A node whose output is shared by every connection.
pub trait GlobalGraphNode {
    fn name(&self) -> &'static str;

    /// Whether [`GlobalGraphNode::prepare_for_replication`] must run each tick.
    fn requires_prepare(&self) -> bool {
        false
    }

    fn prepare_for_replication(&mut self, _tick: u64) {}

    /// Appends this node's entities for one connection.
    fn gather(&self, params: &GatherParams<'_>, out: &mut Vec<EntityId>);
}
