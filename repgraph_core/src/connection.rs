//! Per-connection state.

use crate::repgraph_relevance::AlwaysRelevantForConnectionNode;
use nalgebra::Vector3;
use repgraph_env::{ConnectionId, EntityId, RegionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// One viewpoint of a connection for the current tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetViewer {
    pub connection: ConnectionId,

    /// The entity doing the viewing (usually a controller)
    pub viewer: EntityId,
    pub view_target: Option<EntityId>,

    /// World position the grid is queried from
    pub position: Vector3<f64>,

    /// Pawn possessed by the viewer, if any
    pub pawn: Option<EntityId>,
    pub status_record: Option<EntityId>,

    /// Viewer is a player's controller (as opposed to a spectator or bot)
    pub player_controlled: bool,
}

impl NetViewer {
    pub fn new(connection: ConnectionId, viewer: EntityId, position: Vector3<f64>, view_target: Option<EntityId>) -> Self {
        Self {
            connection,
            viewer,
            view_target,
            position,
            pawn: None,
            status_record: None,
            player_controlled: false,
        }
    }

    pub fn with_pawn(mut self, pawn: EntityId) -> Self {
        self.pawn = Some(pawn);
        self
    }

    pub fn with_status_record(mut self, status_record: EntityId) -> Self {
        self.status_record = Some(status_record);
        self
    }

    pub fn as_player(mut self) -> Self {
        self.player_controlled = true;
        self
    }
}

/// Per-connection overrides for one entity.
///
/// The graph writes `replication_period` and `cull_distance_squared` during a
/// tick; the transport layer reads them when it serializes the entity for this
/// connection. `None` means the type's own setting applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionActorInfo {
    pub dormant_on_connection: bool,

    /// Overrides the type's replication period on this connection
    pub replication_period: Option<u32>,

    /// Overrides the type's cull distance on this connection (0 = never culled)
    pub cull_distance_squared: Option<f64>,
}

/// Everything the graph keeps for one open connection.
#[derive(Debug)]
pub struct ConnectionManager {
    pub id: ConnectionId,

    /// Position in connection open order, drives status-record parity
    pub order_index: u32,

    pub actor_info: HashMap<EntityId, ConnectionActorInfo>,
    pub visible_regions: BTreeSet<RegionId>,
    pub node: AlwaysRelevantForConnectionNode,
}

impl ConnectionManager {
    pub fn new(id: ConnectionId, order_index: u32) -> Self {
        Self {
            id,
            order_index,
            actor_info: HashMap::new(),
            visible_regions: BTreeSet::new(),
            node: AlwaysRelevantForConnectionNode::new(),
        }
    }

    pub fn actor_info(&self, id: EntityId) -> Option<&ConnectionActorInfo> {
        self.actor_info.get(&id)
    }

    pub fn actor_info_mut(&mut self, id: EntityId) -> &mut ConnectionActorInfo {
        self.actor_info.entry(id).or_default()
    }

    pub fn is_dormant(&self, id: EntityId) -> bool {
        self.actor_info.get(&id).is_some_and(|i| i.dormant_on_connection)
    }

    /// Tracks a region's visibility and notifies the connection node.
    pub fn set_region_visibility(&mut self, region: RegionId, visible: bool) {
        if visible {
            self.visible_regions.insert(region.clone());
            self.node.on_region_visible(region);
        } else {
            self.visible_regions.remove(&region);
            self.node.on_region_hidden(&region);
        }
    }
}
