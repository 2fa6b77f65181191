//! Always-relevant nodes.
//!
//! - [`AlwaysRelevantNode`]: one flat list shared by every connection.
//! - [`RegionGatedLists`]: always-relevant entities registered under a
//!   streaming region, handed out only to connections that see the region.
//! - [`AlwaysRelevantForConnectionNode`]: per-connection viewer, view target,
//!   pawn and status-record relevance, plus the region-gated lists.

use crate::connection::{ConnectionActorInfo, NetViewer};
use crate::error::RouteError;
use crate::node::{GatherParams, GlobalGraphNode};
use repgraph_env::{ConnectionId, EntityId, RegionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Adds `id` unless it is already present.
fn conditional_add(list: &mut Vec<EntityId>, id: EntityId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

// ============================================================================
// GLOBAL
// ============================================================================

/// Entities relevant to every connection.
#[derive(Debug, Clone, Default)]
pub struct AlwaysRelevantNode {
    entities: Vec<EntityId>,
}

impl AlwaysRelevantNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_add(&mut self, id: EntityId) {
        conditional_add(&mut self.entities, id);
    }

    pub fn notify_remove(&mut self, id: EntityId) -> Result<(), RouteError> {
        let pos = self
            .entities
            .iter()
            .position(|e| *e == id)
            .ok_or_else(|| RouteError::not_found(id, "always relevant list"))?;
        self.entities.remove(pos);
        Ok(())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains(&id)
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

impl GlobalGraphNode for AlwaysRelevantNode {
    fn name(&self) -> &'static str {
        "AlwaysRelevant"
    }

    fn gather(&self, _params: &GatherParams<'_>, out: &mut Vec<EntityId>) {
        out.extend_from_slice(&self.entities);
    }
}

// ============================================================================
// REGION GATED
// ============================================================================

/// Always-relevant entities keyed by the streaming region they belong to.
#[derive(Debug, Clone, Default)]
pub struct RegionGatedLists {
    lists: HashMap<RegionId, Vec<EntityId>>,
}

impl RegionGatedLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, region: RegionId, id: EntityId) {
        conditional_add(self.lists.entry(region).or_default(), id);
    }

    /// Removes `id` from the region's list. The list itself stays, even if empty.
    pub fn remove(&mut self, region: &RegionId, id: EntityId) -> Result<(), RouteError> {
        let list = self
            .lists
            .get_mut(region)
            .ok_or_else(|| RouteError::not_found(id, format!("region list {region}")))?;
        let pos = list
            .iter()
            .position(|e| *e == id)
            .ok_or_else(|| RouteError::not_found(id, format!("region list {region}")))?;
        list.remove(pos);
        Ok(())
    }

    pub fn get(&self, region: &RegionId) -> Option<&[EntityId]> {
        self.lists.get(region).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }
}

// ============================================================================
// PER CONNECTION
// ============================================================================

/// What the graph knows about entities, as seen from the connection node.
pub trait EntityLookup {
    fn is_pawn(&self, id: EntityId) -> bool;

    /// The entity's type cull distance, if it is registered.
    fn type_cull_distance_squared(&self, id: EntityId) -> Option<f64>;
}

/// Which tracked pawn of a viewer changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PawnSlot {
    Controlled,
    ViewTarget,
}

/// A viewer's tracked pawn was replaced by another entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PawnReplacement {
    pub connection: ConnectionId,
    pub viewer: EntityId,
    pub slot: PawnSlot,
    pub previous: EntityId,
    pub current: EntityId,
}

#[derive(Debug, Clone, Copy, Default)]
struct CachedPawns {
    pawn: Option<EntityId>,
    view_target: Option<EntityId>,
}

/// Read-only inputs of one connection node gather.
pub struct ConnectionGatherContext<'a> {
    pub tick: u64,
    pub connection: ConnectionId,
    pub order_index: u32,
    pub viewers: &'a [NetViewer],
    pub region_lists: &'a RegionGatedLists,
    pub lookup: &'a dyn EntityLookup,

    /// Log every region decision
    pub display_region_streaming: bool,
}

/// Per-connection always-relevant node.
#[derive(Debug, Clone, Default)]
pub struct AlwaysRelevantForConnectionNode {
    replication_list: Vec<EntityId>,
    tracked_regions: Vec<RegionId>,
    initialized_status_record: bool,
    last_pawns: HashMap<EntityId, CachedPawns>,
}

impl AlwaysRelevantForConnectionNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_region_visible(&mut self, region: RegionId) {
        if !self.tracked_regions.contains(&region) {
            self.tracked_regions.push(region);
        }
    }

    pub fn on_region_hidden(&mut self, region: &RegionId) {
        self.tracked_regions.retain(|r| r != region);
    }

    pub fn tracked_regions(&self) -> &[RegionId] {
        &self.tracked_regions
    }

    pub fn reset(&mut self) {
        self.replication_list.clear();
        self.tracked_regions.clear();
        self.last_pawns.clear();
    }

    /// Rebuilds the node's own list and appends it, then the visible region lists.
    pub fn gather(
        &mut self,
        ctx: &ConnectionGatherContext<'_>,
        actor_info: &mut HashMap<EntityId, ConnectionActorInfo>,
        out: &mut Vec<EntityId>,
        replacements: &mut Vec<PawnReplacement>,
    ) {
        self.replication_list.clear();
        let replicate_status = (ctx.order_index as u64 + ctx.tick) % 2 == 0;

        for viewer in ctx.viewers {
            conditional_add(&mut self.replication_list, viewer.viewer);
            if let Some(target) = viewer.view_target {
                conditional_add(&mut self.replication_list, target);
            }

            if !viewer.player_controlled {
                continue;
            }

            // Half the connections get their status record each tick
            if replicate_status {
                if let Some(status) = viewer.status_record {
                    if !self.initialized_status_record {
                        self.initialized_status_record = true;
                        actor_info.entry(status).or_default().replication_period = Some(1);
                    }
                    conditional_add(&mut self.replication_list, status);
                }
            }

            let mut cached = self.last_pawns.get(&viewer.viewer).copied().unwrap_or_default();

            if let Some(pawn) = viewer.pawn.filter(|p| ctx.lookup.is_pawn(*p)) {
                update_cached(ctx, viewer.viewer, PawnSlot::Controlled, pawn, &mut cached.pawn, actor_info, replacements);
                if Some(pawn) != viewer.view_target {
                    conditional_add(&mut self.replication_list, pawn);
                }
            }

            if let Some(target) = viewer.view_target.filter(|t| ctx.lookup.is_pawn(*t)) {
                update_cached(ctx, viewer.viewer, PawnSlot::ViewTarget, target, &mut cached.view_target, actor_info, replacements);
            }

            self.last_pawns.insert(viewer.viewer, cached);
        }

        // Viewers gone this tick
        self.last_pawns
            .retain(|viewer, _| ctx.viewers.iter().any(|v| v.viewer == *viewer));

        out.extend_from_slice(&self.replication_list);
        self.gather_regions(ctx, actor_info, out);
    }

    fn gather_regions(
        &mut self,
        ctx: &ConnectionGatherContext<'_>,
        actor_info: &HashMap<EntityId, ConnectionActorInfo>,
        out: &mut Vec<EntityId>,
    ) {
        let connection = ctx.connection;
        let verbose = ctx.display_region_streaming;

        self.tracked_regions.retain(|region| {
            let list = match ctx.region_lists.get(region) {
                Some(list) if !list.is_empty() => list,
                _ => {
                    if verbose {
                        tracing::debug!("Region {} has no always relevant entities for {}, untracking", region, connection);
                    }
                    return false;
                }
            };

            let all_dormant = list
                .iter()
                .all(|id| actor_info.get(id).is_some_and(|i| i.dormant_on_connection));
            if all_dormant {
                if verbose {
                    tracing::debug!("Region {} is fully dormant on {}, untracking", region, connection);
                }
                return false;
            }

            if verbose {
                tracing::debug!("Region {} adds {} entities for {}", region, list.len(), connection);
            }
            out.extend_from_slice(list);
            true
        });
    }
}

/// Moves the zero cull override from the previous pawn to the new one.
fn update_cached(
    ctx: &ConnectionGatherContext<'_>,
    viewer: EntityId,
    slot: PawnSlot,
    current: EntityId,
    last: &mut Option<EntityId>,
    actor_info: &mut HashMap<EntityId, ConnectionActorInfo>,
    replacements: &mut Vec<PawnReplacement>,
) {
    if *last == Some(current) {
        return;
    }

    actor_info.entry(current).or_default().cull_distance_squared = Some(0.0);

    if let Some(previous) = *last {
        if let Some(cull) = ctx.lookup.type_cull_distance_squared(previous) {
            actor_info.entry(previous).or_default().cull_distance_squared = Some(cull);
        }
        replacements.push(PawnReplacement {
            connection: ctx.connection,
            viewer,
            slot,
            previous,
            current,
        });
    }

    *last = Some(current);
}
