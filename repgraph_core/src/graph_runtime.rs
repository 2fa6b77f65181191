//! Graph Runtime - Orchestrates the replication nodes for every connection.
//!
//! This module is the integration layer between the leaf nodes (grid,
//! always-relevant lists, frequency limiter, per-connection node) and the
//! host, which registers entities, opens connections and drives ticks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ReplicationGraph                        │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │   ClassPolicyResolver + TypeInfoMap (per type)        │   │
//! │  │  • register_entity → category → exactly one node      │   │
//! │  │  • unregister_entity → same category → remove         │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                              │                               │
//! │  ┌─────────┐ ┌───────────┐ ┌─────────┐ ┌─────────────────┐  │
//! │  │  GRID   │ │  ALWAYS   │ │ LIMITER │ │ PER CONNECTION  │  │
//! │  │ (space) │ │ RELEVANT  │ │ (rotate)│ │ viewer / region │  │
//! │  └─────────┘ └───────────┘ └─────────┘ └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tick
//!
//! 1. Nodes that need it are prepared (the only mutation of global nodes).
//! 2. Per connection: grid, always relevant, limiter, then the connection node.
//! 3. Outputs are concatenated; duplicates across nodes are kept.

use crate::config::GraphConfig;
use crate::connection::{ConnectionManager, NetViewer};
use crate::diagnostics::RoutingReport;
use crate::error::{ConfigError, RouteError};
use crate::node::{GatherParams, GlobalGraphNode};
use crate::repgraph_limiter::FrequencyLimiterNode;
use crate::repgraph_policy::{ClassPolicyResolver, RoutingCategory, TypeHierarchy};
use crate::repgraph_relevance::{
    AlwaysRelevantNode, ConnectionGatherContext, EntityLookup, PawnReplacement, RegionGatedLists,
};
use crate::repgraph_space::{GridStats, SpatialGrid};
use crate::type_info::{DefaultTypeInfoProvider, TypeInfoMap, TypeInfoProvider, TypeReplicationInfo};
use nalgebra::Vector3;
use repgraph_env::{ConnectionId, EntityId, RegionId, TypeId, TypeRegistry, TypeRole};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name given to the base pawn's shared movement path.
pub const FAST_SHARED_PATH_NAME: &str = "FastSharedReplication";

/// Type name prefixes of transient editor artifacts, never routed at startup.
const TRANSIENT_TYPE_PREFIXES: [&str; 2] = ["SKEL_", "REINST_"];

/// Routing state of a registered entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub type_id: TypeId,
    pub category: RoutingCategory,
    pub role: TypeRole,

    /// Type cull distance at registration time
    pub cull_distance_squared: f64,

    pub position: Vector3<f64>,
    pub region: Option<RegionId>,
    pub dormant: bool,
}

/// Budget for shared movement updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FastSharedPathConstants {
    pub max_bits_per_frame: u32,
    pub distance_requirement_pct: f32,
}

/// Output of one replication tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFrame {
    pub tick: u64,
    pub lists: BTreeMap<ConnectionId, Vec<EntityId>>,
    pub pawn_replacements: Vec<PawnReplacement>,
}

impl ReplicationFrame {
    pub fn list(&self, connection: ConnectionId) -> &[EntityId] {
        self.lists.get(&connection).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_entities(&self) -> usize {
        self.lists.values().map(Vec::len).sum()
    }
}

/// Entity table as seen by the connection node.
struct EntityView<'a> {
    entities: &'a BTreeMap<EntityId, EntityRecord>,
}

impl EntityLookup for EntityView<'_> {
    fn is_pawn(&self, id: EntityId) -> bool {
        self.entities.get(&id).is_some_and(|r| r.role == TypeRole::Pawn)
    }

    fn type_cull_distance_squared(&self, id: EntityId) -> Option<f64> {
        self.entities.get(&id).map(|r| r.cull_distance_squared)
    }
}

/// The replication graph.
pub struct ReplicationGraph {
    config: GraphConfig,
    registry: Box<dyn TypeRegistry + Send + Sync>,

    hierarchy: TypeHierarchy,
    policies: ClassPolicyResolver,
    type_infos: TypeInfoMap,
    multicast_overrides: HashMap<TypeId, bool>,

    entities: BTreeMap<EntityId, EntityRecord>,

    // Global nodes, gathered in this order
    grid: SpatialGrid,
    always_relevant: AlwaysRelevantNode,
    limiter: FrequencyLimiterNode,

    region_lists: RegionGatedLists,
    connections: BTreeMap<ConnectionId, ConnectionManager>,
    next_connection_order: u32,

    destruction_ignores_distance: HashSet<EntityId>,
    destruction_info_max_distance_squared: f64,
    fast_shared_path: FastSharedPathConstants,
}

impl ReplicationGraph {
    /// Builds the graph and runs the startup type passes.
    pub fn new(
        config: GraphConfig,
        registry: Box<dyn TypeRegistry + Send + Sync>,
        provider: Box<dyn TypeInfoProvider + Send + Sync>,
    ) -> Self {
        let fast_shared_path = FastSharedPathConstants {
            max_bits_per_frame: (config.fast_shared_path.target_kbytes_per_sec as f64 * 1024.0 * 8.0
                / config.server_max_tick_rate) as u32,
            distance_requirement_pct: config.fast_shared_path.cull_distance_pct,
        };

        let mut graph = Self {
            hierarchy: TypeHierarchy::new(),
            policies: ClassPolicyResolver::new(),
            type_infos: TypeInfoMap::new(provider, config.log_lazy_init_types),
            multicast_overrides: HashMap::new(),
            entities: BTreeMap::new(),
            grid: SpatialGrid::new(&config.spatial),
            always_relevant: AlwaysRelevantNode::new(),
            limiter: FrequencyLimiterNode::new(config.status_records_per_tick),
            region_lists: RegionGatedLists::new(),
            connections: BTreeMap::new(),
            next_connection_order: 0,
            destruction_ignores_distance: HashSet::new(),
            destruction_info_max_distance_squared: config.destruction_info_max_distance
                * config.destruction_info_max_distance,
            fast_shared_path,
            registry,
            config,
        };
        graph.init_type_settings();
        graph
    }

    /// Graph with the default type info provider.
    pub fn with_default_provider(config: GraphConfig, registry: Box<dyn TypeRegistry + Send + Sync>) -> Self {
        let provider = DefaultTypeInfoProvider::new(config.server_max_tick_rate);
        Self::new(config, registry, Box::new(provider))
    }

    /// Like [`ReplicationGraph::new`], but honors `config.disabled`.
    pub fn create(
        config: GraphConfig,
        registry: Box<dyn TypeRegistry + Send + Sync>,
        provider: Box<dyn TypeInfoProvider + Send + Sync>,
    ) -> Option<Self> {
        if config.disabled {
            tracing::warn!("Replication graph is disabled by configuration, falling back to legacy relevancy");
            return None;
        }
        Some(Self::new(config, registry, provider))
    }

    fn init_type_settings(&mut self) {
        // Explicit class settings
        let settings = self.config.class_settings.clone();
        for entry in &settings {
            let Some(ty) = self.load_type_by_name(&entry.type_name) else {
                tracing::warn!("{}, skipping", ConfigError::UnknownType(entry.type_name.clone()));
                continue;
            };
            if entry.add_class_rep_info {
                self.policies.set_explicit(&self.hierarchy, ty, entry.mapping);
            }
            if entry.add_to_multicast_map {
                self.multicast_overrides.insert(ty, entry.multicast_opens_channel);
            }
        }

        // Every replicated type the registry knows
        let replicated: Vec<TypeId> = self
            .registry
            .list_replicated_types()
            .into_iter()
            .filter(|desc| !TRANSIENT_TYPE_PREFIXES.iter().any(|p| desc.name.starts_with(p)))
            .map(|desc| desc.id)
            .collect();
        for ty in &replicated {
            self.hierarchy.ensure_loaded(&*self.registry, *ty);
            self.policies.register(&self.hierarchy, *ty);
        }

        // Explicit pawn info, never derived
        if let Some(name) = self.config.base_pawn_type.clone() {
            match self.load_type_by_name(&name) {
                Some(pawn) => {
                    let cull = self
                        .hierarchy
                        .get(pawn)
                        .map(|d| d.defaults.net_cull_distance_squared)
                        .unwrap_or_default();
                    let info = TypeReplicationInfo {
                        cull_distance_squared: cull,
                        distance_priority_scale: 1.0,
                        starvation_priority_scale: 1.0,
                        channel_frame_timeout: 4,
                        fast_shared_path: self
                            .config
                            .fast_shared_path
                            .enabled
                            .then(|| FAST_SHARED_PATH_NAME.to_string()),
                        ..TypeReplicationInfo::default()
                    };
                    self.type_infos.set_explicit(pawn, info);
                }
                None => tracing::warn!("{}, no pawn settings applied", ConfigError::UnknownType(name)),
            }
        }

        let mut derived = 0;
        for ty in &replicated {
            if self.type_infos.register(&self.hierarchy, &mut self.policies, *ty) {
                derived += 1;
            }
        }

        tracing::info!("━━━ Replication graph initialized ━━━");
        tracing::info!(
            "{} replicated types, {} routing policies, {} type settings ({} derived)",
            replicated.len(),
            self.policies.len(),
            self.type_infos.len(),
            derived
        );
        for row in self.routing_report().differing_from_native() {
            tracing::info!("  {:<40} --> {}", row.type_name, row.category);
        }
    }

    fn load_type_by_name(&mut self, name: &str) -> Option<TypeId> {
        let ty = self.registry.find_type(name)?;
        self.hierarchy.ensure_loaded(&*self.registry, ty).then_some(ty)
    }

    // ========================================================================
    // TYPES
    // ========================================================================

    /// Resolves a type's category, loading it on first sight.
    pub fn resolve_type(&mut self, ty: TypeId) -> RoutingCategory {
        if !self.hierarchy.ensure_loaded(&*self.registry, ty) {
            return RoutingCategory::NotRouted;
        }
        self.policies.resolve(&self.hierarchy, Some(ty))
    }

    /// Type info, initialized lazily on first sight.
    pub fn type_info(&mut self, ty: TypeId) -> TypeReplicationInfo {
        self.hierarchy.ensure_loaded(&*self.registry, ty);
        self.type_infos.get_or_init(&self.hierarchy, &mut self.policies, ty)
    }

    /// Overrides a type's routing category at runtime.
    pub fn set_class_mapping(&mut self, type_name: &str, category: RoutingCategory) -> Result<(), ConfigError> {
        let ty = self
            .load_type_by_name(type_name)
            .ok_or_else(|| ConfigError::UnknownType(type_name.to_string()))?;
        self.policies.set_explicit(&self.hierarchy, ty, category);
        Ok(())
    }

    /// Whether a multicast to an entity of this type may open a channel.
    pub fn multicast_opens_channel(&mut self, ty: TypeId) -> bool {
        self.hierarchy.ensure_loaded(&*self.registry, ty);

        let mut current = Some(ty);
        while let Some(id) = current {
            if let Some(opens) = self.multicast_overrides.get(&id) {
                return *opens;
            }
            let Some(desc) = self.hierarchy.get(id) else {
                break;
            };
            if matches!(desc.role, TypeRole::Controller | TypeRole::ServerStats) {
                return false;
            }
            current = desc.parent;
        }
        true
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Routes a new entity to the node its type selects.
    ///
    /// Returns the category, or `None` if the entity was dropped.
    pub fn register_entity(
        &mut self,
        id: EntityId,
        ty: TypeId,
        position: Vector3<f64>,
        region: Option<RegionId>,
    ) -> Option<RoutingCategory> {
        if self.entities.contains_key(&id) {
            tracing::warn!("{}, ignoring", RouteError::AlreadyRegistered(id));
            return None;
        }
        if !self.hierarchy.ensure_loaded(&*self.registry, ty) {
            tracing::warn!("{} has unknown type {:?}, dropping", id, ty);
            return None;
        }

        let category = self.policies.resolve(&self.hierarchy, Some(ty));
        let info = self.type_infos.get_or_init(&self.hierarchy, &mut self.policies, ty);
        let role = self.hierarchy.get(ty).map(|d| d.role).unwrap_or_default();

        let routed = match category {
            RoutingCategory::NotRouted => Ok(()),
            RoutingCategory::RelevantAllConnections => {
                match &region {
                    Some(region) => self.region_lists.add(region.clone(), id),
                    None => self.always_relevant.notify_add(id),
                }
                Ok(())
            }
            RoutingCategory::SpatializeStatic => self.grid.add_static(id, position, info.cull_distance_squared),
            RoutingCategory::SpatializeDynamic => self.grid.add_dynamic(id, position, info.cull_distance_squared),
            RoutingCategory::SpatializeDormancy => {
                self.grid.add_dormancy(id, position, info.cull_distance_squared, false)
            }
        };
        if let Err(e) = routed {
            tracing::warn!("Failed to route {}: {}, dropping", id, e);
            return None;
        }

        if role == TypeRole::StatusRecord {
            self.limiter.add_candidate(id);
        }

        self.entities.insert(
            id,
            EntityRecord {
                id,
                type_id: ty,
                category,
                role,
                cull_distance_squared: info.cull_distance_squared,
                position,
                region,
                dormant: false,
            },
        );
        Some(category)
    }

    /// Removes an entity from the node its type currently resolves to.
    ///
    /// Returns false if the entity was unknown or not where its category
    /// says it should be. A failed removal leaves the entity registered.
    pub fn unregister_entity(&mut self, id: EntityId) -> bool {
        let Some(record) = self.entities.get(&id) else {
            tracing::warn!("{}", RouteError::UnknownEntity(id));
            return false;
        };

        let category = self.policies.resolve(&self.hierarchy, Some(record.type_id));
        let removed = match category {
            RoutingCategory::NotRouted => Ok(()),
            RoutingCategory::RelevantAllConnections => match &record.region {
                Some(region) => self.region_lists.remove(region, id),
                None => self.always_relevant.notify_remove(id),
            },
            RoutingCategory::SpatializeStatic => self.grid.remove_static(id),
            RoutingCategory::SpatializeDynamic => self.grid.remove_dynamic(id),
            RoutingCategory::SpatializeDormancy => self.grid.remove_dormancy(id),
        };
        if let Err(e) = removed {
            tracing::warn!("{} (registered as {}, now {}), keeping it", e, record.category, category);
            return false;
        }

        if category == RoutingCategory::RelevantAllConnections {
            self.destruction_ignores_distance.insert(id);
        }
        if record.role == TypeRole::StatusRecord {
            if let Err(e) = self.limiter.remove_candidate(id) {
                tracing::debug!("{}", e);
            }
        }
        for connection in self.connections.values_mut() {
            connection.actor_info.remove(&id);
        }
        self.entities.remove(&id);
        true
    }

    pub fn update_entity_position(&mut self, id: EntityId, position: Vector3<f64>) -> bool {
        let Some(record) = self.entities.get_mut(&id) else {
            return false;
        };
        record.position = position;
        if record.category.is_spatialized() {
            if let Err(e) = self.grid.update_position(id, position) {
                tracing::warn!("{}", e);
            }
        }
        true
    }

    /// Global dormancy. Dormancy-routed entities switch grid lists.
    pub fn set_entity_dormant(&mut self, id: EntityId, dormant: bool) -> bool {
        let Some(record) = self.entities.get_mut(&id) else {
            return false;
        };
        record.dormant = dormant;
        if record.category == RoutingCategory::SpatializeDormancy {
            if let Err(e) = self.grid.set_dormant(id, dormant) {
                tracing::warn!("{}", e);
            }
        }
        true
    }

    pub fn set_dormant_on_connection(
        &mut self,
        connection: ConnectionId,
        id: EntityId,
        dormant: bool,
    ) -> Result<(), RouteError> {
        if !self.entities.contains_key(&id) {
            return Err(RouteError::UnknownEntity(id));
        }
        let manager = self
            .connections
            .get_mut(&connection)
            .ok_or(RouteError::UnknownConnection(connection))?;
        manager.actor_info_mut(id).dormant_on_connection = dormant;
        Ok(())
    }

    /// Sends a status record next tick regardless of its limiter bucket.
    pub fn force_net_update(&mut self, id: EntityId) {
        self.limiter.force_net_update(id);
    }

    pub fn mark_pending_destroy(&mut self, id: EntityId) {
        self.limiter.mark_pending_destroy(id);
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    pub fn open_connection(&mut self, id: ConnectionId) -> bool {
        if self.connections.contains_key(&id) {
            tracing::warn!("Connection {} is already open", id);
            return false;
        }
        let order = self.next_connection_order;
        self.next_connection_order += 1;
        self.connections.insert(id, ConnectionManager::new(id, order));
        tracing::debug!("Opened connection {} (order {})", id, order);
        true
    }

    pub fn close_connection(&mut self, id: ConnectionId) -> bool {
        let closed = self.connections.remove(&id).is_some();
        if !closed {
            tracing::warn!("{}", RouteError::UnknownConnection(id));
        }
        closed
    }

    pub fn set_region_visibility(
        &mut self,
        connection: ConnectionId,
        region: RegionId,
        visible: bool,
    ) -> Result<(), RouteError> {
        let manager = self
            .connections
            .get_mut(&connection)
            .ok_or(RouteError::UnknownConnection(connection))?;
        manager.set_region_visibility(region, visible);
        Ok(())
    }

    pub fn set_frequency_buckets(&mut self, buckets: u32) {
        self.grid.set_frequency_buckets(buckets);
    }

    /// Drops region lists and per-connection node state for a world reset.
    pub fn reset_game_world_state(&mut self) {
        self.region_lists.clear();
        for connection in self.connections.values_mut() {
            connection.node.reset();
            connection.visible_regions.clear();
        }
        tracing::info!("Reset game world state for {} connections", self.connections.len());
    }

    // ========================================================================
    // TICK
    // ========================================================================

    /// Builds every open connection's replication list for one tick.
    pub fn tick(&mut self, tick: u64, viewers: &[NetViewer]) -> ReplicationFrame {
        {
            let globals: [&mut dyn GlobalGraphNode; 3] = [&mut self.grid, &mut self.always_relevant, &mut self.limiter];
            for node in globals {
                if node.requires_prepare() {
                    node.prepare_for_replication(tick);
                }
            }
        }

        let mut by_connection: BTreeMap<ConnectionId, Vec<NetViewer>> = BTreeMap::new();
        for viewer in viewers {
            if self.connections.contains_key(&viewer.connection) {
                by_connection.entry(viewer.connection).or_default().push(viewer.clone());
            } else {
                tracing::warn!("Viewer {} belongs to {}", viewer.viewer, RouteError::UnknownConnection(viewer.connection));
            }
        }

        let ReplicationGraph {
            config,
            entities,
            grid,
            always_relevant,
            limiter,
            region_lists,
            connections,
            ..
        } = self;

        let lookup = EntityView { entities };
        let globals: [&dyn GlobalGraphNode; 3] = [&*grid, &*always_relevant, &*limiter];
        let mut frame = ReplicationFrame {
            tick,
            ..ReplicationFrame::default()
        };

        for (id, manager) in connections.iter_mut() {
            let connection_viewers = by_connection.get(id).map(Vec::as_slice).unwrap_or(&[]);
            let params = GatherParams {
                tick,
                connection: *id,
                viewers: connection_viewers,
            };

            let mut list = Vec::new();
            for node in &globals {
                node.gather(&params, &mut list);
            }

            let ctx = ConnectionGatherContext {
                tick,
                connection: *id,
                order_index: manager.order_index,
                viewers: connection_viewers,
                region_lists,
                lookup: &lookup,
                display_region_streaming: config.display_client_region_streaming,
            };
            manager
                .node
                .gather(&ctx, &mut manager.actor_info, &mut list, &mut frame.pawn_replacements);

            frame.lists.insert(*id, list);
        }

        limiter.clear_forced();

        tracing::debug!(
            "Tick {}: {} connections, {} entities gathered",
            tick,
            frame.lists.len(),
            frame.total_entities()
        );
        frame
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn routing_report(&self) -> RoutingReport {
        RoutingReport::build(self)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn hierarchy(&self) -> &TypeHierarchy {
        &self.hierarchy
    }

    pub fn policies(&self) -> &ClassPolicyResolver {
        &self.policies
    }

    pub fn type_infos(&self) -> &TypeInfoMap {
        &self.type_infos
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionManager> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    pub fn grid_stats(&self) -> GridStats {
        self.grid.stats()
    }

    pub fn always_relevant(&self) -> &AlwaysRelevantNode {
        &self.always_relevant
    }

    pub fn region_lists(&self) -> &RegionGatedLists {
        &self.region_lists
    }

    pub fn limiter(&self) -> &FrequencyLimiterNode {
        &self.limiter
    }

    /// Entities whose destruction is sent regardless of distance.
    pub fn destruction_ignores_distance(&self) -> &HashSet<EntityId> {
        &self.destruction_ignores_distance
    }

    pub fn destruction_info_max_distance_squared(&self) -> f64 {
        self.destruction_info_max_distance_squared
    }

    pub fn fast_shared_path(&self) -> FastSharedPathConstants {
        self.fast_shared_path
    }
}

impl std::fmt::Debug for ReplicationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationGraph")
            .field("entities", &self.entities.len())
            .field("connections", &self.connections.len())
            .field("grid", &self.grid.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassSettings;
    use repgraph_env::{InMemoryTypeRegistry, TypeDefaults};

    struct Types {
        pawn: TypeId,
        controller: TypeId,
        status: TypeId,
        game_state: TypeId,
        pickup: TypeId,
        door: TypeId,
        tree: TypeId,
        stats: TypeId,
        skel_pickup: TypeId,
    }

    fn registry() -> (InMemoryTypeRegistry, Types) {
        let mut r = InMemoryTypeRegistry::new();
        let actor = r
            .register("Actor", None, TypeRole::Actor, true, TypeDefaults::default())
            .unwrap();
        let pawn = r
            .register("Pawn", Some(actor), TypeRole::Pawn, true, TypeDefaults::replicated().with_cull_distance(15_000.0))
            .unwrap();
        let controller = r
            .register(
                "PlayerController",
                Some(actor),
                TypeRole::Controller,
                true,
                TypeDefaults::replicated().with_only_relevant_to_owner(true),
            )
            .unwrap();
        let status = r
            .register(
                "PlayerState",
                Some(actor),
                TypeRole::StatusRecord,
                true,
                TypeDefaults::replicated().with_always_relevant(true),
            )
            .unwrap();
        let game_state = r
            .register(
                "GameState",
                Some(actor),
                TypeRole::Actor,
                true,
                TypeDefaults::replicated().with_always_relevant(true),
            )
            .unwrap();
        let pickup = r
            .register(
                "Pickup",
                Some(actor),
                TypeRole::Actor,
                true,
                TypeDefaults::replicated().with_cull_distance(1_000.0).with_update_frequency(10.0),
            )
            .unwrap();
        let door = r
            .register("Door", Some(actor), TypeRole::Actor, true, TypeDefaults::replicated().with_cull_distance(1_000.0))
            .unwrap();
        let tree = r
            .register("Tree", Some(actor), TypeRole::Actor, true, TypeDefaults::replicated().with_cull_distance(1_000.0))
            .unwrap();
        let stats = r
            .register(
                "ServerStatReplicator",
                Some(actor),
                TypeRole::ServerStats,
                true,
                TypeDefaults::replicated().with_owner_relevancy(true),
            )
            .unwrap();
        let skel_pickup = r.derive("SKEL_Pickup", pickup).unwrap();

        (
            r,
            Types {
                pawn,
                controller,
                status,
                game_state,
                pickup,
                door,
                tree,
                stats,
                skel_pickup,
            },
        )
    }

    fn config() -> GraphConfig {
        let mut config = GraphConfig::default()
            .with_cell_size(1_000.0)
            .with_bias(0.0, 0.0)
            .with_class_settings(ClassSettings::route("PlayerState", RoutingCategory::NotRouted))
            .with_class_settings(ClassSettings::route("Door", RoutingCategory::SpatializeDormancy))
            .with_class_settings(ClassSettings::route("Tree", RoutingCategory::SpatializeStatic))
            .with_class_settings(ClassSettings::route("NoSuchType", RoutingCategory::SpatializeStatic));
        config.base_pawn_type = Some("Pawn".to_string());
        config
    }

    fn graph() -> (ReplicationGraph, Types) {
        let (registry, types) = registry();
        (ReplicationGraph::with_default_provider(config(), Box::new(registry)), types)
    }

    fn at(x: f64, y: f64) -> Vector3<f64> {
        Vector3::new(x, y, 0.0)
    }

    #[test]
    fn test_startup_policies() {
        let (graph, t) = graph();
        let policies = graph.policies();

        assert_eq!(policies.get(t.pawn), Some(RoutingCategory::SpatializeDynamic));
        assert_eq!(policies.get(t.controller), Some(RoutingCategory::NotRouted));
        assert_eq!(policies.get(t.status), Some(RoutingCategory::NotRouted));
        assert_eq!(policies.get(t.game_state), Some(RoutingCategory::RelevantAllConnections));
        assert_eq!(policies.get(t.door), Some(RoutingCategory::SpatializeDormancy));
        assert_eq!(policies.get(t.tree), Some(RoutingCategory::SpatializeStatic));
        assert_eq!(policies.get(t.stats), Some(RoutingCategory::NotRouted));
        assert_eq!(policies.get(t.skel_pickup), None);
    }

    #[test]
    fn test_pawn_info_is_explicit() {
        let (mut graph, t) = graph();
        let info = graph.type_info(t.pawn);
        assert_eq!(info.cull_distance_squared, 225_000_000.0);
        assert_eq!(info.fast_shared_path.as_deref(), Some(FAST_SHARED_PATH_NAME));
        assert_eq!(info.channel_frame_timeout, 4);

        assert_eq!(graph.type_info(t.pickup).replication_period, 3);
        assert_eq!(graph.type_info(t.game_state).cull_distance_squared, 0.0);
    }

    #[test]
    fn test_fast_shared_constants_and_destruction_distance() {
        let (graph, _) = graph();
        assert_eq!(graph.fast_shared_path().max_bits_per_frame, 2730);
        assert_eq!(graph.fast_shared_path().distance_requirement_pct, 0.8);
        assert_eq!(graph.destruction_info_max_distance_squared(), 900_000_000.0);
    }

    #[test]
    fn test_multicast_policy() {
        let (mut graph, t) = graph();
        assert!(graph.multicast_opens_channel(t.pickup));
        assert!(!graph.multicast_opens_channel(t.controller));
        assert!(!graph.multicast_opens_channel(t.stats));

        let (registry, t) = registry();
        let mut settings = ClassSettings::route("PlayerController", RoutingCategory::NotRouted);
        settings.add_to_multicast_map = true;
        settings.multicast_opens_channel = true;
        let mut graph =
            ReplicationGraph::with_default_provider(GraphConfig::default().with_class_settings(settings), Box::new(registry));
        assert!(graph.multicast_opens_channel(t.controller));
    }

    #[test]
    fn test_disabled_graph_not_created() {
        let (registry, _) = registry();
        let mut config = config();
        config.disabled = true;
        assert!(ReplicationGraph::create(config, Box::new(registry), Box::new(DefaultTypeInfoProvider::default())).is_none());
    }

    #[test]
    fn test_register_dispatch() {
        let (mut graph, t) = graph();

        assert_eq!(
            graph.register_entity(EntityId(1), t.pickup, at(500.0, 500.0), None),
            Some(RoutingCategory::SpatializeDynamic)
        );
        assert_eq!(
            graph.register_entity(EntityId(2), t.game_state, at(0.0, 0.0), None),
            Some(RoutingCategory::RelevantAllConnections)
        );
        assert_eq!(
            graph.register_entity(EntityId(3), t.game_state, at(0.0, 0.0), Some(RegionId::new("Level1"))),
            Some(RoutingCategory::RelevantAllConnections)
        );
        assert_eq!(
            graph.register_entity(EntityId(4), t.status, at(0.0, 0.0), None),
            Some(RoutingCategory::NotRouted)
        );
        assert_eq!(
            graph.register_entity(EntityId(5), t.skel_pickup, at(0.0, 0.0), None),
            Some(RoutingCategory::SpatializeDynamic)
        );

        assert!(graph.grid().contains(EntityId(1)));
        assert!(graph.always_relevant().contains(EntityId(2)));
        assert!(!graph.always_relevant().contains(EntityId(3)));
        assert_eq!(graph.region_lists().get(&RegionId::new("Level1")), Some(&[EntityId(3)][..]));
        assert!(graph.limiter().contains(EntityId(4)));

        // Duplicate ids and unknown types are dropped
        assert_eq!(graph.register_entity(EntityId(1), t.pickup, at(0.0, 0.0), None), None);
        assert_eq!(graph.register_entity(EntityId(9), TypeId(999), at(0.0, 0.0), None), None);
        assert_eq!(graph.entity_count(), 5);
    }

    #[test]
    fn test_unregister_routes_through_category() {
        let (mut graph, t) = graph();
        graph.register_entity(EntityId(1), t.pickup, at(0.0, 0.0), None);
        graph.register_entity(EntityId(2), t.game_state, at(0.0, 0.0), None);

        assert!(graph.unregister_entity(EntityId(1)));
        assert!(!graph.grid().contains(EntityId(1)));
        assert!(graph.unregister_entity(EntityId(2)));
        assert!(graph.destruction_ignores_distance().contains(&EntityId(2)));
        assert!(!graph.unregister_entity(EntityId(2)));
    }

    #[test]
    fn test_category_change_leaves_node_untouched() {
        let (mut graph, t) = graph();
        graph.register_entity(EntityId(1), t.pickup, at(0.0, 0.0), None);
        graph.set_class_mapping("Pickup", RoutingCategory::SpatializeStatic).unwrap();

        assert!(!graph.unregister_entity(EntityId(1)));
        assert!(graph.grid().contains(EntityId(1)));
        assert!(graph.entity(EntityId(1)).is_some());
        assert_eq!(graph.register_entity(EntityId(1), t.pickup, at(0.0, 0.0), None), None);

        // Restoring the mapping lets the removal go through
        graph.set_class_mapping("Pickup", RoutingCategory::SpatializeDynamic).unwrap();
        assert!(graph.unregister_entity(EntityId(1)));
        assert!(!graph.grid().contains(EntityId(1)));
        assert!(graph.entity(EntityId(1)).is_none());
        assert_eq!(
            graph.register_entity(EntityId(1), t.pickup, at(0.0, 0.0), None),
            Some(RoutingCategory::SpatializeDynamic)
        );
        assert!(matches!(
            graph.set_class_mapping("Nope", RoutingCategory::NotRouted),
            Err(ConfigError::UnknownType(_))
        ));
    }

    #[test]
    fn test_tick_gather_order() {
        let (mut graph, t) = graph();
        let conn = ConnectionId::from_seed(1);
        graph.open_connection(conn);

        graph.register_entity(EntityId(10), t.pickup, at(500.0, 500.0), None);
        graph.register_entity(EntityId(20), t.game_state, at(0.0, 0.0), None);
        graph.register_entity(EntityId(30), t.status, at(0.0, 0.0), None);
        graph.register_entity(EntityId(40), t.pawn, at(500.0, 500.0), None);

        let viewer = NetViewer::new(conn, EntityId(1), at(500.0, 500.0), Some(EntityId(40)))
            .with_pawn(EntityId(40))
            .with_status_record(EntityId(30))
            .as_player();
        let frame = graph.tick(0, &[viewer]);

        // grid, always relevant, limiter, then the connection node (status record duplicated)
        assert_eq!(
            frame.list(conn),
            &[
                EntityId(10),
                EntityId(40),
                EntityId(20),
                EntityId(30),
                EntityId(1),
                EntityId(40),
                EntityId(30)
            ]
        );
        let info = graph.connection(conn).unwrap().actor_info(EntityId(30)).unwrap();
        assert_eq!(info.replication_period, Some(1));
        assert_eq!(
            graph.connection(conn).unwrap().actor_info(EntityId(40)).unwrap().cull_distance_squared,
            Some(0.0)
        );
    }

    #[test]
    fn test_status_record_parity_over_two_ticks() {
        let (mut graph, t) = graph();
        let conns: Vec<ConnectionId> = (0..4).map(ConnectionId::from_seed).collect();
        let mut viewers = Vec::new();
        for (i, conn) in conns.iter().enumerate() {
            graph.open_connection(*conn);
            let status = EntityId(100 + i as u64);
            graph.register_entity(status, t.status, at(0.0, 0.0), None);
            viewers.push(NetViewer::new(*conn, EntityId(i as u64), at(0.0, 0.0), None).with_status_record(status).as_player());
        }
        // Keep the limiter out of the way
        for i in 0..4 {
            graph.mark_pending_destroy(EntityId(100 + i));
        }

        let first = graph.tick(10, &viewers);
        let second = graph.tick(11, &viewers);
        for (i, conn) in conns.iter().enumerate() {
            let status = EntityId(100 + i as u64);
            let count = first.list(*conn).iter().chain(second.list(*conn)).filter(|e| **e == status).count();
            assert_eq!(count, 1, "connection {i}");
        }
    }

    #[test]
    fn test_region_gated_dormancy_through_graph() {
        let (mut graph, t) = graph();
        let conn = ConnectionId::from_seed(1);
        let r1 = RegionId::new("R1");
        graph.open_connection(conn);
        graph.register_entity(EntityId(1), t.game_state, at(0.0, 0.0), Some(r1.clone()));
        graph.register_entity(EntityId(2), t.game_state, at(0.0, 0.0), Some(r1.clone()));
        graph.set_region_visibility(conn, r1.clone(), true).unwrap();

        let frame = graph.tick(1, &[]);
        assert_eq!(frame.list(conn), &[EntityId(1), EntityId(2)]);

        graph.set_dormant_on_connection(conn, EntityId(1), true).unwrap();
        graph.set_dormant_on_connection(conn, EntityId(2), true).unwrap();
        let frame = graph.tick(2, &[]);
        assert!(frame.list(conn).is_empty());

        assert!(matches!(
            graph.set_region_visibility(ConnectionId::from_seed(9), r1, true),
            Err(RouteError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_dormancy_entity_switches_with_flag() {
        let (mut graph, t) = graph();
        graph.register_entity(EntityId(1), t.door, at(100.0, 100.0), None);
        assert_eq!(graph.grid_stats().dynamic_entities, 1);

        assert!(graph.set_entity_dormant(EntityId(1), true));
        assert_eq!(graph.grid_stats().static_entities, 1);
        assert!(graph.entity(EntityId(1)).unwrap().dormant);
    }

    #[test]
    fn test_pawn_replacement_reported_once() {
        let (mut graph, t) = graph();
        let conn = ConnectionId::from_seed(1);
        graph.open_connection(conn);
        graph.register_entity(EntityId(40), t.pawn, at(0.0, 0.0), None);
        graph.register_entity(EntityId(41), t.pawn, at(0.0, 0.0), None);

        let player = |pawn: u64| {
            NetViewer::new(conn, EntityId(1), at(0.0, 0.0), None)
                .with_pawn(EntityId(pawn))
                .as_player()
        };

        assert!(graph.tick(1, &[player(40)]).pawn_replacements.is_empty());
        let swapped = graph.tick(2, &[player(41)]);
        assert_eq!(swapped.pawn_replacements.len(), 1);
        assert_eq!(swapped.pawn_replacements[0].previous, EntityId(40));
        assert!(graph.tick(3, &[player(41)]).pawn_replacements.is_empty());

        let manager = graph.connection(conn).unwrap();
        assert_eq!(manager.actor_info(EntityId(40)).unwrap().cull_distance_squared, Some(225_000_000.0));
    }

    #[test]
    fn test_forced_status_record_cleared_after_tick() {
        let (mut graph, t) = graph();
        let conn = ConnectionId::from_seed(1);
        graph.open_connection(conn);
        for i in 0..6 {
            graph.register_entity(EntityId(100 + i), t.status, at(0.0, 0.0), None);
        }
        graph.force_net_update(EntityId(105));

        let frame = graph.tick(0, &[]);
        assert_eq!(frame.list(conn), &[EntityId(100), EntityId(101), EntityId(105)]);

        let frame = graph.tick(0, &[]);
        assert_eq!(frame.list(conn), &[EntityId(100), EntityId(101)]);
    }

    #[test]
    fn test_reset_game_world_state() {
        let (mut graph, t) = graph();
        let conn = ConnectionId::from_seed(1);
        graph.open_connection(conn);
        graph.register_entity(EntityId(1), t.game_state, at(0.0, 0.0), Some(RegionId::new("R1")));
        graph.set_region_visibility(conn, RegionId::new("R1"), true).unwrap();

        graph.reset_game_world_state();
        assert!(graph.region_lists().is_empty());
        assert!(graph.connection(conn).unwrap().node.tracked_regions().is_empty());
        assert!(graph.tick(0, &[]).list(conn).is_empty());
    }

    #[test]
    fn test_connections_lifecycle() {
        let (mut graph, _) = graph();
        let conn = ConnectionId::from_seed(1);
        assert!(graph.open_connection(conn));
        assert!(!graph.open_connection(conn));
        assert!(graph.close_connection(conn));
        assert!(!graph.close_connection(conn));
        assert_eq!(graph.connection_count(), 0);
    }
}
