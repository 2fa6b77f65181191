//! SimWorld - A seeded synthetic game world driving one replication graph.
//!
//! The world owns ground truth (entity positions and velocities), the graph
//! under test and the rewind registry for player pawns. Every random draw
//! comes from a single ChaCha8 stream seeded from `SimConfig::seed`, so two
//! worlds built from the same config produce identical frames.

use crate::error::SimError;
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use repgraph_core::{
    BoundingBox, ClassSettings, DefaultTypeInfoProvider, GraphConfig, NetViewer, ReplicationFrame, ReplicationGraph,
    RewindRegistry, RoutingCategory,
};
use repgraph_env::{ConnectionId, EntityId, InMemoryTypeRegistry, RegionId, TypeDefaults, TypeId, TypeRole};
use serde::Serialize;
use std::collections::BTreeMap;

/// Half extents of a pawn's collision bounds.
pub const PAWN_EXTENT: Vector3<f64> = Vector3::new(40.0, 40.0, 90.0);

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of player connections
    pub num_connections: usize,

    /// Number of props (pickups, doors, trees) spawned at startup
    pub num_entities: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Side length of the square play area
    pub world_extent: f64,

    /// Standard deviation of each velocity component (units/s)
    pub speed_std: f64,

    /// Chance per tick that a moving entity picks a new velocity
    pub turn_probability: f64,

    pub graph: GraphConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_connections: 8,
            num_entities: 400,
            tick_rate_hz: 30,
            world_extent: 60_000.0,
            speed_std: 600.0,
            turn_probability: 0.02,
            graph: sim_graph_config(),
        }
    }
}

/// Type ids of the simulated entity classes.
#[derive(Debug, Clone, Copy)]
pub struct SimTypes {
    pub actor: TypeId,
    pub pawn: TypeId,
    pub hero: TypeId,
    pub controller: TypeId,
    pub player_state: TypeId,
    pub game_state: TypeId,
    pub level_script: TypeId,
    pub pickup: TypeId,
    pub door: TypeId,
    pub tree: TypeId,
}

/// Registry with the simulated classes.
///
/// `BP_Hero` is a scripted pawn subtype and the only non-native class.
pub fn build_registry() -> Result<(InMemoryTypeRegistry, SimTypes), SimError> {
    let mut registry = InMemoryTypeRegistry::new();
    let actor = registry.register("Actor", None, TypeRole::Actor, true, TypeDefaults::default())?;
    let pawn = registry.register("Pawn", Some(actor), TypeRole::Pawn, true, TypeDefaults::replicated())?;
    let hero = registry.derive("BP_Hero", pawn)?;
    let controller = registry.register(
        "PlayerController",
        Some(actor),
        TypeRole::Controller,
        true,
        TypeDefaults::replicated().with_only_relevant_to_owner(true),
    )?;
    let player_state = registry.register(
        "PlayerState",
        Some(actor),
        TypeRole::StatusRecord,
        true,
        TypeDefaults::replicated().with_always_relevant(true).with_update_frequency(1.0),
    )?;
    let game_state = registry.register(
        "GameState",
        Some(actor),
        TypeRole::Actor,
        true,
        TypeDefaults::replicated().with_always_relevant(true),
    )?;
    let level_script = registry.register(
        "LevelScriptActor",
        Some(actor),
        TypeRole::Actor,
        true,
        TypeDefaults::replicated().with_always_relevant(true),
    )?;
    let pickup = registry.register(
        "Pickup",
        Some(actor),
        TypeRole::Actor,
        true,
        TypeDefaults::replicated().with_cull_distance(5_000.0).with_update_frequency(10.0),
    )?;
    let door = registry.register(
        "Door",
        Some(actor),
        TypeRole::Actor,
        true,
        TypeDefaults::replicated().with_cull_distance(8_000.0).with_update_frequency(2.0),
    )?;
    let tree = registry.register(
        "Tree",
        Some(actor),
        TypeRole::Actor,
        true,
        TypeDefaults::replicated().with_cull_distance(20_000.0).with_update_frequency(1.0),
    )?;

    let types = SimTypes {
        actor,
        pawn,
        hero,
        controller,
        player_state,
        game_state,
        level_script,
        pickup,
        door,
        tree,
    };
    Ok((registry, types))
}

/// Graph config matching the simulated classes.
pub fn sim_graph_config() -> GraphConfig {
    let mut config = GraphConfig::default()
        .with_class_settings(ClassSettings::route("PlayerState", RoutingCategory::NotRouted))
        .with_class_settings(ClassSettings::route("Door", RoutingCategory::SpatializeDormancy))
        .with_class_settings(ClassSettings::route("Tree", RoutingCategory::SpatializeStatic));
    config.base_pawn_type = Some("Pawn".to_string());
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Pawn,
    Controller,
    PlayerState,
    GameState,
    LevelScript,
    Pickup,
    Door,
    Tree,
}

impl EntityKind {
    pub fn moves(&self) -> bool {
        matches!(self, EntityKind::Pawn | EntityKind::Pickup)
    }
}

/// Ground truth for one entity.
#[derive(Debug, Clone)]
pub struct SimEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub type_id: TypeId,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub region: Option<RegionId>,
}

/// One player connection and the entities it owns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimPlayer {
    pub connection: ConnectionId,
    pub controller: EntityId,
    pub pawn: EntityId,
    pub player_state: EntityId,
}

/// The SimWorld - container for one simulation run.
pub struct SimWorld {
    config: SimConfig,
    rng: ChaCha8Rng,
    velocity_dist: Normal<f64>,
    types: SimTypes,

    graph: ReplicationGraph,
    rewind: RewindRegistry,

    entities: BTreeMap<EntityId, SimEntity>,
    players: Vec<SimPlayer>,
    next_id: u64,

    tick: u64,
    time: f64,
}

impl SimWorld {
    /// Builds an empty world. Fails if the graph is disabled by config.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.graph.validate()?;
        let (registry, types) = build_registry()?;
        let provider = DefaultTypeInfoProvider::new(config.graph.server_max_tick_rate);
        let graph = ReplicationGraph::create(config.graph.clone(), Box::new(registry), Box::new(provider))
            .ok_or(SimError::GraphDisabled)?;
        let velocity_dist = Normal::new(0.0, config.speed_std)?;

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            rewind: RewindRegistry::new(config.graph.rewind_max_record_duration),
            velocity_dist,
            types,
            graph,
            entities: BTreeMap::new(),
            players: Vec::new(),
            next_id: 1,
            tick: 0,
            time: 0.0,
            config,
        })
    }

    /// Spawns the game state, one player per connection and the props.
    pub fn populate(&mut self) {
        let center = Vector3::new(self.config.world_extent / 2.0, self.config.world_extent / 2.0, 0.0);
        self.spawn(EntityKind::GameState, center, None);

        for _ in 0..self.config.num_connections {
            self.add_player();
        }

        for _ in 0..self.config.num_entities {
            let kind = match self.rng.gen_range(0..10) {
                0..=5 => EntityKind::Pickup,
                6 | 7 => EntityKind::Door,
                _ => EntityKind::Tree,
            };
            let position = self.random_position();
            self.spawn(kind, position, None);
        }

        tracing::info!(
            "World populated: {} entities, {} players, grid {:?}",
            self.entities.len(),
            self.players.len(),
            self.graph.grid_stats()
        );
    }

    /// Registers a new entity with the graph.
    ///
    /// Returns `None` if the graph dropped it.
    pub fn spawn(&mut self, kind: EntityKind, position: Vector3<f64>, region: Option<RegionId>) -> Option<EntityId> {
        let id = EntityId(self.next_id);
        self.next_id += 1;

        let type_id = self.type_for(kind);
        let velocity = if kind.moves() { self.random_velocity() } else { Vector3::zeros() };

        self.graph.register_entity(id, type_id, position, region.clone())?;
        if kind == EntityKind::Pawn {
            self.rewind.add(id);
        }
        self.entities.insert(
            id,
            SimEntity {
                id,
                kind,
                type_id,
                position,
                velocity,
                region,
            },
        );
        Some(id)
    }

    pub fn despawn(&mut self, id: EntityId) -> bool {
        if self.entities.remove(&id).is_none() {
            return false;
        }
        self.rewind.remove(id);
        self.graph.unregister_entity(id)
    }

    /// Opens a connection with a controller, pawn and status record.
    pub fn add_player(&mut self) -> Option<SimPlayer> {
        let index = self.players.len() as u64;
        let connection = ConnectionId::from_seed(self.config.seed.wrapping_mul(1_000_003).wrapping_add(index));
        if !self.graph.open_connection(connection) {
            return None;
        }

        let position = self.random_position();
        let controller = self.spawn(EntityKind::Controller, position, None)?;
        let pawn = self.spawn(EntityKind::Pawn, position, None)?;
        let player_state = self.spawn(EntityKind::PlayerState, position, None)?;

        let player = SimPlayer {
            connection,
            controller,
            pawn,
            player_state,
        };
        self.players.push(player);
        Some(player)
    }

    /// Replaces a player's pawn with a fresh one at a random spot.
    pub fn respawn_pawn(&mut self, player: usize) -> Option<EntityId> {
        let old = self.players.get(player)?.pawn;
        self.despawn(old);

        let position = self.random_position();
        let pawn = self.spawn(EntityKind::Pawn, position, None)?;
        if let Some(p) = self.players.get_mut(player) {
            p.pawn = pawn;
        }
        Some(pawn)
    }

    /// Moves an entity without interpolation.
    pub fn teleport(&mut self, id: EntityId, position: Vector3<f64>) -> bool {
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };
        entity.position = position;
        if entity.kind == EntityKind::Pawn {
            if let Err(e) = self.rewind.set_just_teleported(id) {
                tracing::debug!("{}", e);
            }
        }
        self.graph.update_entity_position(id, position)
    }

    pub fn viewers(&self) -> Vec<NetViewer> {
        self.players
            .iter()
            .map(|p| {
                let position = self.position_of(p.pawn).unwrap_or_else(Vector3::zeros);
                NetViewer::new(p.connection, p.controller, position, None)
                    .with_pawn(p.pawn)
                    .with_status_record(p.player_state)
                    .as_player()
            })
            .collect()
    }

    /// Advances the world by one tick and replicates it.
    pub fn step(&mut self) -> ReplicationFrame {
        let dt = 1.0 / self.config.tick_rate_hz.max(1) as f64;
        self.time += dt;

        let extent = self.config.world_extent;
        let movers: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.kind.moves())
            .map(|e| e.id)
            .collect();

        for id in movers {
            let turn = self.rng.gen_bool(self.config.turn_probability.clamp(0.0, 1.0));
            let new_velocity = turn.then(|| self.random_velocity());

            let Some(entity) = self.entities.get_mut(&id) else {
                continue;
            };
            if let Some(velocity) = new_velocity {
                entity.velocity = velocity;
            }

            let mut next = entity.position + entity.velocity * dt;
            let wrapped = next.x < 0.0 || next.x >= extent || next.y < 0.0 || next.y >= extent;
            if wrapped {
                next.x = next.x.rem_euclid(extent);
                next.y = next.y.rem_euclid(extent);
            }
            entity.position = next;
            let is_pawn = entity.kind == EntityKind::Pawn;

            if wrapped && is_pawn {
                if let Err(e) = self.rewind.set_just_teleported(id) {
                    tracing::debug!("{}", e);
                }
            }
            self.graph.update_entity_position(id, next);
        }

        // Controllers follow their pawns
        for player in &self.players {
            if let Some(position) = self.entities.get(&player.pawn).map(|e| e.position) {
                if let Some(controller) = self.entities.get_mut(&player.controller) {
                    controller.position = position;
                }
                self.graph.update_entity_position(player.controller, position);
            }
        }

        let now = self.time;
        let samples = self
            .entities
            .values()
            .filter(|e| e.kind == EntityKind::Pawn)
            .map(|e| (e.id, BoundingBox::from_center_extent(e.position, PAWN_EXTENT)));
        self.rewind.record_tick(now, samples, true);

        let viewers = self.viewers();
        let frame = self.graph.tick(self.tick, &viewers);
        self.tick += 1;
        frame
    }

    fn type_for(&self, kind: EntityKind) -> TypeId {
        match kind {
            EntityKind::Pawn => self.types.hero,
            EntityKind::Controller => self.types.controller,
            EntityKind::PlayerState => self.types.player_state,
            EntityKind::GameState => self.types.game_state,
            EntityKind::LevelScript => self.types.level_script,
            EntityKind::Pickup => self.types.pickup,
            EntityKind::Door => self.types.door,
            EntityKind::Tree => self.types.tree,
        }
    }

    fn random_position(&mut self) -> Vector3<f64> {
        let extent = self.config.world_extent;
        Vector3::new(self.rng.gen_range(0.0..extent), self.rng.gen_range(0.0..extent), 0.0)
    }

    fn random_velocity(&mut self) -> Vector3<f64> {
        Vector3::new(
            self.velocity_dist.sample(&mut self.rng),
            self.velocity_dist.sample(&mut self.rng),
            0.0,
        )
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn types(&self) -> &SimTypes {
        &self.types
    }

    pub fn graph(&self) -> &ReplicationGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ReplicationGraph {
        &mut self.graph
    }

    pub fn rewind(&self) -> &RewindRegistry {
        &self.rewind
    }

    pub fn entity(&self, id: EntityId) -> Option<&SimEntity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &SimEntity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn position_of(&self, id: EntityId) -> Option<Vector3<f64>> {
        self.entities.get(&id).map(|e| e.position)
    }

    pub fn players(&self) -> &[SimPlayer] {
        &self.players
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn time(&self) -> f64 {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(seed: u64) -> SimConfig {
        SimConfig {
            seed,
            num_connections: 3,
            num_entities: 40,
            world_extent: 20_000.0,
            ..SimConfig::default()
        }
    }

    #[test]
    fn test_registry_routes_sim_classes() {
        let mut world = SimWorld::new(small_config(1)).unwrap();
        let types = *world.types();
        let graph = world.graph_mut();

        assert_eq!(graph.resolve_type(types.hero), RoutingCategory::SpatializeDynamic);
        assert_eq!(graph.resolve_type(types.controller), RoutingCategory::NotRouted);
        assert_eq!(graph.resolve_type(types.player_state), RoutingCategory::NotRouted);
        assert_eq!(graph.resolve_type(types.game_state), RoutingCategory::RelevantAllConnections);
        assert_eq!(graph.resolve_type(types.door), RoutingCategory::SpatializeDormancy);
        assert_eq!(graph.resolve_type(types.tree), RoutingCategory::SpatializeStatic);
        assert!(!graph.multicast_opens_channel(types.controller));
        assert!(graph.multicast_opens_channel(types.pickup));
    }

    #[test]
    fn test_populate_counts() {
        let mut world = SimWorld::new(small_config(1)).unwrap();
        world.populate();

        // game state + 3 entities per player + props
        assert_eq!(world.entity_count(), 1 + 3 * 3 + 40);
        assert_eq!(world.players().len(), 3);
        assert_eq!(world.graph().connection_count(), 3);
        assert!(world.graph().limiter().contains(world.players()[0].player_state));
        assert_eq!(world.rewind().len(), 3);
    }

    #[test]
    fn test_disabled_graph_rejected() {
        let mut config = small_config(1);
        config.graph.disabled = true;
        assert!(matches!(SimWorld::new(config), Err(SimError::GraphDisabled)));
    }

    #[test]
    fn test_same_seed_same_frames() {
        let mut a = SimWorld::new(small_config(7)).unwrap();
        let mut b = SimWorld::new(small_config(7)).unwrap();
        a.populate();
        b.populate();

        for _ in 0..20 {
            assert_eq!(a.step(), b.step());
        }
    }

    #[test]
    fn test_step_records_pawn_history() {
        let mut world = SimWorld::new(small_config(3)).unwrap();
        world.populate();
        for _ in 0..5 {
            world.step();
        }

        let pawn = world.players()[0].pawn;
        let history = world.rewind().get(pawn).unwrap().history();
        assert_eq!(history.len(), 5);
        let newest = history.newest().unwrap();
        assert!((newest.bounds.center() - world.position_of(pawn).unwrap()).norm() < 1e-6);
    }

    #[test]
    fn test_respawn_replaces_pawn() {
        let mut world = SimWorld::new(small_config(5)).unwrap();
        world.populate();
        world.step();

        let old = world.players()[1].pawn;
        let new = world.respawn_pawn(1).unwrap();
        assert_ne!(old, new);
        assert!(world.entity(old).is_none());
        assert!(world.graph().entity(old).is_none());
        assert!(world.rewind().get(old).is_none());

        let frame = world.step();
        let connection = world.players()[1].connection;
        assert!(frame.list(connection).contains(&new));
        assert!(frame
            .pawn_replacements
            .iter()
            .any(|r| r.connection == connection && r.previous == old && r.current == new));
    }
}
