//! Scenario runner - drives a SimWorld through each scenario and checks the frames.

use crate::scenarios::ScenarioId;
use crate::world::{sim_graph_config, EntityKind, SimConfig, SimWorld};

use nalgebra::Vector3;
use repgraph_core::{FrozenRewindState, GraphConfig, RewindError};
use repgraph_env::{ConnectionId, EntityId, RegionId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of live entities at end
    pub final_entity_count: usize,

    /// First failed assertion, if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Sum of all replication list lengths
    pub entities_gathered: u64,

    /// Longest single replication list
    pub max_list_len: usize,

    /// Pawn replacements reported by the graph
    pub pawn_replacements: u64,

    /// Status records delivered across all connections
    pub status_records_sent: u64,

    /// Region visibility changes applied
    pub region_toggles: u64,

    /// Rewind lookups issued against frozen state
    pub rewind_queries: u64,

    /// Largest distance between a rewound center and ground truth
    pub max_rewind_error: f64,
}

impl ScenarioMetrics {
    fn observe_list(&mut self, list: &[EntityId]) {
        self.entities_gathered += list.len() as u64;
        self.max_list_len = self.max_list_len.max(list.len());
    }
}

/// Runs replication scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of player connections
    num_connections: usize,

    /// Number of props spawned at startup
    num_entities: usize,

    /// Ticks per scenario
    num_ticks: u64,

    graph_config: GraphConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_connections: usize) -> Self {
        Self {
            seed,
            num_connections,
            num_entities: 400,
            num_ticks: 150,
            graph_config: sim_graph_config(),
        }
    }

    pub fn with_entities(mut self, num_entities: usize) -> Self {
        self.num_entities = num_entities;
        self
    }

    pub fn with_ticks(mut self, num_ticks: u64) -> Self {
        self.num_ticks = num_ticks;
        self
    }

    /// Replaces the graph config (for example one loaded from `--config`).
    pub fn with_graph_config(mut self, graph_config: GraphConfig) -> Self {
        self.graph_config = graph_config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let mut world = match SimWorld::new(self.sim_config()) {
            Ok(world) => world,
            Err(e) => {
                warn!("Could not build world: {}", e);
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    final_entity_count: 0,
                    failure_reason: Some(e.to_string()),
                    metrics: ScenarioMetrics::default(),
                };
            }
        };
        world.populate();

        let mut metrics = ScenarioMetrics::default();
        let outcome = match scenario {
            ScenarioId::Crowd => self.run_crowd(&mut world, &mut metrics),
            ScenarioId::Streaming => self.run_streaming(&mut world, &mut metrics),
            ScenarioId::StatusFlood => self.run_status_flood(&mut world, &mut metrics),
            ScenarioId::Rewind => self.run_rewind(&mut world, &mut metrics),
        };

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            total_ticks: world.tick(),
            final_time_secs: world.time(),
            final_entity_count: world.entity_count(),
            failure_reason: outcome.err(),
            metrics,
        }
    }

    fn sim_config(&self) -> SimConfig {
        SimConfig {
            seed: self.seed,
            num_connections: self.num_connections,
            num_entities: self.num_entities,
            graph: self.graph_config.clone(),
            ..SimConfig::default()
        }
    }

    /// RG-001: Crowd - moving pawns and props under the grid.
    ///
    /// Every tick, each connection must receive its controller, its pawn and
    /// the game state, and nothing spatial beyond the entity's cull distance
    /// plus one cell diagonal (the grid culls by cell, not by position).
    /// Pawns are respawned periodically and each respawn must surface as
    /// exactly one pawn replacement.
    fn run_crowd(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        info!("RG-001: Crowd - {} connections, {} props", self.num_connections, self.num_entities);

        let game_state = find_kind(world, EntityKind::GameState).ok_or("no game state spawned")?;
        let doors: Vec<EntityId> = world
            .entities()
            .filter(|e| e.kind == EntityKind::Door)
            .map(|e| e.id)
            .collect();
        let slack = world.config().graph.spatial.cell_size * std::f64::consts::SQRT_2 + 1e-6;

        let respawn_interval = 50;
        let mut expected_replacements = 0;

        for tick in 0..self.num_ticks {
            let players = world.players().len();
            if tick > 0 && tick % respawn_interval == 0 && players > 0 {
                let player = (tick / respawn_interval) as usize % players;
                if world.respawn_pawn(player).is_some() {
                    expected_replacements += 1;
                }
            }

            // Doors go dormant and wake on a slow cycle
            if tick % 30 == 15 {
                let dormant = (tick / 30) % 2 == 0;
                for door in doors.iter().step_by(3) {
                    world.graph_mut().set_entity_dormant(*door, dormant);
                }
            }

            let frame = world.step();
            metrics.pawn_replacements += frame.pawn_replacements.len() as u64;

            for player in world.players() {
                let list = frame.list(player.connection);
                metrics.observe_list(list);

                for required in [player.controller, player.pawn, game_state] {
                    if !list.contains(&required) {
                        return Err(format!("tick {}: {} missing {}", tick, player.connection, required));
                    }
                }

                let viewer = world.position_of(player.pawn).unwrap_or_else(Vector3::zeros);
                for id in list {
                    let entity = world
                        .entity(*id)
                        .ok_or_else(|| format!("tick {}: gathered unknown {}", tick, id))?;
                    match entity.kind {
                        EntityKind::Controller if *id != player.controller => {
                            return Err(format!("tick {}: {} received foreign controller {}", tick, player.connection, id));
                        }
                        EntityKind::Pawn | EntityKind::Pickup | EntityKind::Door | EntityKind::Tree
                            if *id != player.pawn =>
                        {
                            let cull = world
                                .graph()
                                .entity(*id)
                                .map(|r| r.cull_distance_squared.sqrt())
                                .unwrap_or_default();
                            let distance = (entity.position.xy() - viewer.xy()).norm();
                            if distance > cull + slack {
                                return Err(format!(
                                    "tick {}: {} received {} at {:.0} units (cull {:.0})",
                                    tick, player.connection, id, distance, cull
                                ));
                            }
                        }
                        _ => {}
                    }
                }
            }

            if tick % 30 == 0 {
                debug!(
                    "  t={:.1}s | lists={} | gathered={} | grid={:?}",
                    world.time(),
                    frame.lists.len(),
                    frame.total_entities(),
                    world.graph().grid_stats()
                );
            }
        }

        if metrics.pawn_replacements != expected_replacements {
            return Err(format!(
                "expected {} pawn replacements, graph reported {}",
                expected_replacements, metrics.pawn_replacements
            ));
        }

        info!(
            "✓ Crowd complete: {} entities gathered, longest list {}",
            metrics.entities_gathered, metrics.max_list_len
        );
        Ok(())
    }

    /// RG-002: Streaming - region lists follow client visibility.
    ///
    /// Each connection sees a rotating subset of regions. A region's entities
    /// must be present exactly while it is visible. Removing one entity adds
    /// it to the destruction set, and a world reset drops every region.
    fn run_streaming(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        info!("RG-002: Streaming - region gated always relevant lists");

        let regions: Vec<RegionId> = ["Level_North", "Level_South", "Level_East"]
            .iter()
            .map(RegionId::new)
            .collect();

        let mut members: BTreeMap<RegionId, Vec<EntityId>> = BTreeMap::new();
        for region in &regions {
            for i in 0..3 {
                let position = Vector3::new(1_000.0 * i as f64, 0.0, 0.0);
                let id = world
                    .spawn(EntityKind::LevelScript, position, Some(region.clone()))
                    .ok_or_else(|| format!("failed to spawn level script in {}", region))?;
                members.entry(region.clone()).or_default().push(id);
            }
        }

        let connections: Vec<ConnectionId> = world.players().iter().map(|p| p.connection).collect();
        let toggle_period = 20;
        let removal_tick = self.num_ticks / 2;
        let mut visible: BTreeMap<(ConnectionId, RegionId), bool> = BTreeMap::new();

        for tick in 0..self.num_ticks {
            for (c, connection) in connections.iter().enumerate() {
                for (r, region) in regions.iter().enumerate() {
                    let want = ((tick / toggle_period) as usize + c + r) % 2 == 0;
                    let key = (*connection, region.clone());
                    if visible.get(&key) != Some(&want) {
                        world
                            .graph_mut()
                            .set_region_visibility(*connection, region.clone(), want)
                            .map_err(|e| e.to_string())?;
                        visible.insert(key, want);
                        metrics.region_toggles += 1;
                    }
                }
            }

            if tick == removal_tick {
                let removed = members
                    .get_mut(&regions[0])
                    .and_then(|m| m.pop())
                    .ok_or("region has no members left")?;
                if !world.despawn(removed) {
                    return Err(format!("tick {}: failed to remove {}", tick, removed));
                }
                if !world.graph().destruction_ignores_distance().contains(&removed) {
                    return Err(format!("tick {}: {} not in destruction set", tick, removed));
                }
            }

            let frame = world.step();
            for connection in &connections {
                let list = frame.list(*connection);
                metrics.observe_list(list);

                for region in &regions {
                    let shown = visible.get(&(*connection, region.clone())).copied().unwrap_or(false);
                    for id in members.get(region).map(Vec::as_slice).unwrap_or(&[]) {
                        if list.contains(id) != shown {
                            return Err(format!(
                                "tick {}: {} of {} present={} while visible={} on {}",
                                tick,
                                id,
                                region,
                                list.contains(id),
                                shown,
                                connection
                            ));
                        }
                    }
                }
            }
        }

        // A reset forgets every region until the host streams them back in
        world.graph_mut().reset_game_world_state();
        let frame = world.step();
        let all_members: HashSet<EntityId> = members.values().flatten().copied().collect();
        for connection in &connections {
            if frame.list(*connection).iter().any(|id| all_members.contains(id)) {
                return Err(format!("{} still receives region entities after reset", connection));
            }
        }

        info!("✓ Streaming complete: {} visibility changes", metrics.region_toggles);
        Ok(())
    }

    /// RG-003: StatusFlood - every status record reaches every connection.
    ///
    /// The limiter sends a few records per tick. Each record must reach each
    /// connection at least once per rotation (twice a rotation around a
    /// forced update, which reshuffles one tick's buckets). A forced record
    /// goes out to everyone on the next tick, and a record pending destroy
    /// stops reaching other connections.
    fn run_status_flood(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        info!("RG-003: StatusFlood - {} status records", world.players().len());

        let players = world.players().to_vec();
        let records: Vec<EntityId> = players.iter().map(|p| p.player_state).collect();
        let target = world.config().graph.status_records_per_tick.max(1);
        let rotation = (records.len().div_ceil(target)).max(1) as u64;

        let force_tick = self.num_ticks / 3;
        let destroy_tick = 2 * self.num_ticks / 3;
        let forced = records.first().copied();
        let doomed = records.last().copied().filter(|_| records.len() > 1);

        let mut last_seen: BTreeMap<(ConnectionId, EntityId), u64> = BTreeMap::new();

        for tick in 0..self.num_ticks {
            if tick == force_tick {
                if let Some(id) = forced {
                    world.graph_mut().force_net_update(id);
                }
            }
            if tick == destroy_tick {
                if let Some(id) = doomed {
                    world.graph_mut().mark_pending_destroy(id);
                }
            }

            let frame = world.step();
            for player in &players {
                let list = frame.list(player.connection);
                metrics.observe_list(list);

                let statuses: Vec<EntityId> = list.iter().copied().filter(|id| records.contains(id)).collect();
                metrics.status_records_sent += statuses.len() as u64;

                // limiter bucket, own record on alternating ticks, one forced record
                let budget = target + 1 + usize::from(tick == force_tick);
                if statuses.len() > budget {
                    return Err(format!(
                        "tick {}: {} received {} status records (budget {})",
                        tick,
                        player.connection,
                        statuses.len(),
                        budget
                    ));
                }

                if tick == force_tick {
                    if let Some(id) = forced {
                        if !statuses.contains(&id) {
                            return Err(format!("tick {}: forced {} missing on {}", tick, id, player.connection));
                        }
                    }
                }

                if let Some(id) = doomed.filter(|_| tick >= destroy_tick) {
                    if id != player.player_state && statuses.contains(&id) {
                        return Err(format!("tick {}: {} pending destroy but sent to {}", tick, id, player.connection));
                    }
                }

                for id in &statuses {
                    last_seen.insert((player.connection, *id), tick);
                }
            }

            if tick + 1 < rotation {
                continue;
            }
            let allowed = if tick >= force_tick && tick < force_tick + 2 * rotation {
                2 * rotation
            } else {
                rotation
            };
            for player in &players {
                for id in &records {
                    if Some(*id) == doomed && tick >= destroy_tick {
                        continue;
                    }
                    let seen = last_seen.get(&(player.connection, *id)).copied();
                    let stale = match seen {
                        Some(seen) => tick - seen >= allowed,
                        None => tick + 1 >= allowed,
                    };
                    if stale {
                        return Err(format!(
                            "tick {}: {} has not received {} within {} ticks",
                            tick, player.connection, id, allowed
                        ));
                    }
                }
            }
        }

        info!(
            "✓ StatusFlood complete: {} status records sent, rotation {} ticks",
            metrics.status_records_sent, rotation
        );
        Ok(())
    }

    /// RG-004: Rewind - lag-compensated lookups against ground truth.
    ///
    /// Every recorded tick inside the history window must rewind to the
    /// exact logged center, and midpoints between ticks to the average of
    /// their neighbors unless a teleport separates them. Queries run on
    /// worker threads against one frozen state.
    fn run_rewind(&self, world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), String> {
        info!("RG-004: Rewind - pawn history lookups");

        let pawns: Vec<EntityId> = world.players().iter().map(|p| p.pawn).collect();
        let mut trajectories: BTreeMap<EntityId, Vec<(f64, Vector3<f64>)>> = BTreeMap::new();
        let teleport_tick = self.num_ticks.saturating_sub(5);

        for tick in 0..self.num_ticks {
            if tick == teleport_tick {
                if let Some(pawn) = pawns.first() {
                    let extent = world.config().world_extent;
                    world.teleport(*pawn, Vector3::new(extent / 2.0, extent / 2.0, 0.0));
                }
            }

            let frame = world.step();
            for list in frame.lists.values() {
                metrics.observe_list(list);
            }
            for pawn in &pawns {
                if let Some(position) = world.position_of(*pawn) {
                    trajectories.entry(*pawn).or_default().push((world.time(), position));
                }
            }
        }

        let frozen = world.rewind().freeze();
        let window = world.config().graph.rewind_max_record_duration;
        let oldest_kept = world.time() - window + 1e-6;

        let results: Vec<Result<(u64, f64), String>> = std::thread::scope(|scope| {
            let workers: Vec<_> = trajectories
                .iter()
                .map(|(pawn, trajectory)| {
                    let frozen = frozen.clone();
                    scope.spawn(move || check_trajectory(&frozen, *pawn, trajectory, oldest_kept))
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or_else(|_| Err("rewind worker panicked".to_string())))
                .collect()
        });

        for result in results {
            let (queries, error) = result?;
            metrics.rewind_queries += queries;
            metrics.max_rewind_error = metrics.max_rewind_error.max(error);
        }

        if world.time() > window + 1.0 {
            let too_old = world.time() - window - 1.0;
            for pawn in &pawns {
                metrics.rewind_queries += 1;
                match frozen.query(*pawn, too_old) {
                    Err(RewindError::BeforeHistory { .. }) => {}
                    other => return Err(format!("{} at {:.3}s: expected BeforeHistory, got {:?}", pawn, too_old, other)),
                }
            }
        }

        info!(
            "✓ Rewind complete: {} queries, max error {:.6}",
            metrics.rewind_queries, metrics.max_rewind_error
        );
        Ok(())
    }
}

fn find_kind(world: &SimWorld, kind: EntityKind) -> Option<EntityId> {
    world.entities().find(|e| e.kind == kind).map(|e| e.id)
}

/// Checks one pawn's rewound centers against its logged trajectory.
///
/// Returns the number of queries and the largest error.
fn check_trajectory(
    frozen: &FrozenRewindState,
    pawn: EntityId,
    trajectory: &[(f64, Vector3<f64>)],
    oldest_kept: f64,
) -> Result<(u64, f64), String> {
    const TOLERANCE: f64 = 1e-6;
    let mut queries = 0;
    let mut max_error: f64 = 0.0;

    let kept: Vec<&(f64, Vector3<f64>)> = trajectory.iter().filter(|(t, _)| *t >= oldest_kept).collect();
    for (time, expected) in &kept {
        queries += 1;
        let snapshot = frozen
            .query(pawn, *time)
            .map_err(|e| format!("{} at {:.3}s: {}", pawn, time, e))?;
        let error = (snapshot.bounds.center() - expected).norm();
        max_error = max_error.max(error);
        if error > TOLERANCE {
            return Err(format!("{} at {:.3}s rewound {:.3} units off", pawn, time, error));
        }
    }

    for pair in kept.windows(2) {
        let ((t0, p0), (t1, p1)) = (pair[0], pair[1]);
        let midpoint = (t0 + t1) / 2.0;
        queries += 1;
        let snapshot = frozen
            .query(pawn, midpoint)
            .map_err(|e| format!("{} at {:.3}s: {}", pawn, midpoint, e))?;
        if snapshot.teleported {
            continue;
        }
        let expected = (p0 + p1) / 2.0;
        let error = (snapshot.bounds.center() - expected).norm();
        max_error = max_error.max(error);
        if error > TOLERANCE {
            return Err(format!("{} at {:.3}s interpolated {:.3} units off", pawn, midpoint, error));
        }
    }

    Ok((queries, max_error))
}
