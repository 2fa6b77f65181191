//! The "TIME" Engine - Rewindable entity history for lag compensation
//!
//! Each server-authoritative entity records a bounding box once per tick.
//! The history is bounded by age, not count: snapshots older than
//! `max_record_duration` relative to the newest one are evicted, but the
//! newest snapshot is always kept.
//!
//! Lag-compensated queries do not touch live histories. They run against a
//! [`FrozenRewindState`] taken at the start of the tick, which is cheap to
//! clone and can be shared across threads.

use crate::error::RewindError;
use nalgebra::Vector3;
use repgraph_env::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Two timestamps this close are the same instant.
const TIME_TOLERANCE: f64 = 1e-9;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl BoundingBox {
    pub fn new(min: Vector3<f64>, max: Vector3<f64>) -> Self {
        Self { min, max }
    }

    pub fn from_center_extent(center: Vector3<f64>, extent: Vector3<f64>) -> Self {
        Self {
            min: center - extent,
            max: center + extent,
        }
    }

    pub fn center(&self) -> Vector3<f64> {
        (self.min + self.max) * 0.5
    }

    /// Linear blend of both corners, `t` in [0, 1].
    pub fn lerp(&self, other: &BoundingBox, t: f64) -> BoundingBox {
        BoundingBox {
            min: self.min.lerp(&other.min, t),
            max: self.max.lerp(&other.max, t),
        }
    }
}

/// State of an entity at one server time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewindSnapshot {
    /// Monotonic server time in seconds
    pub time: f64,
    pub bounds: BoundingBox,

    /// Entity jumped since the previous snapshot
    pub teleported: bool,
}

impl RewindSnapshot {
    pub fn new(time: f64, bounds: BoundingBox, teleported: bool) -> Self {
        Self { time, bounds, teleported }
    }
}

/// Time-indexed lookup over snapshots ordered newest first.
fn query_frames(frames: &VecDeque<RewindSnapshot>, time: f64) -> Result<RewindSnapshot, RewindError> {
    let (Some(newest), Some(oldest)) = (frames.front(), frames.back()) else {
        return Err(RewindError::Empty);
    };

    if time < oldest.time - TIME_TOLERANCE {
        return Err(RewindError::BeforeHistory {
            requested: time,
            oldest: oldest.time,
        });
    }
    if time >= newest.time - TIME_TOLERANCE {
        return Ok(*newest);
    }

    // Newest to oldest, stop at the first snapshot not after `time`
    for (younger, older) in frames.iter().zip(frames.iter().skip(1)) {
        if older.time > time + TIME_TOLERANCE {
            continue;
        }
        if (older.time - time).abs() <= TIME_TOLERANCE {
            return Ok(*older);
        }

        let span = younger.time - older.time;
        if span <= TIME_TOLERANCE {
            return Ok(*older);
        }
        let fraction = ((time - older.time) / span).clamp(0.0, 1.0);
        return Ok(RewindSnapshot {
            time,
            bounds: older.bounds.lerp(&younger.bounds, fraction),
            teleported: older.teleported || younger.teleported,
        });
    }

    Ok(*oldest)
}

/// Age-bounded history of one entity, newest at the front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewindHistory {
    frames: VecDeque<RewindSnapshot>,
    max_record_duration: f64,
}

impl RewindHistory {
    pub fn new(max_record_duration: f64) -> Self {
        Self {
            frames: VecDeque::new(),
            max_record_duration,
        }
    }

    /// Pushes a snapshot and evicts anything older than the window.
    pub fn record(&mut self, snapshot: RewindSnapshot) {
        let had_history = self.frames.len() > 1;
        self.frames.push_front(snapshot);
        if !had_history {
            return;
        }

        while self.frames.len() > 1 {
            let (Some(head), Some(tail)) = (self.frames.front(), self.frames.back()) else {
                break;
            };
            if head.time - tail.time <= self.max_record_duration {
                break;
            }
            self.frames.pop_back();
        }
    }

    pub fn query(&self, time: f64) -> Result<RewindSnapshot, RewindError> {
        query_frames(&self.frames, time)
    }

    pub fn newest(&self) -> Option<&RewindSnapshot> {
        self.frames.front()
    }

    pub fn oldest(&self) -> Option<&RewindSnapshot> {
        self.frames.back()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn max_record_duration(&self) -> f64 {
        self.max_record_duration
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Immutable copy for queries outside the tick.
    pub fn freeze(&self) -> FrozenHistory {
        FrozenHistory(Arc::new(self.frames.clone()))
    }
}

/// Read-only history snapshot.
#[derive(Debug, Clone)]
pub struct FrozenHistory(Arc<VecDeque<RewindSnapshot>>);

impl FrozenHistory {
    pub fn query(&self, time: f64) -> Result<RewindSnapshot, RewindError> {
        query_frames(&self.0, time)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// COMPONENT
// ============================================================================

/// Rewind state owned by one entity.
#[derive(Debug, Clone)]
pub struct RewindableComponent {
    history: RewindHistory,
    just_teleported: bool,
}

impl RewindableComponent {
    pub fn new(max_record_duration: f64) -> Self {
        Self {
            history: RewindHistory::new(max_record_duration),
            just_teleported: false,
        }
    }

    /// Flags the next recorded snapshot as a teleport.
    pub fn set_just_teleported(&mut self) {
        self.just_teleported = true;
    }

    /// Records the tick's bounds. Only the authority records.
    pub fn tick(&mut self, now: f64, bounds: BoundingBox, has_authority: bool) -> bool {
        if !has_authority {
            return false;
        }
        self.history
            .record(RewindSnapshot::new(now, bounds, self.just_teleported));
        self.just_teleported = false;
        true
    }

    pub fn query(&self, time: f64) -> Result<RewindSnapshot, RewindError> {
        self.history.query(time)
    }

    pub fn rewound_bounds(&self, time: f64) -> Result<BoundingBox, RewindError> {
        self.query(time).map(|s| s.bounds)
    }

    pub fn history(&self) -> &RewindHistory {
        &self.history
    }
}

/// Rewind components of every tracked entity.
#[derive(Debug, Clone)]
pub struct RewindRegistry {
    components: BTreeMap<EntityId, RewindableComponent>,
    max_record_duration: f64,
}

impl RewindRegistry {
    pub fn new(max_record_duration: f64) -> Self {
        Self {
            components: BTreeMap::new(),
            max_record_duration,
        }
    }

    /// Starts tracking an entity. Existing history is kept.
    pub fn add(&mut self, id: EntityId) {
        let duration = self.max_record_duration;
        self.components
            .entry(id)
            .or_insert_with(|| RewindableComponent::new(duration));
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        self.components.remove(&id).is_some()
    }

    pub fn get(&self, id: EntityId) -> Option<&RewindableComponent> {
        self.components.get(&id)
    }

    pub fn set_just_teleported(&mut self, id: EntityId) -> Result<(), RewindError> {
        self.components
            .get_mut(&id)
            .map(RewindableComponent::set_just_teleported)
            .ok_or(RewindError::Untracked(id))
    }

    /// Records one entity's bounds for this tick.
    pub fn record(&mut self, id: EntityId, now: f64, bounds: BoundingBox, has_authority: bool) -> Result<bool, RewindError> {
        let component = self.components.get_mut(&id).ok_or(RewindError::Untracked(id))?;
        Ok(component.tick(now, bounds, has_authority))
    }

    /// Records a whole tick. Untracked entities are skipped.
    ///
    /// Returns the number of snapshots recorded.
    pub fn record_tick<I>(&mut self, now: f64, samples: I, has_authority: bool) -> usize
    where
        I: IntoIterator<Item = (EntityId, BoundingBox)>,
    {
        let mut recorded = 0;
        for (id, bounds) in samples {
            match self.record(id, now, bounds, has_authority) {
                Ok(true) => recorded += 1,
                Ok(false) => {}
                Err(e) => tracing::debug!("Skipping rewind sample: {}", e),
            }
        }
        recorded
    }

    /// Immutable view of every history, for this tick's lag-compensation queries.
    pub fn freeze(&self) -> FrozenRewindState {
        let histories = self
            .components
            .iter()
            .map(|(id, c)| (*id, c.history.freeze()))
            .collect();
        FrozenRewindState {
            histories: Arc::new(histories),
        }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Frozen rewind state, safe to share with query workers.
#[derive(Debug, Clone)]
pub struct FrozenRewindState {
    histories: Arc<BTreeMap<EntityId, FrozenHistory>>,
}

impl FrozenRewindState {
    pub fn query(&self, id: EntityId, time: f64) -> Result<RewindSnapshot, RewindError> {
        self.histories
            .get(&id)
            .ok_or(RewindError::Untracked(id))?
            .query(time)
    }

    pub fn rewound_bounds(&self, id: EntityId, time: f64) -> Result<BoundingBox, RewindError> {
        self.query(id, time).map(|s| s.bounds)
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.histories.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}
