//! Frequency limiter for large homogeneous sets (status records).
//!
//! Buckets are rebuilt from scratch every tick, so membership shifts as
//! candidates come and go. That keeps the node simple; a candidate can be
//! skipped or repeated across the tick where the set changes.

use crate::error::RouteError;
use crate::node::{GatherParams, GlobalGraphNode};
use repgraph_env::EntityId;
use std::collections::HashSet;

/// Rotates through candidates, `target_per_tick` at a time.
#[derive(Debug, Clone)]
pub struct FrequencyLimiterNode {
    target_per_tick: usize,
    candidates: Vec<EntityId>,
    pending_destroy: HashSet<EntityId>,
    forced: HashSet<EntityId>,

    buckets: Vec<Vec<EntityId>>,
    force_list: Vec<EntityId>,
}

impl FrequencyLimiterNode {
    pub fn new(target_per_tick: usize) -> Self {
        Self {
            target_per_tick: target_per_tick.max(1),
            candidates: Vec::new(),
            pending_destroy: HashSet::new(),
            forced: HashSet::new(),
            buckets: vec![Vec::new()],
            force_list: Vec::new(),
        }
    }

    pub fn add_candidate(&mut self, id: EntityId) {
        if !self.candidates.contains(&id) {
            self.candidates.push(id);
        }
    }

    pub fn remove_candidate(&mut self, id: EntityId) -> Result<(), RouteError> {
        let pos = self
            .candidates
            .iter()
            .position(|e| *e == id)
            .ok_or_else(|| RouteError::not_found(id, "frequency limiter"))?;
        self.candidates.remove(pos);
        self.pending_destroy.remove(&id);
        self.forced.remove(&id);
        Ok(())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.candidates.contains(&id)
    }

    /// Excludes a candidate from buckets until it is removed.
    pub fn mark_pending_destroy(&mut self, id: EntityId) {
        if self.candidates.contains(&id) {
            self.pending_destroy.insert(id);
        }
    }

    /// Sends the candidate next tick regardless of its bucket.
    pub fn force_net_update(&mut self, id: EntityId) {
        if self.candidates.contains(&id) {
            self.forced.insert(id);
        }
    }

    /// Drops forced flags consumed by this tick's gather.
    pub fn clear_forced(&mut self) {
        self.forced.clear();
    }

    pub fn target_per_tick(&self) -> usize {
        self.target_per_tick
    }

    pub fn buckets(&self) -> &[Vec<EntityId>] {
        &self.buckets
    }

    pub fn force_list(&self) -> &[EntityId] {
        &self.force_list
    }

    /// Rebuilds the buckets from the valid candidates.
    pub fn rebuild(&mut self) {
        self.buckets.clear();
        self.buckets.push(Vec::new());
        self.force_list.clear();

        for id in &self.candidates {
            if self.pending_destroy.contains(id) {
                continue;
            }
            if self.forced.contains(id) {
                self.force_list.push(*id);
                continue;
            }

            let needs_new_bucket = self
                .buckets
                .last()
                .is_some_and(|b| b.len() >= self.target_per_tick);
            if needs_new_bucket {
                self.buckets.push(Vec::with_capacity(self.target_per_tick));
            }
            if let Some(bucket) = self.buckets.last_mut() {
                bucket.push(*id);
            }
        }
    }

    /// Active bucket for a tick, followed by the force list.
    pub fn gather_tick(&self, tick: u64, out: &mut Vec<EntityId>) {
        let index = (tick % self.buckets.len() as u64) as usize;
        out.extend_from_slice(&self.buckets[index]);
        out.extend_from_slice(&self.force_list);
    }
}

impl GlobalGraphNode for FrequencyLimiterNode {
    fn name(&self) -> &'static str {
        "FrequencyLimiter"
    }

    fn requires_prepare(&self) -> bool {
        true
    }

    fn prepare_for_replication(&mut self, _tick: u64) {
        self.rebuild();
    }

    fn gather(&self, params: &GatherParams<'_>, out: &mut Vec<EntityId>) {
        self.gather_tick(params.tick, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter_with(count: u64, target: usize) -> FrequencyLimiterNode {
        let mut limiter = FrequencyLimiterNode::new(target);
        for i in 0..count {
            limiter.add_candidate(EntityId(i));
        }
        limiter
    }

    #[test]
    fn test_bucket_sizes() {
        let mut limiter = limiter_with(10, 3);
        limiter.rebuild();
        let sizes: Vec<usize> = limiter.buckets().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_empty_set_has_one_empty_bucket() {
        let mut limiter = FrequencyLimiterNode::new(2);
        limiter.rebuild();
        assert_eq!(limiter.buckets().len(), 1);

        let mut out = Vec::new();
        limiter.gather_tick(7, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_each_candidate_once_per_rotation() {
        let mut limiter = limiter_with(10, 3);
        let mut seen = Vec::new();
        for tick in 0..4 {
            limiter.rebuild();
            let mut out = Vec::new();
            limiter.gather_tick(tick, &mut out);
            seen.extend(out);
        }
        seen.sort();
        assert_eq!(seen, (0..10).map(EntityId).collect::<Vec<_>>());
    }

    #[test]
    fn test_force_list_bypasses_rotation() {
        let mut limiter = limiter_with(10, 3);
        limiter.force_net_update(EntityId(9));
        limiter.rebuild();

        let mut out = Vec::new();
        limiter.gather_tick(0, &mut out);
        assert_eq!(out, vec![EntityId(0), EntityId(1), EntityId(2), EntityId(9)]);

        limiter.clear_forced();
        limiter.rebuild();
        assert!(limiter.force_list().is_empty());
    }

    #[test]
    fn test_pending_destroy_excluded() {
        let mut limiter = limiter_with(3, 3);
        limiter.mark_pending_destroy(EntityId(1));
        limiter.rebuild();
        assert_eq!(limiter.buckets()[0], vec![EntityId(0), EntityId(2)]);

        assert!(limiter.remove_candidate(EntityId(1)).is_ok());
        assert!(limiter.remove_candidate(EntityId(1)).is_err());
    }

    proptest! {
        #[test]
        fn prop_rotation_covers_every_candidate_once(count in 0u64..60, target in 1usize..8) {
            let mut limiter = limiter_with(count, target);
            limiter.rebuild();
            let rotation = limiter.buckets().len() as u64;

            let mut seen = Vec::new();
            for tick in 0..rotation {
                let mut out = Vec::new();
                limiter.gather_tick(tick, &mut out);
                prop_assert!(out.len() <= target);
                let unique: HashSet<_> = out.iter().collect();
                prop_assert_eq!(unique.len(), out.len());
                seen.extend(out);
            }
            seen.sort();
            prop_assert_eq!(seen, (0..count).map(EntityId).collect::<Vec<_>>());
        }
    }
}
