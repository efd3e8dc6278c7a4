#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use cycle_kernel_domain::{now_utc, CycleError, Heuristic, HeuristicId, HeuristicStatus};

const APPLY_REINFORCEMENT: f32 = 0.05;
const DECAY_PER_BLOCK: f32 = 0.01;
const DECAY_BLOCK_CYCLES: u32 = 10;
const SYNTHESIS_START_CONFIDENCE: f32 = 0.7;

/// Registry of confidence-scored heuristics. Single-writer: one orchestrator
/// mutates; readers take immutable snapshots published on every write.
#[derive(Debug, Default)]
pub struct HeuristicStore {
    view: RwLock<Arc<BTreeMap<HeuristicId, Heuristic>>>,
}

impl HeuristicStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrates a store from previously persisted heuristics.
    #[must_use]
    pub fn from_heuristics(heuristics: Vec<Heuristic>) -> Self {
        let map: BTreeMap<HeuristicId, Heuristic> = heuristics
            .into_iter()
            .map(|heuristic| (heuristic.heuristic_id, heuristic))
            .collect();
        Self {
            view: RwLock::new(Arc::new(map)),
        }
    }

    fn read_view(&self) -> Result<Arc<BTreeMap<HeuristicId, Heuristic>>, CycleError> {
        self.view
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| CycleError::Io("heuristic view lock poisoned".to_string()))
    }

    fn publish<F>(&self, mutate: F) -> Result<(), CycleError>
    where
        F: FnOnce(&mut BTreeMap<HeuristicId, Heuristic>),
    {
        let mut guard = self
            .view
            .write()
            .map_err(|_| CycleError::Io("heuristic view lock poisoned".to_string()))?;
        let mut next = guard.as_ref().clone();
        mutate(&mut next);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Registers a fresh heuristic at the given starting confidence.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] for an empty principle or a
    /// confidence outside `[0.0, 1.0]`.
    pub fn register(&self, principle: &str, confidence: f32) -> Result<Heuristic, CycleError> {
        if principle.trim().is_empty() {
            return Err(CycleError::Validation(
                "heuristic principle MUST be non-empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(CycleError::Validation(
                "heuristic confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        let heuristic = Heuristic {
            heuristic_id: HeuristicId::new(),
            principle: principle.trim().to_string(),
            antecedents: Vec::new(),
            confidence,
            origin: now_utc(),
            status: HeuristicStatus::Active,
            application_count: 0,
            cycles_unused: 0,
        };
        let inserted = heuristic.clone();
        self.publish(move |map| {
            map.insert(heuristic.heuristic_id, heuristic);
        })?;
        Ok(inserted)
    }

    /// Reinforces a heuristic that informed the current cycle. No-op (Ok(false))
    /// when the heuristic is SYNTHESIZED or DEPRECATED.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] for an unknown id.
    pub fn apply(&self, id: HeuristicId) -> Result<bool, CycleError> {
        let view = self.read_view()?;
        let Some(current) = view.get(&id) else {
            return Err(CycleError::Validation(format!("unknown heuristic {id}")));
        };
        if current.status != HeuristicStatus::Active {
            return Ok(false);
        }

        self.publish(move |map| {
            if let Some(heuristic) = map.get_mut(&id) {
                heuristic.confidence = (heuristic.confidence + APPLY_REINFORCEMENT).min(1.0);
                heuristic.cycles_unused = 0;
                heuristic.application_count += 1;
            }
        })?;
        Ok(true)
    }

    /// Ages a heuristic by `cycles` unused cycles. Confidence drops by 0.01
    /// for every block of ten unused cycles completed by this call, floored
    /// at 0.0. No-op (Ok(false)) when the heuristic is not ACTIVE.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] for an unknown id.
    pub fn decay(&self, id: HeuristicId, cycles: u32) -> Result<bool, CycleError> {
        let view = self.read_view()?;
        let Some(current) = view.get(&id) else {
            return Err(CycleError::Validation(format!("unknown heuristic {id}")));
        };
        if current.status != HeuristicStatus::Active {
            return Ok(false);
        }

        self.publish(move |map| {
            if let Some(heuristic) = map.get_mut(&id) {
                let blocks_before = heuristic.cycles_unused / DECAY_BLOCK_CYCLES;
                heuristic.cycles_unused = heuristic.cycles_unused.saturating_add(cycles);
                let blocks_after = heuristic.cycles_unused / DECAY_BLOCK_CYCLES;
                let completed = blocks_after.saturating_sub(blocks_before);
                if completed > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let drop = DECAY_PER_BLOCK * completed as f32;
                    heuristic.confidence = (heuristic.confidence - drop).max(0.0);
                }
            }
        })?;
        Ok(true)
    }

    /// Ages every ACTIVE heuristic that was not applied this cycle by one
    /// unused cycle.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn end_cycle(&self, applied: &BTreeSet<HeuristicId>) -> Result<(), CycleError> {
        let unapplied: Vec<HeuristicId> = self
            .read_view()?
            .values()
            .filter(|heuristic| heuristic.status == HeuristicStatus::Active)
            .filter(|heuristic| !applied.contains(&heuristic.heuristic_id))
            .map(|heuristic| heuristic.heuristic_id)
            .collect();
        for id in unapplied {
            let _ = self.decay(id, 1)?;
        }
        Ok(())
    }

    /// The `n` highest-confidence ACTIVE heuristics. Ordering is total and
    /// reproducible: confidence descending, then earliest origin, then id.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn query_top(&self, n: usize) -> Result<Vec<Heuristic>, CycleError> {
        let mut active: Vec<Heuristic> = self
            .read_view()?
            .values()
            .filter(|heuristic| heuristic.status == HeuristicStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|lhs, rhs| {
            rhs.confidence
                .total_cmp(&lhs.confidence)
                .then_with(|| lhs.origin.cmp(&rhs.origin))
                .then_with(|| lhs.heuristic_id.cmp(&rhs.heuristic_id))
        });
        active.truncate(n);
        Ok(active)
    }

    /// Folds several heuristics into one new principle. Parents transition to
    /// SYNTHESIZED but stay in the registry with their full history; the
    /// child records them as antecedents and starts at confidence 0.7.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] when the principle is empty, the
    /// parent list is empty, or any parent id is unknown.
    pub fn synthesize(
        &self,
        parent_ids: &[HeuristicId],
        new_principle: &str,
    ) -> Result<Heuristic, CycleError> {
        if new_principle.trim().is_empty() {
            return Err(CycleError::Validation(
                "synthesized principle MUST be non-empty".to_string(),
            ));
        }
        if parent_ids.is_empty() {
            return Err(CycleError::Validation(
                "synthesis requires at least one parent".to_string(),
            ));
        }
        let view = self.read_view()?;
        for parent in parent_ids {
            if !view.contains_key(parent) {
                return Err(CycleError::Validation(format!(
                    "unknown synthesis parent {parent}"
                )));
            }
        }

        let child = Heuristic {
            heuristic_id: HeuristicId::new(),
            principle: new_principle.trim().to_string(),
            antecedents: parent_ids.to_vec(),
            confidence: SYNTHESIS_START_CONFIDENCE,
            origin: now_utc(),
            status: HeuristicStatus::Active,
            application_count: 0,
            cycles_unused: 0,
        };
        let inserted = child.clone();
        let parents: Vec<HeuristicId> = parent_ids.to_vec();
        self.publish(move |map| {
            for parent in &parents {
                if let Some(heuristic) = map.get_mut(parent) {
                    heuristic.status = HeuristicStatus::Synthesized;
                }
            }
            map.insert(child.heuristic_id, child);
        })?;
        Ok(inserted)
    }

    /// Retires a heuristic from future synthesis without deleting it.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] for an unknown id.
    pub fn deprecate(&self, id: HeuristicId) -> Result<(), CycleError> {
        if !self.read_view()?.contains_key(&id) {
            return Err(CycleError::Validation(format!("unknown heuristic {id}")));
        }
        self.publish(move |map| {
            if let Some(heuristic) = map.get_mut(&id) {
                heuristic.status = HeuristicStatus::Deprecated;
            }
        })
    }

    /// Immutable view of every heuristic, in id order.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<Heuristic>, CycleError> {
        Ok(self.read_view()?.values().cloned().collect())
    }

    /// Fetches one heuristic by id.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn get(&self, id: HeuristicId) -> Result<Option<Heuristic>, CycleError> {
        Ok(self.read_view()?.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    #[test]
    fn apply_reinforces_and_resets_unused_counter() {
        let store = HeuristicStore::new();
        let heuristic = must(store.register("prefer smaller diffs", 0.5));
        let id = heuristic.heuristic_id;

        must(store.decay(id, 4));
        assert!(must(store.apply(id)));

        let current = must_some(must(store.get(id)));
        assert!((current.confidence - 0.55).abs() < 1e-6);
        assert_eq!(current.cycles_unused, 0);
        assert_eq!(current.application_count, 1);
    }

    #[test]
    fn apply_caps_confidence_at_one() {
        let store = HeuristicStore::new();
        let heuristic = must(store.register("always verify the chain", 0.98));
        assert!(must(store.apply(heuristic.heuristic_id)));
        let current = must_some(must(store.get(heuristic.heuristic_id)));
        assert!((current.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn decay_zero_cycles_leaves_confidence_unchanged() {
        let store = HeuristicStore::new();
        let heuristic = must(store.register("batch ledger writes", 0.5));
        assert!(must(store.apply(heuristic.heuristic_id)));
        let before = must_some(must(store.get(heuristic.heuristic_id))).confidence;

        must(store.decay(heuristic.heuristic_id, 0));
        let after = must_some(must(store.get(heuristic.heuristic_id))).confidence;
        assert!((before - after).abs() < 1e-6);
    }

    #[test]
    fn thirty_unused_cycles_cost_three_hundredths() {
        let store = HeuristicStore::new();
        let heuristic = must(store.register("trust earliest detections", 0.5));

        must(store.decay(heuristic.heuristic_id, 30));
        let current = must_some(must(store.get(heuristic.heuristic_id)));
        assert!((current.confidence - 0.47).abs() < 1e-6);
        assert_eq!(current.cycles_unused, 30);
    }

    #[test]
    fn partial_blocks_do_not_decay_until_completed() {
        let store = HeuristicStore::new();
        let heuristic = must(store.register("keep probes short", 0.5));
        let id = heuristic.heuristic_id;

        must(store.decay(id, 9));
        assert!((must_some(must(store.get(id))).confidence - 0.5).abs() < 1e-6);

        must(store.decay(id, 1));
        assert!((must_some(must(store.get(id))).confidence - 0.49).abs() < 1e-6);
    }

    #[test]
    fn decay_floors_at_zero() {
        let store = HeuristicStore::new();
        let heuristic = must(store.register("stale rule", 0.02));
        must(store.decay(heuristic.heuristic_id, 100));
        let current = must_some(must(store.get(heuristic.heuristic_id)));
        assert!(current.confidence >= 0.0);
        assert!(current.confidence < 1e-6);
    }

    #[test]
    fn apply_and_decay_are_noops_for_non_active_status() {
        let store = HeuristicStore::new();
        let parent = must(store.register("original rule", 0.6));
        let _child = must(store.synthesize(&[parent.heuristic_id], "merged rule"));

        assert!(!must(store.apply(parent.heuristic_id)));
        assert!(!must(store.decay(parent.heuristic_id, 30)));

        let frozen = must_some(must(store.get(parent.heuristic_id)));
        assert_eq!(frozen.status, HeuristicStatus::Synthesized);
        assert!((frozen.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn synthesize_keeps_parents_and_links_antecedents() {
        let store = HeuristicStore::new();
        let first = must(store.register("rule a", 0.4));
        let second = must(store.register("rule b", 0.9));

        let child = must(store.synthesize(&[first.heuristic_id, second.heuristic_id], "rule ab"));

        assert!((child.confidence - 0.7).abs() < 1e-6);
        assert_eq!(
            child.antecedents,
            vec![first.heuristic_id, second.heuristic_id]
        );
        // Provenance retained: both parents still present, just re-statused.
        assert_eq!(must(store.snapshot()).len(), 3);
    }

    #[test]
    fn synthesize_rejects_unknown_parent() {
        let store = HeuristicStore::new();
        let result = store.synthesize(&[HeuristicId::new()], "orphan");
        assert!(matches!(result, Err(CycleError::Validation(_))));
    }

    #[test]
    fn query_top_orders_by_confidence_then_origin() {
        let store = HeuristicStore::new();
        let low = must(store.register("low", 0.3));
        let older_high = must(store.register("older high", 0.8));
        let newer_high = must(store.register("newer high", 0.8));
        let _synth_parent = must(store.synthesize(&[low.heuristic_id], "replacement"));

        let top = must(store.query_top(2));
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].heuristic_id, older_high.heuristic_id);
        assert_eq!(top[1].heuristic_id, newer_high.heuristic_id);
    }

    #[test]
    fn end_cycle_ages_only_unapplied_active_heuristics() {
        let store = HeuristicStore::new();
        let used = must(store.register("used", 0.5));
        let idle = must(store.register("idle", 0.5));

        let mut applied = BTreeSet::new();
        applied.insert(used.heuristic_id);
        must(store.end_cycle(&applied));

        assert_eq!(must_some(must(store.get(used.heuristic_id))).cycles_unused, 0);
        assert_eq!(must_some(must(store.get(idle.heuristic_id))).cycles_unused, 1);
    }

    #[test]
    fn deprecated_heuristics_leave_query_results() {
        let store = HeuristicStore::new();
        let heuristic = must(store.register("short-lived", 0.9));
        must(store.deprecate(heuristic.heuristic_id));
        assert!(must(store.query_top(5)).is_empty());
        assert_eq!(must(store.snapshot()).len(), 1);
    }
}
