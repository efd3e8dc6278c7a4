#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use cycle_kernel_domain::{
    has_substance, now_utc, CatalystId, CycleError, Liberation, SubstanceProfile, Vow, VowId,
    VowStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a liberation request. Denial is a normal negative outcome with
/// reason codes, never an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LiberationOutcome {
    Granted {
        liberated: VowId,
        replacement: Option<VowId>,
    },
    Denied {
        reason_codes: Vec<String>,
    },
}

impl LiberationOutcome {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

#[derive(Debug, Clone, Default)]
struct RegistryView {
    vows: BTreeMap<VowId, Vow>,
    active_vow: Option<VowId>,
    total_cycles: u64,
    liberations: u64,
}

/// Vow registry with the audited liberation workflow. Owns the only mutable
/// reference to vow state; the current-vow pointer moves on declare and
/// inside `request_liberation`, nowhere else.
#[derive(Debug, Default)]
pub struct VowRegistry {
    view: RwLock<Arc<RegistryView>>,
}

impl VowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrates a registry from persisted state.
    #[must_use]
    pub fn from_state(
        vows: Vec<Vow>,
        active_vow: Option<VowId>,
        total_cycles: u64,
        liberations: u64,
    ) -> Self {
        let map: BTreeMap<VowId, Vow> = vows.into_iter().map(|vow| (vow.vow_id, vow)).collect();
        Self {
            view: RwLock::new(Arc::new(RegistryView {
                vows: map,
                active_vow,
                total_cycles,
                liberations,
            })),
        }
    }

    fn read_view(&self) -> Result<Arc<RegistryView>, CycleError> {
        self.view
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| CycleError::Io("vow view lock poisoned".to_string()))
    }

    fn publish<F>(&self, mutate: F) -> Result<(), CycleError>
    where
        F: FnOnce(&mut RegistryView),
    {
        let mut guard = self
            .view
            .write()
            .map_err(|_| CycleError::Io("vow view lock poisoned".to_string()))?;
        let mut next = guard.as_ref().clone();
        mutate(&mut next);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Declares a vow and makes it the current active constraint.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] for an empty vow text.
    pub fn declare(&self, text: &str, min_cycles: u32) -> Result<Vow, CycleError> {
        if text.trim().is_empty() {
            return Err(CycleError::Validation(
                "vow text MUST be non-empty".to_string(),
            ));
        }

        let vow = Vow {
            vow_id: VowId::new(),
            declared_at: now_utc(),
            text: text.trim().to_string(),
            min_cycles,
            status: VowStatus::Active,
            adherence_log: Vec::new(),
            liberation: None,
            replaced_by: None,
        };
        let declared = vow.clone();
        self.publish(move |view| {
            view.active_vow = Some(vow.vow_id);
            view.vows.insert(vow.vow_id, vow);
        })?;
        Ok(declared)
    }

    /// Records that the current cycle honored the active vow, and advances
    /// the global cycle counter used by the liberation rate.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] when no vow is active.
    pub fn record_adherence(&self, catalyst_id: CatalystId) -> Result<(), CycleError> {
        let view = self.read_view()?;
        let Some(active) = view.active_vow else {
            return Err(CycleError::Validation(
                "no active vow to record adherence against".to_string(),
            ));
        };
        self.publish(move |view| {
            if let Some(vow) = view.vows.get_mut(&active) {
                vow.adherence_log.push(catalyst_id);
            }
            view.total_cycles += 1;
        })
    }

    /// Requests liberation of a vow. Both gates must pass: the adherence log
    /// must cover `min_cycles`, and the justification must clear the strict
    /// substance profile. A denial carries reason codes and mutates nothing.
    ///
    /// # Errors
    /// Returns [`CycleError::Validation`] only for an unknown vow id; gate
    /// failures are [`LiberationOutcome::Denied`], not errors.
    pub fn request_liberation(
        &self,
        vow_id: VowId,
        diagnostics: Value,
        justification: &str,
        replacement_text: Option<&str>,
    ) -> Result<LiberationOutcome, CycleError> {
        let view = self.read_view()?;
        let Some(vow) = view.vows.get(&vow_id) else {
            return Err(CycleError::Validation(format!("unknown vow {vow_id}")));
        };

        let mut reason_codes = Vec::new();
        if vow.status == VowStatus::Liberated {
            reason_codes.push("denied.already_liberated".to_string());
        }
        if vow.adherence_log.len() < vow.min_cycles as usize {
            reason_codes.push("denied.adherence_below_min_cycles".to_string());
        }
        if !has_substance(justification, SubstanceProfile::LIBERATION) {
            reason_codes.push("denied.justification_substance".to_string());
        }
        if !reason_codes.is_empty() {
            return Ok(LiberationOutcome::Denied { reason_codes });
        }

        let replacement = match replacement_text {
            Some(text) if text.trim().is_empty() => {
                return Err(CycleError::Validation(
                    "replacement vow text MUST be non-empty when given".to_string(),
                ));
            }
            Some(text) => Some(Vow {
                vow_id: VowId::new(),
                declared_at: now_utc(),
                text: text.trim().to_string(),
                min_cycles: vow.min_cycles,
                status: VowStatus::Active,
                adherence_log: Vec::new(),
                liberation: None,
                replaced_by: None,
            }),
            None => None,
        };
        let replacement_id = replacement.as_ref().map(|vow| vow.vow_id);
        let justification = justification.trim().to_string();

        self.publish(move |view| {
            if let Some(target) = view.vows.get_mut(&vow_id) {
                target.status = VowStatus::Liberated;
                target.liberation = Some(Liberation {
                    triggered_at: now_utc(),
                    diagnostics,
                    justification,
                });
                target.replaced_by = replacement_id;
            }
            if let Some(vow) = replacement {
                view.vows.insert(vow.vow_id, vow);
            }
            view.active_vow = replacement_id;
            view.liberations += 1;
        })?;

        Ok(LiberationOutcome::Granted {
            liberated: vow_id,
            replacement: replacement_id,
        })
    }

    /// Liberations per recorded adherence cycle; 0 before the first cycle.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    #[allow(clippy::cast_precision_loss)]
    pub fn liberation_rate(&self) -> Result<f32, CycleError> {
        let view = self.read_view()?;
        if view.total_cycles == 0 {
            return Ok(0.0);
        }
        Ok(view.liberations as f32 / view.total_cycles as f32)
    }

    /// The currently binding vow, if any.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn active_vow(&self) -> Result<Option<Vow>, CycleError> {
        let view = self.read_view()?;
        Ok(view
            .active_vow
            .and_then(|id| view.vows.get(&id))
            .cloned())
    }

    /// Fetches one vow by id.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn get(&self, vow_id: VowId) -> Result<Option<Vow>, CycleError> {
        Ok(self.read_view()?.vows.get(&vow_id).cloned())
    }

    /// Immutable view of every vow, in id order.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<Vow>, CycleError> {
        Ok(self.read_view()?.vows.values().cloned().collect())
    }

    /// Counters backing the liberation rate, for persistence.
    ///
    /// # Errors
    /// Returns [`CycleError::Io`] when the view lock is poisoned.
    pub fn counters(&self) -> Result<(u64, u64), CycleError> {
        let view = self.read_view()?;
        Ok((view.total_cycles, view.liberations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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

    const QUALIFIED_JUSTIFICATION: &str = "Liberation is warranted because the evidence we \
        observed over the adherence window shows the original constraint was measured against \
        assumptions that are now invalidated.";

    fn registry_with_adherence(min_cycles: u32, cycles: usize) -> (VowRegistry, VowId) {
        let registry = VowRegistry::new();
        let vow = must(registry.declare("never skip chain verification", min_cycles));
        for _ in 0..cycles {
            must(registry.record_adherence(CatalystId::new()));
        }
        (registry, vow.vow_id)
    }

    #[test]
    fn liberation_denied_below_min_cycles_regardless_of_justification() {
        let (registry, vow_id) = registry_with_adherence(3, 2);

        let outcome = must(registry.request_liberation(
            vow_id,
            json!({"drift": 0.2}),
            QUALIFIED_JUSTIFICATION,
            None,
        ));

        match outcome {
            LiberationOutcome::Denied { reason_codes } => {
                assert!(reason_codes.contains(&"denied.adherence_below_min_cycles".to_string()));
            }
            LiberationOutcome::Granted { .. } => panic!("expected denial"),
        }
        // Denial mutates nothing.
        let vow = must_some(must(registry.get(vow_id)));
        assert_eq!(vow.status, VowStatus::Active);
        assert!(vow.liberation.is_none());
    }

    #[test]
    fn liberation_denied_on_thin_justification_despite_adherence() {
        let (registry, vow_id) = registry_with_adherence(3, 3);

        let outcome = must(registry.request_liberation(
            vow_id,
            json!({}),
            "because evidence observed",
            None,
        ));

        match outcome {
            LiberationOutcome::Denied { reason_codes } => {
                assert_eq!(reason_codes, vec!["denied.justification_substance".to_string()]);
            }
            LiberationOutcome::Granted { .. } => panic!("expected denial"),
        }
    }

    #[test]
    fn liberation_grants_with_replacement_and_one_third_rate() {
        let (registry, vow_id) = registry_with_adherence(3, 3);
        assert!(QUALIFIED_JUSTIFICATION.len() >= 150);

        let outcome = must(registry.request_liberation(
            vow_id,
            json!({"observed_drift": 0.4}),
            QUALIFIED_JUSTIFICATION,
            Some("verify the chain before and after every integrate"),
        ));

        let LiberationOutcome::Granted {
            liberated,
            replacement,
        } = outcome
        else {
            panic!("expected grant");
        };
        assert_eq!(liberated, vow_id);
        let replacement_id = must_some(replacement);

        let liberated_vow = must_some(must(registry.get(vow_id)));
        assert_eq!(liberated_vow.status, VowStatus::Liberated);
        assert_eq!(liberated_vow.replaced_by, Some(replacement_id));
        assert!(liberated_vow.liberation.is_some());

        let active = must_some(must(registry.active_vow()));
        assert_eq!(active.vow_id, replacement_id);

        let rate = must(registry.liberation_rate());
        assert!((rate - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn liberation_without_replacement_clears_active_pointer() {
        let (registry, vow_id) = registry_with_adherence(1, 1);

        let outcome = must(registry.request_liberation(
            vow_id,
            json!({}),
            QUALIFIED_JUSTIFICATION,
            None,
        ));
        assert!(outcome.is_granted());
        assert!(must(registry.active_vow()).is_none());
        assert!(registry.record_adherence(CatalystId::new()).is_err());
    }

    #[test]
    fn second_liberation_of_same_vow_is_denied() {
        let (registry, vow_id) = registry_with_adherence(1, 1);
        let first = must(registry.request_liberation(
            vow_id,
            json!({}),
            QUALIFIED_JUSTIFICATION,
            None,
        ));
        assert!(first.is_granted());

        let second = must(registry.request_liberation(
            vow_id,
            json!({}),
            QUALIFIED_JUSTIFICATION,
            None,
        ));
        match second {
            LiberationOutcome::Denied { reason_codes } => {
                assert!(reason_codes.contains(&"denied.already_liberated".to_string()));
            }
            LiberationOutcome::Granted { .. } => panic!("expected denial"),
        }
    }

    #[test]
    fn rate_is_zero_before_any_cycle() {
        let registry = VowRegistry::new();
        let _vow = must(registry.declare("hold the line", 5));
        assert!((must(registry.liberation_rate()) - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unknown_vow_is_a_validation_error_not_a_denial() {
        let registry = VowRegistry::new();
        let result = registry.request_liberation(
            VowId::new(),
            json!({}),
            QUALIFIED_JUSTIFICATION,
            None,
        );
        assert!(matches!(result, Err(CycleError::Validation(_))));
    }

    #[test]
    fn adherence_log_tracks_catalysts_in_order() {
        let registry = VowRegistry::new();
        let vow = must(registry.declare("record everything", 2));
        let first = CatalystId::new();
        let second = CatalystId::new();
        must(registry.record_adherence(first));
        must(registry.record_adherence(second));

        let current = must_some(must(registry.get(vow.vow_id)));
        assert_eq!(current.adherence_log, vec![first, second]);
        assert_eq!(must(registry.counters()), (2, 0));
    }
}
