//! Batch Sequence Selector (§4.B): owns a fleet's batch pointer, advances batches,
//! marks/unmarks devices, computes batch limits, and writes the config digest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_rollout_errors::{ReconcileError, ReconcileResult};

use crate::batch_selection::BatchSelection;
use crate::digest::batch_sequence_digest;
use crate::model::{Batch, BatchLimit, BatchSequence, Fleet, fleet_annotations};
use crate::selector::DeviceQuery;
use crate::store::{DeviceStore, FleetStore};

/// Which batch a pointer value names (§4.B, §9 "implicit-final-batch").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRef<'a> {
    /// Pointer `-1`: the preliminary gate, used only for approval-gating.
    Preliminary,
    /// Pointer `0 <= p < len`: one of the sequence's explicit batches.
    Explicit(&'a Batch),
    /// Pointer `== len`: the implicit final batch, which sweeps all remaining
    /// not-yet-rolled-out devices with no selector and no limit.
    FinalImplicit,
}

/// §4.B batch-naming rule.
pub fn batch_name(pointer: i64, len: usize) -> String {
    let len_i64 = i64::try_from(len).unwrap_or(i64::MAX);
    if pointer == -1 {
        "preliminary batch".to_string()
    } else if pointer >= 0 && pointer < len_i64 {
        format!("batch {}", pointer + 1)
    } else if pointer == len_i64 {
        "final implicit batch".to_string()
    } else {
        format!("unexpected batch {}", pointer + 1)
    }
}

/// Resolve which batch a pointer names, given the sequence.
pub fn resolve_batch_ref(pointer: i64, sequence: &BatchSequence) -> ReconcileResult<BatchRef<'_>> {
    let len = i64::try_from(sequence.len()).unwrap_or(i64::MAX);
    if pointer == -1 {
        Ok(BatchRef::Preliminary)
    } else if pointer >= 0 && pointer < len {
        #[allow(
            clippy::indexing_slicing,
            reason = "pointer already range-checked above against sequence.len()"
        )]
        let index = usize::try_from(pointer).map_err(|_| {
            ReconcileError::PolicyViolation(format!("negative batch pointer: {pointer}"))
        })?;
        sequence
            .get(index)
            .map(BatchRef::Explicit)
            .ok_or_else(|| ReconcileError::PolicyViolation(format!("batch index out of range: {index}")))
    } else if pointer == len {
        Ok(BatchRef::FinalImplicit)
    } else {
        Err(ReconcileError::PolicyViolation(format!(
            "batch number overflow: pointer {pointer} exceeds sequence length {len}"
        )))
    }
}

/// Compute a batch's device limit (§4.B "Batch limit computation").
///
/// `total` and `already_rolled_out` must be counted under the batch's label
/// selector, restricted to the fleet. Returns `None` for "no limit" (either no
/// configured limit, or a 100% percentage limit).
pub fn compute_batch_limit(batch: &Batch, total: u64, already_rolled_out: u64) -> Option<u64> {
    match batch.limit {
        None => None,
        Some(BatchLimit::Absolute(n)) => Some(n),
        Some(BatchLimit::Percent(100)) => None,
        Some(BatchLimit::Percent(pct)) => {
            // round-half-away-from-zero, per §9: round(total * pct / 100.0)
            let raw = (total as f64) * (f64::from(pct)) / 100.0;
            let rounded = raw.round() as i64;
            let already = i64::try_from(already_rolled_out).unwrap_or(i64::MAX);
            Some(u64::try_from((rounded - already).max(0)).unwrap_or(0))
        }
    }
}

/// Owns `(orgId, fleetName, templateVersion, batchSequence, updateTimeout)` plus a
/// snapshot of the fleet's annotations read at construction (§4.B).
pub struct BatchSequenceSelector {
    org_id: String,
    fleet_name: String,
    template_version: String,
    sequence: BatchSequence,
    update_timeout: Duration,
    success_threshold: Option<u8>,
    fleet_snapshot: Fleet,
    fleet_store: Arc<dyn FleetStore>,
    device_store: Arc<dyn DeviceStore>,
}

impl BatchSequenceSelector {
    /// Build a selector from a freshly fetched fleet snapshot. Callers must refetch
    /// the fleet and rebuild this selector after any mutating operation to observe
    /// read-your-writes (§5).
    pub fn new(
        fleet_snapshot: Fleet,
        template_version: String,
        sequence: BatchSequence,
        update_timeout: Duration,
        success_threshold: Option<u8>,
        fleet_store: Arc<dyn FleetStore>,
        device_store: Arc<dyn DeviceStore>,
    ) -> Self {
        Self {
            org_id: fleet_snapshot.org_id.clone(),
            fleet_name: fleet_snapshot.name.clone(),
            template_version,
            sequence,
            update_timeout,
            success_threshold,
            fleet_snapshot,
            fleet_store,
            device_store,
        }
    }

    /// `isRolloutNew()`: true iff the stored "deploying template version" is absent
    /// or differs from the current template version.
    pub fn is_rollout_new(&self) -> bool {
        self.fleet_snapshot
            .annotations
            .get(fleet_annotations::DEPLOYING_TEMPLATE_VERSION)
            .is_none_or(|v| v != &self.template_version)
    }

    /// `isDefinitionUpdated()`: true iff the stored config digest is absent or
    /// differs from the digest of the current batch sequence.
    pub fn is_definition_updated(&self) -> ReconcileResult<bool> {
        let current = batch_sequence_digest(&self.sequence)?;
        Ok(self
            .fleet_snapshot
            .annotations
            .get(fleet_annotations::CONFIG_DIGEST)
            .is_none_or(|stored| stored != &current))
    }

    /// `onNewRollout()`: atomically write the deploying-template-version and
    /// config-digest annotations. No partial writes are tolerated by callers.
    pub async fn on_new_rollout(&self) -> ReconcileResult<()> {
        let digest = batch_sequence_digest(&self.sequence)?;
        let mut set = BTreeMap::new();
        set.insert(
            fleet_annotations::DEPLOYING_TEMPLATE_VERSION.to_string(),
            self.template_version.clone(),
        );
        set.insert(fleet_annotations::CONFIG_DIGEST.to_string(), digest);
        self.fleet_store
            .update_fleet_annotations(&self.org_id, &self.fleet_name, set, Vec::new())
            .await?;
        Ok(())
    }

    /// `hasMoreSelections()`: true iff the current pointer is `<= len(sequence)`.
    pub fn has_more_selections(&self) -> ReconcileResult<bool> {
        let pointer = self.fleet_snapshot.batch_pointer()?;
        let len = i64::try_from(self.sequence.len()).unwrap_or(i64::MAX);
        Ok(pointer <= len)
    }

    /// `currentSelection()`: a [`BatchSelection`] view bound to the current pointer.
    pub fn current_selection(&self) -> ReconcileResult<BatchSelection<'_>> {
        let pointer = self.fleet_snapshot.batch_pointer()?;
        let batch_ref = resolve_batch_ref(pointer, &self.sequence)?;
        Ok(BatchSelection::new(
            &self.org_id,
            &self.fleet_name,
            &self.template_version,
            pointer,
            self.sequence.len(),
            batch_ref,
            self.update_timeout,
            self.success_threshold,
            &self.fleet_snapshot,
            Arc::clone(&self.fleet_store),
            Arc::clone(&self.device_store),
        ))
    }

    /// `advance()` (§4.B). Overflow is checked before any mutation so that, per the
    /// testable property in §8 scenario 5, a pointer already at `len+1` is left
    /// completely unchanged when `advance()` is invoked again.
    pub async fn advance(&self) -> ReconcileResult<()> {
        let current = self.fleet_snapshot.batch_pointer()?;
        let new_pointer = current
            .checked_add(1)
            .ok_or_else(|| ReconcileError::PolicyViolation("batch pointer overflowed i64".to_string()))?;
        let len = i64::try_from(self.sequence.len()).unwrap_or(i64::MAX);
        if new_pointer > len + 1 {
            return Err(ReconcileError::PolicyViolation(
                "batch number overflow".to_string(),
            ));
        }

        self.device_store
            .unmark_devices_rollout_selection(&self.org_id, &self.fleet_name)
            .await?;
        self.fleet_store
            .update_fleet_annotations(
                &self.org_id,
                &self.fleet_name,
                BTreeMap::from([(fleet_annotations::BATCH_NUMBER.to_string(), new_pointer.to_string())]),
                vec![fleet_annotations::ROLLOUT_APPROVED.to_string()],
            )
            .await?;

        if new_pointer < len {
            #[allow(
                clippy::indexing_slicing,
                reason = "new_pointer already range-checked against len above"
            )]
            let index = usize::try_from(new_pointer).unwrap_or(0);
            let Some(batch) = self.sequence.get(index) else {
                return Err(ReconcileError::PolicyViolation(format!(
                    "batch index out of range: {index}"
                )));
            };
            self.mark_explicit_batch(batch).await?;
        } else if new_pointer == len {
            self.mark_final_implicit_batch().await?;
        }

        Ok(())
    }

    async fn mark_explicit_batch(&self, batch: &Batch) -> ReconcileResult<()> {
        let mut base = DeviceQuery::new().with_owner(&self.fleet_name);
        if let Some(selector) = &batch.selector {
            base = base.with_label_selector(selector);
        }

        let population_query = base.clone();
        let total = self
            .device_store
            .count_devices(
                &self.org_id,
                &population_query.list_params(),
                &population_query.annotation_selector(),
            )
            .await?;
        let rolled_out_query = base.clone().with_rolled_out(&self.template_version);
        let already_rolled_out = self
            .device_store
            .count_devices(
                &self.org_id,
                &rolled_out_query.list_params(),
                &rolled_out_query.annotation_selector(),
            )
            .await?;
        let limit = compute_batch_limit(batch, total, already_rolled_out);

        let mark_query = base
            .without_rolled_out(&self.template_version)
            .without_disconnected();
        self.device_store
            .mark_devices_rollout_selection(
                &self.org_id,
                &mark_query.list_params(),
                &mark_query.annotation_selector(),
                limit,
            )
            .await?;
        Ok(())
    }

    async fn mark_final_implicit_batch(&self) -> ReconcileResult<()> {
        let query = DeviceQuery::new()
            .with_owner(&self.fleet_name)
            .without_rolled_out(&self.template_version);
        self.device_store
            .mark_devices_rollout_selection(&self.org_id, &query.list_params(), &query.annotation_selector(), None)
            .await?;
        Ok(())
    }

    /// `reset()`: unmark all devices, clear approval and last-completion-report
    /// annotations, default the approval method to automatic unless already set,
    /// and set the pointer back to `-1` (by deleting the `batchNumber` annotation,
    /// which §6 defines as equivalent to `-1`).
    pub async fn reset(&self) -> ReconcileResult<()> {
        self.device_store
            .unmark_devices_rollout_selection(&self.org_id, &self.fleet_name)
            .await?;

        let mut set = BTreeMap::new();
        if !self
            .fleet_snapshot
            .annotations
            .contains_key(fleet_annotations::ROLLOUT_APPROVAL_METHOD)
        {
            set.insert(
                fleet_annotations::ROLLOUT_APPROVAL_METHOD.to_string(),
                "automatic".to_string(),
            );
        }

        self.fleet_store
            .update_fleet_annotations(
                &self.org_id,
                &self.fleet_name,
                set,
                vec![
                    fleet_annotations::ROLLOUT_APPROVED.to_string(),
                    fleet_annotations::LAST_BATCH_COMPLETION_REPORT.to_string(),
                    fleet_annotations::BATCH_NUMBER.to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    /// `unmarkRolloutSelection()`: removes the selected-for-rollout annotation from
    /// every device owned by the fleet.
    pub async fn unmark_rollout_selection(&self) -> ReconcileResult<()> {
        self.device_store
            .unmark_devices_rollout_selection(&self.org_id, &self.fleet_name)
            .await?;
        Ok(())
    }
}
