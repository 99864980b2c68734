//! Batch Selection (§4.C): approval gating, completion detection, and the
//! condition-emitting lifecycle hooks for whichever batch a pointer currently names.

use std::sync::Arc;
use std::time::Duration;

use fleet_rollout_errors::{ReconcileError, ReconcileResult};

use crate::batch_sequence::{BatchRef, batch_name};
use crate::condition::ConditionEmitter;
use crate::model::{ApprovalMethod, CompletionReport, Device, Fleet, fleet_annotations};
use crate::selector::DeviceQuery;
use crate::store::{DeviceStore, FleetStore};

/// The fleet-level default success threshold used when neither the batch nor the
/// fleet's rollout policy names one (§4.C).
pub const DEFAULT_SUCCESS_THRESHOLD: u8 = 90;

/// Why a batch is not currently auto-approvable, distinguishing the two
/// `onSuspended` messages in §4.D.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalBlockReason {
    /// The approval method is manual; the batch needs an explicit operator action.
    WaitingForManualApproval,
    /// The approval method is automatic but the previous batch's success
    /// percentage did not meet the effective threshold.
    ThresholdNotMet(CompletionReport),
}

/// A view over whichever batch the current pointer names, bound to one fleet
/// snapshot (§4.C). Constructed by [`crate::batch_sequence::BatchSequenceSelector::current_selection`].
pub struct BatchSelection<'a> {
    org_id: &'a str,
    fleet_name: &'a str,
    template_version: &'a str,
    pointer: i64,
    sequence_len: usize,
    batch_ref: BatchRef<'a>,
    update_timeout: Duration,
    fleet_success_threshold: Option<u8>,
    fleet_snapshot: &'a Fleet,
    fleet_store: Arc<dyn FleetStore>,
    device_store: Arc<dyn DeviceStore>,
}

impl<'a> BatchSelection<'a> {
    /// Build a selection view. Callers should use
    /// [`crate::batch_sequence::BatchSequenceSelector::current_selection`] instead of
    /// calling this directly.
    #[allow(clippy::too_many_arguments, reason = "internal constructor, not part of the public surface callers compose")]
    pub fn new(
        org_id: &'a str,
        fleet_name: &'a str,
        template_version: &'a str,
        pointer: i64,
        sequence_len: usize,
        batch_ref: BatchRef<'a>,
        update_timeout: Duration,
        fleet_success_threshold: Option<u8>,
        fleet_snapshot: &'a Fleet,
        fleet_store: Arc<dyn FleetStore>,
        device_store: Arc<dyn DeviceStore>,
    ) -> Self {
        Self {
            org_id,
            fleet_name,
            template_version,
            pointer,
            sequence_len,
            batch_ref,
            update_timeout,
            fleet_success_threshold,
            fleet_snapshot,
            fleet_store,
            device_store,
        }
    }

    /// The display name of the batch this selection names (§4.B naming rules).
    pub fn batch_name(&self) -> String {
        batch_name(self.pointer, self.sequence_len)
    }

    /// The effective success threshold: batch-specific, else fleet-level, else the
    /// engine default of 90%.
    pub fn effective_threshold(&self) -> u8 {
        let batch_specific = match self.batch_ref {
            BatchRef::Explicit(batch) => batch.success_threshold,
            BatchRef::Preliminary | BatchRef::FinalImplicit => None,
        };
        batch_specific
            .or(self.fleet_success_threshold)
            .unwrap_or(DEFAULT_SUCCESS_THRESHOLD)
    }

    fn approval_method(&self) -> Option<ApprovalMethod> {
        self.fleet_snapshot
            .annotations
            .get(fleet_annotations::ROLLOUT_APPROVAL_METHOD)
            .map_or(Some(ApprovalMethod::Automatic), |v| ApprovalMethod::parse(v))
    }

    fn previous_report(&self) -> ReconcileResult<Option<CompletionReport>> {
        match self
            .fleet_snapshot
            .annotations
            .get(fleet_annotations::LAST_BATCH_COMPLETION_REPORT)
        {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| ReconcileError::DataShape(format!("malformed completion report annotation: {e}"))),
        }
    }

    /// `isApproved()`: true iff the `rolloutApproved` annotation is `"true"`.
    pub fn is_approved(&self) -> bool {
        self.fleet_snapshot
            .annotations
            .get(fleet_annotations::ROLLOUT_APPROVED)
            .is_some_and(|v| v == "true")
    }

    /// `isRolledOut()`: true iff no device currently selected for rollout is still
    /// short of the target template version.
    pub async fn is_rolled_out(&self) -> ReconcileResult<bool> {
        let query = DeviceQuery::new()
            .with_owner(self.fleet_name)
            .with_selected_for_rollout()
            .without_rolled_out(self.template_version);
        let outstanding = self
            .device_store
            .count_devices(self.org_id, &query.list_params(), &query.annotation_selector())
            .await?;
        Ok(outstanding == 0)
    }

    /// `mayApproveAutomatically()` (§4.C). The preliminary batch (`pointer == -1`)
    /// is unconditionally auto-approvable; every other batch is gated on the
    /// approval method and, if a previous batch ran, its success percentage.
    pub fn may_approve_automatically(&self) -> ReconcileResult<bool> {
        if self.pointer == -1 {
            return Ok(true);
        }

        if self.approval_method() != Some(ApprovalMethod::Automatic) {
            return Ok(false);
        }

        match self.previous_report()? {
            None => Ok(true),
            Some(report) => Ok(report.success_percentage >= self.effective_threshold()),
        }
    }

    /// Why [`Self::may_approve_automatically`] returned `false`, for the reconciler
    /// to pick the right `onSuspended` message. Only meaningful to call when it did.
    pub fn approval_block_reason(&self) -> ReconcileResult<ApprovalBlockReason> {
        if self.approval_method() != Some(ApprovalMethod::Automatic) {
            return Ok(ApprovalBlockReason::WaitingForManualApproval);
        }
        match self.previous_report()? {
            Some(report) => Ok(ApprovalBlockReason::ThresholdNotMet(report)),
            None => Ok(ApprovalBlockReason::WaitingForManualApproval),
        }
    }

    /// `approve()`: set the `rolloutApproved` annotation.
    pub async fn approve(&self) -> ReconcileResult<()> {
        self.fleet_store
            .update_fleet_annotations(
                self.org_id,
                self.fleet_name,
                std::collections::BTreeMap::from([(
                    fleet_annotations::ROLLOUT_APPROVED.to_string(),
                    "true".to_string(),
                )]),
                Vec::new(),
            )
            .await?;
        Ok(())
    }

    /// `isComplete()` (invariant 7): every selected device reached a terminal state.
    pub async fn is_complete(&self) -> ReconcileResult<bool> {
        let counts = self
            .device_store
            .get_device_completion_counts(self.org_id, self.fleet_name, self.template_version, self.update_timeout)
            .await?;
        Ok(counts.is_complete())
    }

    /// `setCompletionReport()`: aggregate completion counts and persist them as the
    /// `lastBatchCompletionReport` annotation.
    pub async fn set_completion_report(&self) -> ReconcileResult<CompletionReport> {
        let counts = self
            .device_store
            .get_device_completion_counts(self.org_id, self.fleet_name, self.template_version, self.update_timeout)
            .await?;
        let report = CompletionReport::from_counts(
            self.batch_name(),
            counts.total,
            counts.successful,
            counts.failed,
            counts.timed_out,
        );
        let encoded = serde_json::to_string(&report)
            .map_err(|e| ReconcileError::DataShape(format!("failed to serialize completion report: {e}")))?;
        self.fleet_store
            .update_fleet_annotations(
                self.org_id,
                self.fleet_name,
                std::collections::BTreeMap::from([(
                    fleet_annotations::LAST_BATCH_COMPLETION_REPORT.to_string(),
                    encoded,
                )]),
                Vec::new(),
            )
            .await?;
        Ok(report)
    }

    /// `devices()`: the devices currently selected for rollout under this fleet.
    pub async fn devices(&self) -> ReconcileResult<Vec<Device>> {
        let query = DeviceQuery::new().with_owner(self.fleet_name).with_selected_for_rollout();
        Ok(self
            .device_store
            .list_devices(self.org_id, &query.list_params(), &query.annotation_selector())
            .await?)
    }

    /// `onRollout()`: write the "actively rolling out" condition.
    pub async fn on_rollout(&self) -> ReconcileResult<()> {
        let condition = ConditionEmitter.on_rollout(&self.batch_name());
        self.write_condition(condition).await
    }

    /// `onSuspended()` when the previous batch's success percentage did not meet
    /// its threshold.
    pub async fn on_suspended_threshold_not_met(&self, report: &CompletionReport) -> ReconcileResult<()> {
        let condition = ConditionEmitter.on_suspended_threshold_not_met(
            &self.batch_name(),
            report.success_percentage,
            self.effective_threshold(),
            report.total,
            report.successful,
            report.failed,
            report.timed_out,
        );
        self.write_condition(condition).await
    }

    /// `onSuspended()` when the batch is gated on manual approval.
    pub async fn on_waiting_for_approval(&self) -> ReconcileResult<()> {
        let condition = ConditionEmitter.on_waiting_for_approval(&self.batch_name());
        self.write_condition(condition).await
    }

    /// `onFinish()`: the rollout has no more batches to advance through.
    pub async fn on_finish(&self) -> ReconcileResult<()> {
        let condition = ConditionEmitter.on_finish();
        self.write_condition(condition).await
    }

    async fn write_condition(&self, condition: crate::model::Condition) -> ReconcileResult<()> {
        self.fleet_store
            .update_fleet_conditions(self.org_id, self.fleet_name, vec![condition])
            .await?;
        Ok(())
    }
}
