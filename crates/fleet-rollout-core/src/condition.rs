//! Condition Emitter (§4.D): writes the single `FleetRolloutInProgress` status
//! condition a fleet carries, reflecting the rollout's active/suspended/waiting/
//! inactive state.

use crate::model::{Condition, ROLLOUT_IN_PROGRESS_CONDITION_TYPE};

/// Builds the four condition transitions a batch's lifecycle hooks can produce.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEmitter;

impl ConditionEmitter {
    /// `onRollout`: a batch is actively being dispatched.
    pub fn on_rollout(&self, batch_name: &str) -> Condition {
        Condition {
            condition_type: ROLLOUT_IN_PROGRESS_CONDITION_TYPE.to_string(),
            status: true,
            reason: "RolloutActive".to_string(),
            message: format!("Rolling out {batch_name}"),
        }
    }

    /// `onSuspended` when auto-approval was attempted but the previous batch's
    /// success percentage did not meet its threshold.
    pub fn on_suspended_threshold_not_met(
        &self,
        batch_name: &str,
        success_percentage: u8,
        threshold: u8,
        total: u64,
        successful: u64,
        failed: u64,
        timed_out: u64,
    ) -> Condition {
        Condition {
            condition_type: ROLLOUT_IN_PROGRESS_CONDITION_TYPE.to_string(),
            status: false,
            reason: "RolloutSuspended".to_string(),
            message: format!(
                "{batch_name} failed: {success_percentage}% … threshold {threshold}%; Breakdown: total={total} successful={successful} failed={failed} timed out={timed_out}"
            ),
        }
    }

    /// `onSuspended` when the batch is gated on manual approval.
    pub fn on_waiting_for_approval(&self, batch_name: &str) -> Condition {
        Condition {
            condition_type: ROLLOUT_IN_PROGRESS_CONDITION_TYPE.to_string(),
            status: false,
            reason: "RolloutWaiting".to_string(),
            message: format!("Waiting for {batch_name} to be approved"),
        }
    }

    /// `onFinish`: the rollout has no more batches to advance through.
    pub fn on_finish(&self) -> Condition {
        Condition {
            condition_type: ROLLOUT_IN_PROGRESS_CONDITION_TYPE.to_string(),
            status: false,
            reason: "RolloutInactive".to_string(),
            message: "Rollout is not in progress".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_message_contains_percentages() {
        let emitter = ConditionEmitter;
        let condition = emitter.on_suspended_threshold_not_met("batch 2", 89, 90, 15, 13, 1, 1);
        assert!(condition.message.contains("89%"));
        assert!(condition.message.contains("90%"));
        assert_eq!(condition.reason, "RolloutSuspended");
        assert!(!condition.status);
    }

    #[test]
    fn waiting_message_names_the_batch() {
        let condition = ConditionEmitter.on_waiting_for_approval("batch 1");
        assert_eq!(condition.reason, "RolloutWaiting");
        assert!(condition.message.contains("batch 1"));
    }

    #[test]
    fn finish_is_inactive() {
        let condition = ConditionEmitter.on_finish();
        assert_eq!(condition.reason, "RolloutInactive");
        assert!(!condition.status);
    }

    #[test]
    fn rollout_is_active() {
        let condition = ConditionEmitter.on_rollout("final implicit batch");
        assert!(condition.status);
        assert_eq!(condition.reason, "RolloutActive");
    }
}
