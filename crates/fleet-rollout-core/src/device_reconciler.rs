//! Device-Selection Reconciler (§4.E): drives a fleet's batch sequence forward one
//! step per tick, in strict approval → dispatch → completion → advancement order.
//!
//! Grounded on `service::daemon`/`openracing-firmware-update::manager`'s
//! tick-oriented control flow: a fallible async step function invoked in a bounded
//! loop, logging and moving on to the next fleet on error rather than propagating
//! out of the tick.

use std::sync::Arc;

use tracing::{debug, error, warn};

use fleet_rollout_errors::ReconcileResult;

use crate::batch_selection::ApprovalBlockReason;
use crate::batch_sequence::BatchSequenceSelector;
use crate::cleanup::cleanup_fleet;
use crate::condition::ConditionEmitter;
use crate::config::EngineConfig;
use crate::model::{DeviceSelectionDefinition, Fleet};
use crate::store::{DeviceStore, EventDispatcher, FleetStore, RolloutEvent, RolloutEventKind};

/// Drives the device-selection batch sequence for every fleet in an organization.
pub struct DeviceSelectionReconciler {
    fleet_store: Arc<dyn FleetStore>,
    device_store: Arc<dyn DeviceStore>,
    dispatcher: Arc<dyn EventDispatcher>,
    config: EngineConfig,
}

impl DeviceSelectionReconciler {
    /// Build a reconciler over the given store and dispatch implementations.
    pub fn new(
        fleet_store: Arc<dyn FleetStore>,
        device_store: Arc<dyn DeviceStore>,
        dispatcher: Arc<dyn EventDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            fleet_store,
            device_store,
            dispatcher,
            config,
        }
    }

    /// One tick over every candidate fleet in `org_id`. Each fleet's failure is
    /// isolated: logged and skipped, never propagated to the caller.
    pub async fn reconcile_organization(&self, org_id: &str) {
        let fleets = match self
            .fleet_store
            .list_fleets_with_rollout_device_selection(org_id)
            .await
        {
            Ok(fleets) => fleets,
            Err(e) => {
                error!(org_id, error = %e, "failed to list fleets for device-selection reconciliation");
                return;
            }
        };

        for fleet in fleets {
            if let Err(e) = self.reconcile_fleet(org_id, &fleet.name).await {
                error!(org_id, fleet_name = %fleet.name, error = %e, "device-selection reconciliation failed for fleet");
            }
        }
    }

    /// Run the §4.E loop for one fleet.
    pub async fn reconcile_fleet(&self, org_id: &str, fleet_name: &str) -> ReconcileResult<()> {
        let fleet = self.fleet_store.get_fleet(org_id, fleet_name).await?;

        let Some(policy) = fleet.rollout_policy.clone() else {
            if fleet.has_active_rollout_state() {
                cleanup_fleet(self.fleet_store.as_ref(), self.device_store.as_ref(), self.dispatcher.as_ref(), &fleet)
                    .await?;
            }
            return Ok(());
        };

        let DeviceSelectionDefinition::BatchSequence(sequence) = policy.device_selection.clone();
        let Some(template_version) = fleet.target_template_version().map(str::to_string) else {
            return Ok(());
        };
        let update_timeout = policy.update_timeout.unwrap_or(self.config.default_update_timeout);
        let success_threshold = policy.success_threshold;

        let selector = self.build_selector(
            fleet.clone(),
            template_version.clone(),
            sequence.clone(),
            update_timeout,
            success_threshold,
        );

        if selector.is_rollout_new() || selector.is_definition_updated()? {
            selector.on_new_rollout().await?;
            selector.reset().await?;
            self.dispatcher
                .emit(RolloutEvent {
                    org_id: org_id.to_string(),
                    fleet_name: fleet_name.to_string(),
                    device_name: None,
                    kind: RolloutEventKind::FleetRolloutStarted,
                })
                .await?;
        }

        // Bounded by one iteration per possible batch advancement (§5): the
        // sequence's explicit batches, plus the implicit final batch, plus one.
        let max_iterations = sequence.len() + 2;
        for _ in 0..max_iterations {
            let fleet = self.fleet_store.get_fleet(org_id, fleet_name).await?;
            let selector = self.build_selector(
                fleet,
                template_version.clone(),
                sequence.clone(),
                update_timeout,
                success_threshold,
            );

            if !selector.has_more_selections()? {
                // The pointer may already be past `sequence.len()` here (advanced one
                // step beyond the final implicit batch on the prior iteration), so this
                // does not go through `current_selection()`, which only resolves pointers
                // in `[-1, len]`.
                self.fleet_store
                    .update_fleet_conditions(org_id, fleet_name, vec![ConditionEmitter.on_finish()])
                    .await?;
                break;
            }

            let sel = selector.current_selection()?;

            if !sel.is_approved() {
                if sel.may_approve_automatically()? {
                    sel.approve().await?;
                } else {
                    match sel.approval_block_reason()? {
                        ApprovalBlockReason::WaitingForManualApproval => sel.on_waiting_for_approval().await?,
                        ApprovalBlockReason::ThresholdNotMet(report) => {
                            sel.on_suspended_threshold_not_met(&report).await?;
                        }
                    }
                    break;
                }
            }

            if !sel.is_rolled_out().await? {
                if let Ok(devices) = sel.devices().await {
                    debug!(
                        org_id,
                        fleet_name,
                        batch = %sel.batch_name(),
                        device_count = devices.len(),
                        "dispatching batch"
                    );
                }
                sel.on_rollout().await?;
                self.dispatcher
                    .emit(RolloutEvent {
                        org_id: org_id.to_string(),
                        fleet_name: fleet_name.to_string(),
                        device_name: None,
                        kind: RolloutEventKind::FleetRolloutBatchDispatched,
                    })
                    .await?;
                break;
            }

            if !sel.is_complete().await? {
                break;
            }

            sel.set_completion_report().await?;

            if !selector.has_more_selections()? {
                // unreachable given the check at loop entry, kept for defense against a
                // pointer mutated concurrently outside this reconciler's discipline.
                warn!(org_id, fleet_name, "pointer exhausted between loop-entry check and advance");
                sel.on_finish().await?;
                break;
            }

            selector.advance().await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "internal helper assembling the selector's constructor args")]
    fn build_selector(
        &self,
        fleet: Fleet,
        template_version: String,
        sequence: crate::model::BatchSequence,
        update_timeout: std::time::Duration,
        success_threshold: Option<u8>,
    ) -> BatchSequenceSelector {
        BatchSequenceSelector::new(
            fleet,
            template_version,
            sequence,
            update_timeout,
            success_threshold,
            Arc::clone(&self.fleet_store),
            Arc::clone(&self.device_store),
        )
    }
}
