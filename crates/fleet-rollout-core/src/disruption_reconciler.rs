//! Disruption-Budget Reconciler (§4.F): caps how many devices per label-group may
//! be concurrently unavailable, dispatching rendering work to the downstream
//! worker surface as slots free up. Operates independently from the
//! device-selection batch sequence.

use std::sync::Arc;

use tracing::error;

use fleet_rollout_errors::ReconcileResult;

use crate::model::Fleet;
use crate::selector::{DeviceQuery, group_query};
use crate::store::{DeviceStore, EventDispatcher, FleetStore, GroupCount, RolloutEvent, RolloutEventKind};

/// Drives the disruption budget for every fleet in an organization.
pub struct DisruptionBudgetReconciler {
    fleet_store: Arc<dyn FleetStore>,
    device_store: Arc<dyn DeviceStore>,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl DisruptionBudgetReconciler {
    /// Build a reconciler over the given store and dispatch implementations.
    pub fn new(
        fleet_store: Arc<dyn FleetStore>,
        device_store: Arc<dyn DeviceStore>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        Self {
            fleet_store,
            device_store,
            dispatcher,
        }
    }

    /// One tick over every fleet in `org_id` that carries a disruption budget.
    /// Per-fleet failures are logged and skipped, never propagated.
    pub async fn reconcile_organization(&self, org_id: &str) {
        let fleets = match self.fleet_store.list_fleets_with_disruption_budget(org_id).await {
            Ok(fleets) => fleets,
            Err(e) => {
                error!(org_id, error = %e, "failed to list fleets for disruption-budget reconciliation");
                return;
            }
        };

        for fleet in fleets {
            if let Err(e) = self.reconcile_fleet(org_id, &fleet).await {
                error!(org_id, fleet_name = %fleet.name, error = %e, "disruption-budget reconciliation failed for fleet");
            }
        }
    }

    async fn reconcile_fleet(&self, org_id: &str, fleet: &Fleet) -> ReconcileResult<()> {
        let Some(policy) = &fleet.rollout_policy else {
            return Ok(());
        };
        let Some(budget) = &policy.disruption_budget else {
            return Ok(());
        };
        if budget.max_unavailable.is_none() && budget.min_available.is_none() {
            return Ok(());
        }
        let Some(template_version) = fleet.target_template_version() else {
            return Ok(());
        };

        let group_by = &budget.group_by;
        let base_query = DeviceQuery::new().with_owner(&fleet.name);
        let totals = self
            .device_store
            .count_by_labels(org_id, &base_query.list_params(), group_by, false)
            .await?;
        let busy = self
            .device_store
            .count_by_labels(org_id, &base_query.list_params(), group_by, true)
            .await?;

        for GroupCount { group_key, count: total } in totals {
            let busy_count = busy
                .iter()
                .find(|g| g.group_key == group_key)
                .map_or(0, |g| g.count);
            let available = total.saturating_sub(busy_count);
            let unavailable = busy_count;

            let mut slots = u64::MAX;
            if let Some(max_unavailable) = budget.max_unavailable {
                let room = i64::from(max_unavailable) - i64::try_from(unavailable).unwrap_or(i64::MAX);
                slots = slots.min(u64::try_from(room.max(0)).unwrap_or(0));
            }
            if let Some(min_available) = budget.min_available {
                let room = i64::try_from(available).unwrap_or(i64::MAX) - i64::from(min_available);
                slots = slots.min(u64::try_from(room.max(0)).unwrap_or(0));
            }

            if slots == 0 {
                continue;
            }

            let render_query = group_query(&fleet.name, group_by, &group_key).with_rolled_out(template_version);
            let devices = self
                .device_store
                .list_devices(org_id, &render_query.list_params(), &render_query.annotation_selector())
                .await?;

            let pending: Vec<_> = devices
                .into_iter()
                .filter(|d| d.rendered_template_version() != Some(template_version))
                .take(usize::try_from(slots).unwrap_or(usize::MAX))
                .collect();

            for device in pending {
                self.dispatcher
                    .emit(RolloutEvent {
                        org_id: org_id.to_string(),
                        fleet_name: fleet.name.clone(),
                        device_name: Some(device.name.clone()),
                        kind: RolloutEventKind::DeviceSelectedForRendering,
                    })
                    .await?;
            }
        }

        Ok(())
    }
}
