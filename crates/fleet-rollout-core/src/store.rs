//! Store and event-dispatch contracts (§6): the only interfaces this crate consumes
//! from the outside world. Implementations live elsewhere (a real database-backed
//! store, a real worker queue); [`crate::mem`] provides an in-memory reference
//! implementation for tests and the demo binary.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{Condition, Device, Fleet};
use crate::selector::{AnnotationSelector, ListParams};
use fleet_rollout_errors::StoreResult;

/// Per-group device counts returned by [`DeviceStore::count_by_labels`] (§4.F, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCount {
    /// The group's key: the subset of `group_by` labels present on its devices.
    pub group_key: BTreeMap<String, String>,
    /// Device count in this group.
    pub count: u64,
}

/// Aggregated per-batch completion counts (§4.C), as returned by
/// [`DeviceStore::get_device_completion_counts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionCounts {
    /// Devices selected for rollout in the current batch.
    pub total: u64,
    /// Selected devices that are `SameTemplateVersion ∧ SameRenderedVersion`.
    pub successful: u64,
    /// Selected devices that are `SameTemplateVersion ∧ UpdatingReason == Error`.
    pub failed: u64,
    /// Selected devices that are `SameTemplateVersion ∧ UpdateTimedOut`.
    pub timed_out: u64,
}

impl CompletionCounts {
    /// Invariant 7: a batch is complete iff every selected device reached a
    /// terminal state.
    pub fn is_complete(&self) -> bool {
        self.total == self.successful + self.failed + self.timed_out
    }
}

/// Store operations on fleets (§6).
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Fetch one fleet by name.
    async fn get_fleet(&self, org_id: &str, fleet_name: &str) -> StoreResult<Fleet>;

    /// List fleets in the organization whose rollout policy has a device-selection
    /// definition.
    async fn list_fleets_with_rollout_device_selection(&self, org_id: &str) -> StoreResult<Vec<Fleet>>;

    /// List fleets in the organization whose rollout policy has a disruption
    /// budget.
    async fn list_fleets_with_disruption_budget(&self, org_id: &str) -> StoreResult<Vec<Fleet>>;

    /// Atomically set and/or delete annotations on a fleet.
    async fn update_fleet_annotations(
        &self,
        org_id: &str,
        fleet_name: &str,
        set: BTreeMap<String, String>,
        delete: Vec<String>,
    ) -> StoreResult<()>;

    /// Replace a fleet's status conditions.
    async fn update_fleet_conditions(
        &self,
        org_id: &str,
        fleet_name: &str,
        conditions: Vec<Condition>,
    ) -> StoreResult<()>;
}

/// Store operations on devices (§6).
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// List devices matching a field/label selector and annotation selector.
    async fn list_devices(
        &self,
        org_id: &str,
        list_params: &ListParams,
        annotations: &AnnotationSelector,
    ) -> StoreResult<Vec<Device>>;

    /// Count devices matching a field/label selector and annotation selector.
    async fn count_devices(
        &self,
        org_id: &str,
        list_params: &ListParams,
        annotations: &AnnotationSelector,
    ) -> StoreResult<u64>;

    /// Set the `selectedForRollout` annotation on matched devices, up to `limit`
    /// (`None` means no limit). Returns the number of devices marked.
    async fn mark_devices_rollout_selection(
        &self,
        org_id: &str,
        list_params: &ListParams,
        annotations: &AnnotationSelector,
        limit: Option<u64>,
    ) -> StoreResult<u64>;

    /// Remove the `selectedForRollout` annotation from every device owned by
    /// `fleet_name`.
    async fn unmark_devices_rollout_selection(&self, org_id: &str, fleet_name: &str) -> StoreResult<()>;

    /// Aggregate completion counts for devices selected-for-rollout and owned by
    /// `fleet_name`, with respect to `template_version` and `update_timeout`.
    async fn get_device_completion_counts(
        &self,
        org_id: &str,
        fleet_name: &str,
        template_version: &str,
        update_timeout: Duration,
    ) -> StoreResult<CompletionCounts>;

    /// Per-group device totals for the disruption-budget reconciler (§4.F).
    /// `busy_only` restricts the count to devices currently rendering (targeted at
    /// a template version but not yet caught up).
    async fn count_by_labels(
        &self,
        org_id: &str,
        list_params: &ListParams,
        group_by: &[String],
        busy_only: bool,
    ) -> StoreResult<Vec<GroupCount>>;
}

/// The kind of lifecycle event the engine emits to the downstream worker/event
/// surface (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutEventKind {
    /// A brand-new rollout began for a fleet (also emitted when the rollout policy
    /// is removed and the whole fleet should proceed to rollout freely, §4.G).
    FleetRolloutStarted,
    /// A batch within a fleet's rollout was dispatched.
    FleetRolloutBatchDispatched,
    /// A specific device was selected for rendering by the disruption-budget
    /// reconciler.
    DeviceSelectedForRendering,
}

/// A lifecycle event emitted to the downstream worker/event dispatch surface (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutEvent {
    /// Organization the event belongs to.
    pub org_id: String,
    /// Fleet the event concerns.
    pub fleet_name: String,
    /// Device the event concerns, if any.
    pub device_name: Option<String>,
    /// The kind of event.
    pub kind: RolloutEventKind,
}

/// The worker/event dispatch contract (§6): a non-blocking emit.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Emit one lifecycle event. Implementations must not block on downstream
    /// processing.
    async fn emit(&self, event: RolloutEvent) -> StoreResult<()>;
}
