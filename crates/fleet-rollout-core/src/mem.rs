//! In-memory reference implementation of the store and dispatch contracts (§6
//! AMBIENT), used by unit/scenario tests and the demo binary. Grounded on
//! `StagedRolloutManager`'s `RwLock<HashMap<...>>` pattern: state is kept behind a
//! `tokio::sync::RwLock` keyed by `(org_id, name)`, never held across an `.await`
//! outside of the lock's own critical section.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use fleet_rollout_errors::{StoreError, StoreResult};

use crate::model::{Condition, Device, DeviceSummaryStatus, Fleet, device_annotations};
use crate::selector::{AnnotationSelector, ListParams};
use crate::store::{CompletionCounts, DeviceStore, EventDispatcher, FleetStore, GroupCount, RolloutEvent};

fn owner_field(device: &Device) -> String {
    format!("Fleet/{}", device.owner.as_deref().unwrap_or(""))
}

fn status_field(device: &Device) -> &'static str {
    match device.status {
        DeviceSummaryStatus::Online => "Online",
        DeviceSummaryStatus::Unknown => "Unknown",
    }
}

fn device_matches_field_selector(device: &Device, field_selector: &str) -> bool {
    field_selector.split(',').filter(|c| !c.is_empty()).all(|clause| {
        if let Some((key, value)) = clause.split_once("!=") {
            match key {
                "metadata.owner" => owner_field(device) != value,
                "status.summary.status" => status_field(device) != value,
                _ => true,
            }
        } else if let Some((key, value)) = clause.split_once('=') {
            match key {
                "metadata.owner" => owner_field(device) == value,
                "status.summary.status" => status_field(device) == value,
                _ => true,
            }
        } else {
            true
        }
    })
}

fn parse_values(parenthesized: &str) -> Vec<&str> {
    parenthesized
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect()
}

fn device_matches_label_selector(device: &Device, label_selector: &str) -> bool {
    label_selector.split(',').filter(|c| !c.is_empty()).all(|clause| {
        if let Some(key) = clause.strip_prefix('!') {
            !device.labels.contains_key(key)
        } else if let Some((key, rest)) = clause.split_once(" notin ") {
            let values = parse_values(rest);
            !device.labels.get(key).is_some_and(|v| values.contains(&v.as_str()))
        } else if let Some((key, rest)) = clause.split_once(" in ") {
            let values = parse_values(rest);
            device.labels.get(key).is_some_and(|v| values.contains(&v.as_str()))
        } else if let Some((key, value)) = clause.split_once('=') {
            device.labels.get(key).is_some_and(|v| v == value)
        } else {
            device.labels.contains_key(clause)
        }
    })
}

fn device_matches(device: &Device, list_params: &ListParams, annotations: &AnnotationSelector) -> bool {
    device_matches_field_selector(device, &list_params.field_selector)
        && device_matches_label_selector(device, &list_params.label_selector)
        && annotations.matches(device)
}

/// Keyed by `(org_id, name)`.
type FleetKey = (String, String);
/// Keyed by `(org_id, name)`.
type DeviceKey = (String, String);

/// In-memory `FleetStore` + `DeviceStore` reference implementation.
#[derive(Default)]
pub struct InMemoryStore {
    fleets: RwLock<BTreeMap<FleetKey, Fleet>>,
    devices: RwLock<BTreeMap<DeviceKey, Device>>,
}

impl InMemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a fleet. Test/demo helper, not part of the store contract.
    pub async fn seed_fleet(&self, fleet: Fleet) {
        self.fleets
            .write()
            .await
            .insert((fleet.org_id.clone(), fleet.name.clone()), fleet);
    }

    /// Insert or replace a device. Test/demo helper, not part of the store contract.
    pub async fn seed_device(&self, device: Device) {
        self.devices
            .write()
            .await
            .insert((device.org_id.clone(), device.name.clone()), device);
    }
}

#[async_trait]
impl FleetStore for InMemoryStore {
    async fn get_fleet(&self, org_id: &str, fleet_name: &str) -> StoreResult<Fleet> {
        self.fleets
            .read()
            .await
            .get(&(org_id.to_string(), fleet_name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::FleetNotFound {
                org_id: org_id.to_string(),
                fleet_name: fleet_name.to_string(),
            })
    }

    async fn list_fleets_with_rollout_device_selection(&self, org_id: &str) -> StoreResult<Vec<Fleet>> {
        Ok(self
            .fleets
            .read()
            .await
            .values()
            .filter(|f| f.org_id == org_id)
            .filter(|f| f.rollout_policy.is_some() || f.has_active_rollout_state())
            .cloned()
            .collect())
    }

    async fn list_fleets_with_disruption_budget(&self, org_id: &str) -> StoreResult<Vec<Fleet>> {
        Ok(self
            .fleets
            .read()
            .await
            .values()
            .filter(|f| f.org_id == org_id)
            .filter(|f| {
                f.rollout_policy
                    .as_ref()
                    .is_some_and(|p| p.disruption_budget.is_some())
            })
            .cloned()
            .collect())
    }

    async fn update_fleet_annotations(
        &self,
        org_id: &str,
        fleet_name: &str,
        set: BTreeMap<String, String>,
        delete: Vec<String>,
    ) -> StoreResult<()> {
        let mut fleets = self.fleets.write().await;
        let fleet = fleets
            .get_mut(&(org_id.to_string(), fleet_name.to_string()))
            .ok_or_else(|| StoreError::FleetNotFound {
                org_id: org_id.to_string(),
                fleet_name: fleet_name.to_string(),
            })?;
        for key in delete {
            fleet.annotations.remove(&key);
        }
        fleet.annotations.extend(set);
        Ok(())
    }

    async fn update_fleet_conditions(
        &self,
        org_id: &str,
        fleet_name: &str,
        conditions: Vec<Condition>,
    ) -> StoreResult<()> {
        let mut fleets = self.fleets.write().await;
        let fleet = fleets
            .get_mut(&(org_id.to_string(), fleet_name.to_string()))
            .ok_or_else(|| StoreError::FleetNotFound {
                org_id: org_id.to_string(),
                fleet_name: fleet_name.to_string(),
            })?;
        fleet.conditions = conditions;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn list_devices(
        &self,
        org_id: &str,
        list_params: &ListParams,
        annotations: &AnnotationSelector,
    ) -> StoreResult<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.org_id == org_id)
            .filter(|d| device_matches(d, list_params, annotations))
            .cloned()
            .collect())
    }

    async fn count_devices(
        &self,
        org_id: &str,
        list_params: &ListParams,
        annotations: &AnnotationSelector,
    ) -> StoreResult<u64> {
        Ok(self.list_devices(org_id, list_params, annotations).await?.len() as u64)
    }

    async fn mark_devices_rollout_selection(
        &self,
        org_id: &str,
        list_params: &ListParams,
        annotations: &AnnotationSelector,
        limit: Option<u64>,
    ) -> StoreResult<u64> {
        let mut devices = self.devices.write().await;
        let mut matched: Vec<_> = devices
            .values_mut()
            .filter(|d| d.org_id == org_id)
            .filter(|d| device_matches(d, list_params, annotations))
            .collect();
        let take = limit.map_or(matched.len(), |l| usize::try_from(l).unwrap_or(usize::MAX));
        let mut marked = 0u64;
        for device in matched.iter_mut().take(take) {
            device
                .annotations
                .insert(device_annotations::SELECTED_FOR_ROLLOUT.to_string(), "true".to_string());
            marked += 1;
        }
        Ok(marked)
    }

    async fn unmark_devices_rollout_selection(&self, org_id: &str, fleet_name: &str) -> StoreResult<()> {
        let mut devices = self.devices.write().await;
        for device in devices.values_mut() {
            if device.org_id == org_id && device.owner.as_deref() == Some(fleet_name) {
                device.annotations.remove(device_annotations::SELECTED_FOR_ROLLOUT);
            }
        }
        Ok(())
    }

    async fn get_device_completion_counts(
        &self,
        org_id: &str,
        fleet_name: &str,
        template_version: &str,
        _update_timeout: Duration,
    ) -> StoreResult<CompletionCounts> {
        // A real store classifies `UpdateTimedOut` from elapsed wall-clock time
        // against `update_timeout`; this reference store trusts the device's own
        // `update_timed_out` flag instead of simulating time.
        let devices = self.devices.read().await;
        let mut counts = CompletionCounts::default();
        for device in devices.values() {
            if device.org_id != org_id || device.owner.as_deref() != Some(fleet_name) {
                continue;
            }
            if !device.is_selected_for_rollout() {
                continue;
            }
            counts.total += 1;
            let same_template_version = device.template_version() == Some(template_version);
            let same_rendered_version = device.rendered_template_version() == Some(template_version);
            if same_template_version && same_rendered_version && device.rendered_version_advanced() {
                counts.successful += 1;
            } else if same_template_version && device.updating_reason == crate::model::UpdatingReason::Error {
                counts.failed += 1;
            } else if same_template_version && device.update_timed_out {
                counts.timed_out += 1;
            }
        }
        Ok(counts)
    }

    async fn count_by_labels(
        &self,
        org_id: &str,
        list_params: &ListParams,
        group_by: &[String],
        busy_only: bool,
    ) -> StoreResult<Vec<GroupCount>> {
        let devices = self.devices.read().await;
        let mut groups: BTreeMap<BTreeMap<String, String>, u64> = BTreeMap::new();
        for device in devices.values() {
            if device.org_id != org_id {
                continue;
            }
            if !device_matches_field_selector(device, &list_params.field_selector)
                || !device_matches_label_selector(device, &list_params.label_selector)
            {
                continue;
            }
            if busy_only {
                let busy = device.template_version().is_some()
                    && device.rendered_template_version() != device.template_version();
                if !busy {
                    continue;
                }
            }
            let group_key: BTreeMap<String, String> = group_by
                .iter()
                .filter_map(|key| device.labels.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            *groups.entry(group_key).or_insert(0) += 1;
        }
        Ok(groups
            .into_iter()
            .map(|(group_key, count)| GroupCount { group_key, count })
            .collect())
    }
}

/// Records every emitted event for test assertions.
#[derive(Default)]
pub struct RecordingDispatcher {
    events: RwLock<Vec<RolloutEvent>>,
}

impl RecordingDispatcher {
    /// A dispatcher with no recorded events.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every event emitted so far.
    pub async fn events(&self) -> Vec<RolloutEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventDispatcher for RecordingDispatcher {
    async fn emit(&self, event: RolloutEvent) -> StoreResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}
