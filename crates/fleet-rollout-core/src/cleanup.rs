//! Cleanup / Policy-Removal (§4.G): when a fleet's rollout policy disappears
//! while engine-owned annotations are still present, remove all six of them in
//! one update, unmark every selected device, and tell downstream the whole fleet
//! may now roll out freely.

use fleet_rollout_errors::ReconcileResult;

use crate::model::{Fleet, fleet_annotations};
use crate::store::{DeviceStore, EventDispatcher, FleetStore, RolloutEvent, RolloutEventKind};

/// Run the cleanup path for `fleet`. Callers must have already confirmed
/// [`Fleet::has_active_rollout_state`] is true.
pub async fn cleanup_fleet(
    fleet_store: &dyn FleetStore,
    device_store: &dyn DeviceStore,
    dispatcher: &dyn EventDispatcher,
    fleet: &Fleet,
) -> ReconcileResult<()> {
    device_store
        .unmark_devices_rollout_selection(&fleet.org_id, &fleet.name)
        .await?;
    fleet_store
        .update_fleet_annotations(
            &fleet.org_id,
            &fleet.name,
            std::collections::BTreeMap::new(),
            fleet_annotations::ENGINE_OWNED.iter().map(|k| (*k).to_string()).collect(),
        )
        .await?;
    dispatcher
        .emit(RolloutEvent {
            org_id: fleet.org_id.clone(),
            fleet_name: fleet.name.clone(),
            device_name: None,
            kind: RolloutEventKind::FleetRolloutStarted,
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{InMemoryStore, RecordingDispatcher};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn cleanup_removes_all_engine_annotations_and_unmarks_devices() -> ReconcileResult<()> {
        let store = InMemoryStore::new();
        let dispatcher = RecordingDispatcher::new();

        let mut annotations = BTreeMap::new();
        annotations.insert(fleet_annotations::BATCH_NUMBER.to_string(), "2".to_string());
        annotations.insert(fleet_annotations::ROLLOUT_APPROVED.to_string(), "true".to_string());
        let fleet = Fleet {
            org_id: "org-a".to_string(),
            name: "fleet-a".to_string(),
            rollout_policy: None,
            annotations,
            conditions: Vec::new(),
        };
        store.seed_fleet(fleet.clone()).await;

        cleanup_fleet(&store, &store, &dispatcher, &fleet).await?;

        let refetched = store.get_fleet("org-a", "fleet-a").await?;
        assert!(!refetched.has_active_rollout_state());
        assert_eq!(dispatcher.events().await.len(), 1);
        Ok(())
    }
}
