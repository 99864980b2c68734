//! End-to-end scenarios for the two reconcilers, run against the in-memory
//! reference store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use fleet_rollout_core::mem::{InMemoryStore, RecordingDispatcher};
use fleet_rollout_core::model::{
    Batch, BatchLimit, BatchSequence, Device, DeviceSelectionDefinition, DeviceSummaryStatus, DisruptionBudget, Fleet,
    LabelSelector, RolloutPolicy, device_annotations, fleet_annotations,
};
use fleet_rollout_core::{DeviceSelectionReconciler, DisruptionBudgetReconciler, EngineConfig, RolloutEventKind};

fn online_device(org: &str, name: &str, owner: &str, labels: &[(&str, &str)]) -> Device {
    Device {
        org_id: org.to_string(),
        name: name.to_string(),
        owner: Some(owner.to_string()),
        labels: labels.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
        status: DeviceSummaryStatus::Online,
        annotations: BTreeMap::new(),
        updating_reason: Default::default(),
        update_timed_out: false,
    }
}

fn fleet_targeting(org: &str, name: &str, target_version: &str, sequence: BatchSequence) -> Fleet {
    let mut annotations = BTreeMap::new();
    annotations.insert(fleet_annotations::TEMPLATE_VERSION.to_string(), target_version.to_string());
    Fleet {
        org_id: org.to_string(),
        name: name.to_string(),
        rollout_policy: Some(RolloutPolicy {
            device_selection: DeviceSelectionDefinition::BatchSequence(sequence),
            disruption_budget: None,
            update_timeout: None,
            success_threshold: None,
        }),
        annotations,
        conditions: Vec::new(),
    }
}

/// Marks every currently-selected-for-rollout device as having rendered the
/// fleet's target template version, simulating the device agents catching up.
async fn complete_selected_devices(store: &InMemoryStore, org: &str, fleet: &str, version: &str) -> Result<()> {
    for device in store
        .list_devices(
            org,
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner(fleet)
                .with_selected_for_rollout()
                .list_params(),
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner(fleet)
                .with_selected_for_rollout()
                .annotation_selector(),
        )
        .await?
    {
        let mut updated = device.clone();
        updated
            .annotations
            .insert(device_annotations::TEMPLATE_VERSION.to_string(), version.to_string());
        updated
            .annotations
            .insert(device_annotations::RENDERED_TEMPLATE_VERSION.to_string(), version.to_string());
        updated
            .annotations
            .insert(device_annotations::RENDERED_VERSION.to_string(), "1".to_string());
        store.seed_device(updated).await;
    }
    Ok(())
}

use fleet_rollout_core::store::{DeviceStore, FleetStore};

#[tokio::test]
async fn single_batch_100_percent_reaches_rollout_inactive() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    for i in 0..3 {
        store.seed_device(online_device("org", &format!("d{i}"), "fleet-a", &[])).await;
    }
    let sequence = BatchSequence {
        batches: vec![Batch {
            selector: None,
            limit: Some(BatchLimit::Percent(100)),
            success_threshold: None,
        }],
    };
    store.seed_fleet(fleet_targeting("org", "fleet-a", "v2", sequence)).await;

    let reconciler = DeviceSelectionReconciler::new(
        store.clone(),
        store.clone(),
        dispatcher.clone(),
        EngineConfig::default(),
    );

    // Tick 1: pointer -1 -> 0, 3 devices marked, batch dispatched.
    reconciler.reconcile_fleet("org", "fleet-a").await?;
    let fleet = store.get_fleet("org", "fleet-a").await?;
    assert_eq!(fleet.batch_pointer()?, 0);
    let selected = store
        .count_devices(
            "org",
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_selected_for_rollout()
                .list_params(),
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_selected_for_rollout()
                .annotation_selector(),
        )
        .await?;
    assert_eq!(selected, 3);

    // Devices report rolled out.
    complete_selected_devices(&store, "org", "fleet-a", "v2").await?;

    // Tick 2: batch 1 completes; since the final implicit batch has nothing left to
    // select, the loop drains straight through it to `onFinish` within this one tick.
    reconciler.reconcile_fleet("org", "fleet-a").await?;
    let fleet = store.get_fleet("org", "fleet-a").await?;
    assert_eq!(fleet.batch_pointer()?, 2);
    assert_eq!(fleet.conditions.len(), 1);
    assert_eq!(fleet.conditions[0].reason, "RolloutInactive");
    Ok(())
}

#[tokio::test]
async fn labeled_multi_batch_marks_expected_counts_per_batch() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());

    for i in 0..4 {
        store.seed_device(online_device("org", &format!("v1-{i}"), "fleet-a", &[("key", "v1")])).await;
    }
    store.seed_device(online_device("org", "v2-0", "fleet-a", &[("key", "v2")])).await;
    store.seed_device(online_device("org", "plain-0", "fleet-a", &[])).await;

    let sequence = BatchSequence {
        batches: vec![
            Batch {
                selector: Some(LabelSelector {
                    match_labels: BTreeMap::from([("key".to_string(), "v1".to_string())]),
                    match_expressions: Vec::new(),
                }),
                limit: Some(BatchLimit::Absolute(1)),
                success_threshold: None,
            },
            Batch {
                selector: Some(LabelSelector {
                    match_labels: BTreeMap::from([("key".to_string(), "v1".to_string())]),
                    match_expressions: Vec::new(),
                }),
                limit: Some(BatchLimit::Percent(50)),
                success_threshold: None,
            },
            Batch {
                selector: Some(LabelSelector {
                    match_labels: BTreeMap::from([("key".to_string(), "v2".to_string())]),
                    match_expressions: Vec::new(),
                }),
                limit: None,
                success_threshold: None,
            },
            Batch {
                selector: None,
                limit: Some(BatchLimit::Percent(100)),
                success_threshold: None,
            },
        ],
    };
    store.seed_fleet(fleet_targeting("org", "fleet-a", "v2", sequence)).await;

    let reconciler = DeviceSelectionReconciler::new(
        store.clone(),
        store.clone(),
        dispatcher.clone(),
        EngineConfig::default(),
    );

    // First tick: the preliminary gate auto-approves, then batch 1 (Absolute(1) over
    // the 4 `key=v1` devices) marks exactly one device and dispatches.
    reconciler.reconcile_fleet("org", "fleet-a").await?;
    let first_batch_selected = store
        .count_devices(
            "org",
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_selected_for_rollout()
                .list_params(),
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_selected_for_rollout()
                .annotation_selector(),
        )
        .await?;
    assert_eq!(first_batch_selected, 1, "Absolute(1) must cap the first batch at one device");

    // Drive the remaining batches to completion: each tick either dispatches a newly
    // marked batch or, when a batch selects nothing new, cascades straight through to
    // the next one within the same tick.
    for _ in 0..10 {
        complete_selected_devices(&store, "org", "fleet-a", "v2").await?;
        reconciler.reconcile_fleet("org", "fleet-a").await?;
        let fleet = store.get_fleet("org", "fleet-a").await?;
        if fleet.conditions.iter().any(|c| c.reason == "RolloutInactive") {
            break;
        }
    }

    let fleet = store.get_fleet("org", "fleet-a").await?;
    assert_eq!(fleet.conditions.last().map(|c| c.reason.as_str()), Some("RolloutInactive"));
    let rolled_out = store
        .count_devices(
            "org",
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_rolled_out("v2")
                .list_params(),
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_rolled_out("v2")
                .annotation_selector(),
        )
        .await?;
    assert_eq!(rolled_out, 6, "every device in the fleet must end up targeting v2");
    Ok(())
}

#[tokio::test]
async fn auto_approve_threshold_gate_suspends_on_failed_batch() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());

    let mut annotations = BTreeMap::new();
    annotations.insert(fleet_annotations::TEMPLATE_VERSION.to_string(), "v2".to_string());
    annotations.insert(fleet_annotations::DEPLOYING_TEMPLATE_VERSION.to_string(), "v2".to_string());
    annotations.insert(fleet_annotations::ROLLOUT_APPROVAL_METHOD.to_string(), "automatic".to_string());
    annotations.insert(fleet_annotations::BATCH_NUMBER.to_string(), "1".to_string());
    let report = fleet_rollout_core::model::CompletionReport::from_counts("batch 1".to_string(), 9, 8, 1, 0);
    annotations.insert(
        fleet_annotations::LAST_BATCH_COMPLETION_REPORT.to_string(),
        serde_json::to_string(&report)?,
    );
    let sequence = BatchSequence {
        batches: vec![Batch::default(), Batch::default()],
    };
    let digest = fleet_rollout_core::digest::batch_sequence_digest(&sequence)?;
    annotations.insert(fleet_annotations::CONFIG_DIGEST.to_string(), digest);

    assert_eq!(report.success_percentage, 88);

    let fleet = Fleet {
        org_id: "org".to_string(),
        name: "fleet-a".to_string(),
        rollout_policy: Some(RolloutPolicy {
            device_selection: DeviceSelectionDefinition::BatchSequence(sequence),
            disruption_budget: None,
            update_timeout: None,
            success_threshold: Some(90),
        }),
        annotations,
        conditions: Vec::new(),
    };
    store.seed_fleet(fleet).await;

    let reconciler = DeviceSelectionReconciler::new(
        store.clone(),
        store.clone(),
        dispatcher.clone(),
        EngineConfig::default(),
    );
    reconciler.reconcile_fleet("org", "fleet-a").await?;

    let fleet = store.get_fleet("org", "fleet-a").await?;
    assert_eq!(fleet.batch_pointer()?, 1, "suspended batch must not advance");
    assert_eq!(fleet.conditions.len(), 1);
    assert_eq!(fleet.conditions[0].reason, "RolloutSuspended");
    assert!(fleet.conditions[0].message.contains("88%"));
    assert!(fleet.conditions[0].message.contains("90%"));
    Ok(())
}

#[tokio::test]
async fn definition_change_mid_rollout_resets_to_preliminary() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    store.seed_device(online_device("org", "d0", "fleet-a", &[])).await;

    let old_sequence = BatchSequence {
        batches: vec![Batch::default(), Batch::default(), Batch::default(), Batch::default()],
    };
    let mut annotations = BTreeMap::new();
    annotations.insert(fleet_annotations::TEMPLATE_VERSION.to_string(), "v2".to_string());
    annotations.insert(fleet_annotations::DEPLOYING_TEMPLATE_VERSION.to_string(), "v2".to_string());
    annotations.insert(fleet_annotations::BATCH_NUMBER.to_string(), "2".to_string());
    annotations.insert(
        fleet_annotations::CONFIG_DIGEST.to_string(),
        fleet_rollout_core::digest::batch_sequence_digest(&old_sequence)?,
    );

    // The operator edits the sequence: one fewer batch.
    let new_sequence = BatchSequence {
        batches: vec![Batch::default(), Batch::default(), Batch::default()],
    };
    let fleet = Fleet {
        org_id: "org".to_string(),
        name: "fleet-a".to_string(),
        rollout_policy: Some(RolloutPolicy {
            device_selection: DeviceSelectionDefinition::BatchSequence(new_sequence),
            disruption_budget: None,
            update_timeout: None,
            success_threshold: None,
        }),
        annotations,
        conditions: Vec::new(),
    };
    store.seed_fleet(fleet).await;

    let reconciler = DeviceSelectionReconciler::new(
        store.clone(),
        store.clone(),
        dispatcher.clone(),
        EngineConfig::default(),
    );
    reconciler.reconcile_fleet("org", "fleet-a").await?;

    // The tick both resets and immediately re-advances once, so assert on the
    // digest/annotation rewrite rather than the pointer having stayed at -1.
    let fleet = store.get_fleet("org", "fleet-a").await?;
    assert_eq!(
        fleet.annotations.get(fleet_annotations::CONFIG_DIGEST),
        Some(&fleet_rollout_core::digest::batch_sequence_digest(&BatchSequence {
            batches: vec![Batch::default(), Batch::default(), Batch::default()],
        })?)
    );
    assert!(fleet.batch_pointer()? >= 0, "reset should have been followed by at least one advance this tick");
    Ok(())
}

#[tokio::test]
async fn batch_number_overflow_leaves_state_unchanged() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());

    let sequence = BatchSequence {
        batches: vec![Batch::default(), Batch::default()],
    };
    let mut annotations = BTreeMap::new();
    annotations.insert(fleet_annotations::TEMPLATE_VERSION.to_string(), "v2".to_string());
    annotations.insert(fleet_annotations::BATCH_NUMBER.to_string(), "3".to_string()); // len+1
    let fleet = Fleet {
        org_id: "org".to_string(),
        name: "fleet-a".to_string(),
        rollout_policy: None,
        annotations: annotations.clone(),
        conditions: Vec::new(),
    };
    store.seed_fleet(fleet).await;

    let selector = fleet_rollout_core::BatchSequenceSelector::new(
        store.get_fleet("org", "fleet-a").await?,
        "v2".to_string(),
        sequence,
        Duration::from_secs(60),
        None,
        store.clone(),
        store.clone(),
    );

    match selector.advance().await {
        Ok(()) => assert!(false, "advancing past len+1 must fail"),
        Err(e) => assert!(e.to_string().contains("batch number overflow")),
    }

    let fleet = store.get_fleet("org", "fleet-a").await?;
    assert_eq!(fleet.annotations, annotations, "no mutation should have happened");
    Ok(())
}

/// A device targeted at `version` but not yet caught up in rendering it — the
/// "busy"/in-flight population §4.F's budget math and render-dispatch query both key
/// off of.
fn targeted_unrendered_device(org: &str, name: &str, owner: &str, labels: &[(&str, &str)], version: &str) -> Device {
    let mut device = online_device(org, name, owner, labels);
    device
        .annotations
        .insert(device_annotations::TEMPLATE_VERSION.to_string(), version.to_string());
    device
}

#[tokio::test]
async fn disruption_budget_dispatches_exactly_the_available_slots() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());

    // 4-group: 2 busy (targeted at v2, unrendered), 2 untouched/available.
    for i in 0..2 {
        store
            .seed_device(targeted_unrendered_device(
                "org",
                &format!("g1-busy-{i}"),
                "fleet-a",
                &[("label-1", "value-1"), ("label-2", "value-2")],
                "v2",
            ))
            .await;
    }
    for i in 0..2 {
        store
            .seed_device(online_device(
                "org",
                &format!("g1-idle-{i}"),
                "fleet-a",
                &[("label-1", "value-1"), ("label-2", "value-2")],
            ))
            .await;
    }
    // 3-group: 1 busy, 2 untouched.
    store
        .seed_device(targeted_unrendered_device(
            "org",
            "g2-busy-0",
            "fleet-a",
            &[("label-1", "value-3"), ("label-2", "value-2")],
            "v2",
        ))
        .await;
    for i in 0..2 {
        store
            .seed_device(online_device(
                "org",
                &format!("g2-idle-{i}"),
                "fleet-a",
                &[("label-1", "value-3"), ("label-2", "value-2")],
            ))
            .await;
    }
    // Unlabeled group: none targeted.
    for i in 0..2 {
        store.seed_device(online_device("org", &format!("u-{i}"), "fleet-a", &[])).await;
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(fleet_annotations::TEMPLATE_VERSION.to_string(), "v2".to_string());
    let fleet = Fleet {
        org_id: "org".to_string(),
        name: "fleet-a".to_string(),
        rollout_policy: Some(RolloutPolicy {
            device_selection: DeviceSelectionDefinition::BatchSequence(BatchSequence::default()),
            disruption_budget: Some(DisruptionBudget {
                max_unavailable: Some(3),
                min_available: None,
                group_by: vec!["label-1".to_string(), "label-2".to_string()],
            }),
            update_timeout: None,
            success_threshold: None,
        }),
        annotations,
        conditions: Vec::new(),
    };
    store.seed_fleet(fleet).await;

    let reconciler = DisruptionBudgetReconciler::new(store.clone(), store.clone(), dispatcher.clone());
    reconciler.reconcile_organization("org").await;

    let events = dispatcher.events().await;
    let render_events: Vec<_> = events
        .iter()
        .filter(|e| e.kind == RolloutEventKind::DeviceSelectedForRendering)
        .collect();
    // 4-group: 2 busy, room for maxUnavailable(3) - 2 = 1 more -> capped to 1.
    // 3-group: 1 busy, room for 3 - 1 = 2 -> only 1 busy candidate exists, dispatch 1.
    // Unlabeled group: nothing targeted, 0 busy candidates, dispatch 0.
    assert_eq!(render_events.len(), 2, "1 capped dispatch from the 4-group, 1 from the 3-group, 0 unlabeled");
    Ok(())
}

#[tokio::test]
async fn batch_selection_devices_returns_exactly_the_marked_set() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());

    store.seed_device(online_device("org", "marked-0", "fleet-a", &[])).await;
    store.seed_device(online_device("org", "marked-1", "fleet-a", &[])).await;
    store.seed_device(online_device("org", "unmarked", "fleet-a", &[])).await;

    let query = fleet_rollout_core::selector::DeviceQuery::new().with_owner("fleet-a");
    store
        .mark_devices_rollout_selection(
            "org",
            &query.list_params(),
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .annotation_selector(),
            Some(2),
        )
        .await?;

    let mut annotations = BTreeMap::new();
    annotations.insert(fleet_annotations::TEMPLATE_VERSION.to_string(), "v2".to_string());
    annotations.insert(fleet_annotations::BATCH_NUMBER.to_string(), "0".to_string());
    let fleet = Fleet {
        org_id: "org".to_string(),
        name: "fleet-a".to_string(),
        rollout_policy: None,
        annotations,
        conditions: Vec::new(),
    };
    store.seed_fleet(fleet).await;

    let selector = fleet_rollout_core::BatchSequenceSelector::new(
        store.get_fleet("org", "fleet-a").await?,
        "v2".to_string(),
        BatchSequence {
            batches: vec![Batch::default()],
        },
        Duration::from_secs(60),
        None,
        store.clone(),
        store.clone(),
    );
    let selection = selector.current_selection()?;

    let expected_marked: Vec<String> = store
        .list_devices(
            "org",
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_selected_for_rollout()
                .list_params(),
            &fleet_rollout_core::selector::DeviceQuery::new()
                .with_owner("fleet-a")
                .with_selected_for_rollout()
                .annotation_selector(),
        )
        .await?
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(expected_marked.len(), 2, "exactly two devices should have been marked");

    let mut names: Vec<String> = selection.devices().await?.into_iter().map(|d| d.name).collect();
    names.sort();
    let mut expected = expected_marked;
    expected.sort();
    assert_eq!(names, expected, "devices() must return exactly the batch's selected-for-rollout set");
    Ok(())
}
