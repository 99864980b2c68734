//! Domain types shared by both reconcilers: fleets, devices, batch sequences,
//! completion reports, and fleet conditions.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The engine-owned annotation keys written on a [`Fleet`] (§6 of the design).
pub mod fleet_annotations {
    /// Template version the fleet most recently began deploying.
    pub const DEPLOYING_TEMPLATE_VERSION: &str = "deployingTemplateVersion";
    /// Hex digest of the current batch-sequence definition.
    pub const CONFIG_DIGEST: &str = "deviceSelectionConfigDigest";
    /// Stringified batch pointer. Absent means the pointer is `-1`.
    pub const BATCH_NUMBER: &str = "batchNumber";
    /// `"true"` iff the current batch has been approved.
    pub const ROLLOUT_APPROVED: &str = "rolloutApproved";
    /// `"automatic"` or `"manual"`.
    pub const ROLLOUT_APPROVAL_METHOD: &str = "rolloutApprovalMethod";
    /// JSON-encoded [`super::CompletionReport`] for the most recently completed batch.
    pub const LAST_BATCH_COMPLETION_REPORT: &str = "lastBatchCompletionReport";
    /// The fleet's current target template version. Set by an external caller.
    pub const TEMPLATE_VERSION: &str = "templateVersion";

    /// All six engine-owned keys, for the cleanup path (§4.G).
    pub const ENGINE_OWNED: [&str; 6] = [
        DEPLOYING_TEMPLATE_VERSION,
        CONFIG_DIGEST,
        BATCH_NUMBER,
        ROLLOUT_APPROVED,
        ROLLOUT_APPROVAL_METHOD,
        LAST_BATCH_COMPLETION_REPORT,
    ];
}

/// The engine-owned annotation keys written on a [`Device`].
pub mod device_annotations {
    /// Presence-only flag marking membership in the current batch's dispatch set.
    pub const SELECTED_FOR_ROLLOUT: &str = "selectedForRollout";
    /// The template version this device was targeted with.
    pub const TEMPLATE_VERSION: &str = "templateVersion";
    /// The template version this device has actually rendered.
    pub const RENDERED_TEMPLATE_VERSION: &str = "renderedTemplateVersion";
    /// Monotonically increasing counter bumped each time rendering advances.
    pub const RENDERED_VERSION: &str = "renderedVersion";
}

/// Approval method for a batch: either auto-approved against a success threshold,
/// or gated on an external operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMethod {
    /// Approve automatically once the previous batch met its success threshold.
    Automatic,
    /// Require an explicit approval annotation write from an operator.
    Manual,
}

impl ApprovalMethod {
    /// Parse the `rolloutApprovalMethod` annotation value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// The annotation string value for this method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }
}

/// A batch size limit: either an absolute device count or a percentage of the
/// batch's matched population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchLimit {
    /// A fixed number of devices.
    Absolute(u64),
    /// A percentage (0-100) of the batch's matched device population.
    Percent(u8),
}

/// A label-selector match expression operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    /// The label's value must be one of the given values.
    In,
    /// The label's value must not be one of the given values.
    NotIn,
    /// The label key must be present, value unconstrained.
    Exists,
    /// The label key must be absent.
    DoesNotExist,
}

/// A single label-selector match expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExpression {
    /// The label key being matched.
    pub key: String,
    /// The comparison operator.
    pub operator: Operator,
    /// Candidate values; empty for `Exists`/`DoesNotExist`.
    pub values: Vec<String>,
}

/// A label selector: equality matches plus arbitrary match expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Exact label-value equality matches.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    /// Operator-based match expressions.
    #[serde(default)]
    pub match_expressions: Vec<MatchExpression>,
}

/// One step of a rollout's batch sequence (§3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Restricts which devices this batch considers; `None` matches the whole fleet.
    #[serde(default)]
    pub selector: Option<LabelSelector>,
    /// Caps how many devices this batch selects; `None` means no explicit cap.
    #[serde(default)]
    pub limit: Option<BatchLimit>,
    /// Overrides the fleet-level success threshold for this batch only.
    #[serde(default)]
    pub success_threshold: Option<u8>,
}

/// An ordered sequence of [`Batch`] steps, plus the implicit final batch (§3, §4.B).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSequence {
    /// The explicit batches, in order. The implicit final batch is not included here;
    /// it is pointer value `batches.len()`.
    pub batches: Vec<Batch>,
}

impl BatchSequence {
    /// Number of explicit batches (excludes the implicit final batch).
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// True iff there are no explicit batches (the implicit final batch still exists).
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// The batch at `index`, if `index` is one of the explicit batches.
    pub fn get(&self, index: usize) -> Option<&Batch> {
        self.batches.get(index)
    }
}

/// A fleet's disruption budget (§4.F): a per-group cap on concurrently in-flight
/// devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionBudget {
    /// Maximum number of devices in a group that may be unavailable at once.
    #[serde(default)]
    pub max_unavailable: Option<u32>,
    /// Minimum number of devices in a group that must remain available.
    #[serde(default)]
    pub min_available: Option<u32>,
    /// Label keys devices are grouped by. Empty means one global group.
    #[serde(default)]
    pub group_by: Vec<String>,
}

/// The polymorphic device-selection definition (§9: "polymorphic device-selection
/// definition"). Only one variant exists today; the trait in [`crate::selection`]
/// is what callers should program against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelectionDefinition {
    /// An ordered batch sequence (the only variant implemented today).
    BatchSequence(BatchSequence),
}

/// A fleet's rollout policy (§3): the device-selection definition plus optional
/// disruption budget, update timeout, and success threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    /// How devices are selected into batches.
    pub device_selection: DeviceSelectionDefinition,
    /// Optional concurrency cap on in-flight devices.
    #[serde(default)]
    pub disruption_budget: Option<DisruptionBudget>,
    /// Overrides the engine default update timeout for this fleet.
    #[serde(default)]
    pub update_timeout: Option<Duration>,
    /// Fleet-level success threshold (0-100), used when a batch has none of its own.
    #[serde(default)]
    pub success_threshold: Option<u8>,
}

/// A device's reported summary status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceSummaryStatus {
    /// The device is connected and reporting heartbeats.
    Online,
    /// The device has not reported recently; treated as disconnected.
    Unknown,
}

/// Why a device is currently updating, as reported by the device agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdatingReason {
    /// Not currently updating.
    #[default]
    None,
    /// Actively applying a new template version.
    Updating,
    /// The update failed.
    Error,
}

/// A managed edge device (§3). Owned by at most one fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Organization the device belongs to.
    pub org_id: String,
    /// Device name, unique within the organization.
    pub name: String,
    /// Name of the fleet that owns this device, if any.
    #[serde(default)]
    pub owner: Option<String>,
    /// Device labels, used by label selectors.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Reported connectivity/summary status.
    pub status: DeviceSummaryStatus,
    /// Engine- and agent-owned annotations (see [`device_annotations`]).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Why the device is currently updating, if at all.
    #[serde(default)]
    pub updating_reason: UpdatingReason,
    /// Whether the device's current update has exceeded its timeout.
    #[serde(default)]
    pub update_timed_out: bool,
}

impl Device {
    /// True iff [`device_annotations::SELECTED_FOR_ROLLOUT`] is present.
    pub fn is_selected_for_rollout(&self) -> bool {
        self.annotations
            .contains_key(device_annotations::SELECTED_FOR_ROLLOUT)
    }

    /// The device's targeted template version annotation, if set.
    pub fn template_version(&self) -> Option<&str> {
        self.annotations
            .get(device_annotations::TEMPLATE_VERSION)
            .map(String::as_str)
    }

    /// The device's rendered template version annotation, if set.
    pub fn rendered_template_version(&self) -> Option<&str> {
        self.annotations
            .get(device_annotations::RENDERED_TEMPLATE_VERSION)
            .map(String::as_str)
    }

    /// The device's rendered-version counter annotation (§3 invariant 7), if set and
    /// parseable. The device agent bumps this each time a render cycle completes; an
    /// unparseable or absent value is treated as "never bumped" rather than an error,
    /// since this value is agent-reported telemetry, not engine-owned control state.
    pub fn rendered_version(&self) -> Option<u64> {
        self.annotations
            .get(device_annotations::RENDERED_VERSION)
            .and_then(|raw| raw.parse::<u64>().ok())
    }

    /// Invariant 6: a device is *rolled out* w.r.t. `template_version` iff its
    /// template-version annotation equals it.
    pub fn is_rolled_out(&self, template_version: &str) -> bool {
        self.template_version() == Some(template_version)
    }

    /// Invariant 7's "rendered-version has advanced" clause: true iff the
    /// rendered-version counter is present and nonzero, i.e. the agent has bumped it
    /// at least once rather than leaving it at its un-rendered default.
    pub fn rendered_version_advanced(&self) -> bool {
        self.rendered_version().is_some_and(|v| v > 0)
    }
}

/// A fleet (§3), identified by `(org_id, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fleet {
    /// Organization the fleet belongs to.
    pub org_id: String,
    /// Fleet name, unique within the organization.
    pub name: String,
    /// The fleet's rollout policy, if any. Absence means no orchestration runs.
    #[serde(default)]
    pub rollout_policy: Option<RolloutPolicy>,
    /// Engine- and caller-owned annotations (see [`fleet_annotations`]).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Status conditions written by the [`crate::condition::ConditionEmitter`].
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Fleet {
    /// The fleet's current target template version (`templateVersion` annotation).
    pub fn target_template_version(&self) -> Option<&str> {
        self.annotations
            .get(fleet_annotations::TEMPLATE_VERSION)
            .map(String::as_str)
    }

    /// Invariant 3: the rollout is "active" iff any engine-owned annotation is set.
    pub fn has_active_rollout_state(&self) -> bool {
        fleet_annotations::ENGINE_OWNED
            .iter()
            .any(|k| self.annotations.contains_key(*k))
    }

    /// The stored batch pointer (invariant 2: absence means `-1`).
    ///
    /// # Errors
    /// Returns [`fleet_rollout_errors::ReconcileError::DataShape`] if the stored
    /// value is not a valid integer.
    pub fn batch_pointer(&self) -> fleet_rollout_errors::ReconcileResult<i64> {
        match self.annotations.get(fleet_annotations::BATCH_NUMBER) {
            None => Ok(-1),
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                fleet_rollout_errors::ReconcileError::DataShape(format!(
                    "invalid batch pointer annotation: {raw:?}"
                ))
            }),
        }
    }
}

/// The type of condition the engine writes on a fleet (§4.D). Only one condition
/// type exists today.
pub const ROLLOUT_IN_PROGRESS_CONDITION_TYPE: &str = "FleetRolloutInProgress";

/// A structured status condition attached to a fleet (§4.D).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition type; always [`ROLLOUT_IN_PROGRESS_CONDITION_TYPE`] today.
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Whether the condition is currently true.
    pub status: bool,
    /// A short machine-readable reason code.
    pub reason: String,
    /// A human-readable message.
    pub message: String,
}

/// A completion report for one finished batch (§3, §6). Field order and names are
/// bit-exact with the design's wire shape:
/// `{"batchName":...,"successPercentage":...,"total":...,"successful":...,"failed":...,"timedOut":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    /// The batch's display name (§4.B naming rules).
    pub batch_name: String,
    /// Integer truncation of `successful * 100 / total`; `100` when `total == 0`.
    pub success_percentage: u8,
    /// Total devices selected for this batch.
    pub total: u64,
    /// Devices that rolled out and rendered the target version.
    pub successful: u64,
    /// Devices whose updating reason was `Error`.
    pub failed: u64,
    /// Devices whose update timed out.
    pub timed_out: u64,
}

impl CompletionReport {
    /// Build a report from raw counts, applying the spec's truncation rule
    /// (§6: `100` when `total == 0`, else integer truncation).
    pub fn from_counts(batch_name: String, total: u64, successful: u64, failed: u64, timed_out: u64) -> Self {
        let success_percentage = if total == 0 {
            100
        } else {
            // Integer truncation, not rounding: `successful * 100 / total`.
            u8::try_from(successful.saturating_mul(100) / total).unwrap_or(100)
        };
        Self {
            batch_name,
            success_percentage,
            total,
            successful,
            failed,
            timed_out,
        }
    }
}
