//! Selector-Query Builder (§4.A): composes field/label/annotation selector triplets
//! consumed by device-count and device-list store queries.
//!
//! The builder is a pure value — composition order is irrelevant, and
//! [`DeviceQuery::list_params`] / [`DeviceQuery::annotation_selector`] may be called
//! repeatedly without side effects.

use std::collections::BTreeMap;

use crate::model::{Device, LabelSelector, MatchExpression, Operator, device_annotations};

/// Flattened field/label selectors consumed by the store's list/count calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Comma-joined field-selector clauses, e.g. `metadata.owner=Fleet/rig-a`.
    pub field_selector: String,
    /// Comma-joined label-selector clauses.
    pub label_selector: String,
}

/// Requirements on device annotations, evaluated client-side over listed devices
/// (the store contract in §6 treats this as an opaque selector object; the engine
/// only needs it to compose and to filter consistently).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationSelector {
    /// Annotation keys that must be present.
    pub must_exist: Vec<String>,
    /// `key IN {values}` requirements.
    pub in_values: Vec<(String, Vec<String>)>,
    /// `key NOT IN {values}` requirements.
    pub not_in_values: Vec<(String, Vec<String>)>,
}

impl AnnotationSelector {
    /// True iff `device` satisfies every accumulated requirement.
    pub fn matches(&self, device: &Device) -> bool {
        self.must_exist
            .iter()
            .all(|k| device.annotations.contains_key(k))
            && self.in_values.iter().all(|(k, values)| {
                device
                    .annotations
                    .get(k)
                    .is_some_and(|v| values.iter().any(|candidate| candidate == v))
            })
            && self.not_in_values.iter().all(|(k, values)| {
                !device
                    .annotations
                    .get(k)
                    .is_some_and(|v| values.iter().any(|candidate| candidate == v))
            })
    }
}

fn quote_field(key: &str, op: &str, value: &str) -> String {
    format!("{key}{op}{value}")
}

fn match_expression_clause(expr: &MatchExpression) -> String {
    match expr.operator {
        Operator::In => format!("{} in ({})", expr.key, expr.values.join(",")),
        Operator::NotIn => format!("{} notin ({})", expr.key, expr.values.join(",")),
        Operator::Exists => expr.key.clone(),
        Operator::DoesNotExist => format!("!{}", expr.key),
    }
}

/// A composable, pure query builder for the device store (§4.A).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceQuery {
    field_clauses: Vec<String>,
    label_clauses: Vec<String>,
    annotations: AnnotationSelector,
}

impl DeviceQuery {
    /// Start an empty query matching every device in the organization.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to devices owned by `fleet_name`.
    #[must_use]
    pub fn with_owner(mut self, fleet_name: &str) -> Self {
        self.field_clauses
            .push(quote_field("metadata.owner", "=", &format!("Fleet/{fleet_name}")));
        self
    }

    /// Apply a [`LabelSelector`]'s equality matches and match expressions.
    #[must_use]
    pub fn with_label_selector(mut self, selector: &LabelSelector) -> Self {
        for (k, v) in &selector.match_labels {
            self.label_clauses.push(quote_field(k, "=", v));
        }
        for expr in &selector.match_expressions {
            self.label_clauses.push(match_expression_clause(expr));
        }
        self
    }

    /// A single label-key/value equality match, used by the disruption-budget
    /// reconciler's per-group queries (§4.F).
    #[must_use]
    pub fn with_label_equals(mut self, key: &str, value: &str) -> Self {
        self.label_clauses.push(quote_field(key, "=", value));
        self
    }

    /// A `DoesNotExist` match on a label key, used when a disruption-budget group-by
    /// key is absent on a device (§4.F: "a group key whose value is absent yields a
    /// `DoesNotExist` predicate").
    #[must_use]
    pub fn without_label(mut self, key: &str) -> Self {
        self.label_clauses.push(format!("!{key}"));
        self
    }

    /// Require the `selectedForRollout` annotation to be present.
    #[must_use]
    pub fn with_selected_for_rollout(mut self) -> Self {
        self.annotations
            .must_exist
            .push(device_annotations::SELECTED_FOR_ROLLOUT.to_string());
        self
    }

    /// Require the device's template-version annotation to equal `template_version`.
    #[must_use]
    pub fn with_rolled_out(mut self, template_version: &str) -> Self {
        self.annotations.in_values.push((
            device_annotations::TEMPLATE_VERSION.to_string(),
            vec![template_version.to_string()],
        ));
        self
    }

    /// Require the device's template-version annotation to differ from
    /// `template_version` (including absence).
    #[must_use]
    pub fn without_rolled_out(mut self, template_version: &str) -> Self {
        self.annotations.not_in_values.push((
            device_annotations::TEMPLATE_VERSION.to_string(),
            vec![template_version.to_string()],
        ));
        self
    }

    /// Exclude devices whose summary status is `Unknown`.
    #[must_use]
    pub fn without_disconnected(mut self) -> Self {
        self.field_clauses
            .push(quote_field("status.summary.status", "!=", "Unknown"));
        self
    }

    /// The flattened field/label selector pair for this query.
    pub fn list_params(&self) -> ListParams {
        ListParams {
            field_selector: self.field_clauses.join(","),
            label_selector: self.label_clauses.join(","),
        }
    }

    /// The accumulated annotation selector for this query.
    pub fn annotation_selector(&self) -> AnnotationSelector {
        self.annotations.clone()
    }
}

/// Build the per-group label-equality query used by the disruption-budget
/// reconciler (§4.F): an exact match for every present key in `group_key`, and a
/// `DoesNotExist` clause for every configured group-by key that has no value here.
pub fn group_query(fleet_name: &str, group_by: &[String], group_key: &BTreeMap<String, String>) -> DeviceQuery {
    let mut query = DeviceQuery::new().with_owner(fleet_name);
    for key in group_by {
        match group_key.get(key) {
            Some(value) => query = query.with_label_equals(key, value),
            None => query = query.without_label(key),
        }
    }
    query
}
