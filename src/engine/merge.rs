//! Merge of model-proposed field values into a lead

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::Error;
use crate::fields::FieldSchema;
use crate::models::{DroppedField, ExtractedData};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Keys whose stored value changed
    pub applied: Vec<String>,
    pub dropped: Vec<DroppedField>,
}

/// Apply `proposed` to `data`.
///
/// Keys outside the schema, keys an operator owns and values that fail
/// validation are dropped one by one; the rest of the proposal still merges.
/// Null or blank proposals never erase a stored value.
pub fn merge_extracted(
    data: &mut ExtractedData,
    human_edited: &BTreeSet<String>,
    schema: &FieldSchema,
    proposed: &Map<String, Value>,
) -> MergeReport {
    let mut report = MergeReport::default();

    for (key, raw) in proposed {
        let Some(def) = schema.get(key) else {
            if !raw.is_null() {
                report.dropped.push(dropped(key, "not in the active field schema"));
            }
            continue;
        };

        let value = match def.coerce(raw) {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            Err(Error::SchemaValidation { reason, .. }) => {
                report.dropped.push(dropped(key, reason));
                continue;
            }
            Err(e) => {
                report.dropped.push(dropped(key, e.to_string()));
                continue;
            }
        };

        if human_edited.contains(key) {
            if data.get(key) != Some(&value) {
                report.dropped.push(dropped(key, "edited by an operator"));
            }
            continue;
        }

        if data.get(key) == Some(&value) {
            continue;
        }
        data.insert(key.clone(), value);
        report.applied.push(key.clone());
    }

    report
}

fn dropped(field: &str, reason: impl Into<String>) -> DroppedField {
    DroppedField {
        field: field.to_string(),
        reason: reason.into(),
    }
}
