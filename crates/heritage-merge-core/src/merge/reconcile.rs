use super::FieldPolicy;
use crate::error::{MergeError, MergeStep};
use crate::record::{FieldValue, Fields, MergeableRecord};
use crate::schema::{EntitySchema, FieldKind};
use std::collections::BTreeMap;

/// Compute the winner's final fields from the winner and losers.
///
/// Pure: the same inputs always yield the same mapping, which is what lets a
/// preview be re-checked right before commit. Output follows the winner's
/// field order, then any loser-only fields in loser order.
pub fn reconcile_fields(
    winner: &MergeableRecord,
    losers: &[MergeableRecord],
    policy: FieldPolicy,
    schema: &EntitySchema,
    separator: &str,
) -> Fields {
    let mut names: Vec<&str> = winner.fields.names().collect();
    for loser in losers {
        for name in loser.fields.names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    let mut result = Fields::new();
    for name in names {
        let own = winner.fields.get(name).cloned().unwrap_or(FieldValue::Null);
        let value = match policy {
            FieldPolicy::KeepWinner => own,
            FieldPolicy::FillEmpty => fill_empty(own, name, losers),
            FieldPolicy::MergeAll => match schema.field_kind(name) {
                FieldKind::Singular => own,
                FieldKind::Text => merge_text(own, name, losers, separator),
            },
        };
        result.set(name, value);
    }
    result
}

fn fill_empty(own: FieldValue, name: &str, losers: &[MergeableRecord]) -> FieldValue {
    if !own.is_empty() {
        return own;
    }
    losers
        .iter()
        .filter_map(|l| l.fields.get(name))
        .find(|v| !v.is_empty())
        .cloned()
        .unwrap_or(own)
}

fn merge_text(own: FieldValue, name: &str, losers: &[MergeableRecord], separator: &str) -> FieldValue {
    let mut distinct: Vec<String> = Vec::new();
    let candidates = std::iter::once(&own).chain(losers.iter().filter_map(|l| l.fields.get(name)));
    for value in candidates {
        if value.is_empty() {
            continue;
        }
        let text = value.to_string().trim().to_string();
        if !distinct.contains(&text) {
            distinct.push(text);
        }
    }

    match distinct.len() {
        0 => own,
        // A lone value is kept as is (including its original type).
        1 if !own.is_empty() => own,
        _ => FieldValue::Text(distinct.join(separator)),
    }
}

/// Apply per-field record choices on top of a policy result.
///
/// Every overridden field must be mapped for the entity and every chosen id
/// must be the winner or one of the losers.
pub fn apply_overrides(
    fields: &mut Fields,
    winner: &MergeableRecord,
    losers: &[MergeableRecord],
    overrides: &BTreeMap<String, String>,
    schema: &EntitySchema,
) -> Result<(), MergeError> {
    for (field, record_id) in overrides {
        if schema.field(field).is_none() {
            return Err(MergeError::invalid(
                MergeStep::Validating,
                format!("override names unknown field '{}' of {}", field, schema.table),
            ));
        }
        let record = std::iter::once(winner)
            .chain(losers)
            .find(|r| &r.id == record_id)
            .ok_or_else(|| {
                MergeError::invalid(
                    MergeStep::Validating,
                    format!(
                        "override for '{}' names record '{}', which is not part of this merge",
                        field, record_id
                    ),
                )
            })?;
        let value = record.fields.get(field).cloned().unwrap_or(FieldValue::Null);
        fields.set(field, value);
    }
    Ok(())
}
