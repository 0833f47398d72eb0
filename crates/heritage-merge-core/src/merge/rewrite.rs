use super::ReferencePolicy;
use crate::error::{MergeError, MergeStep};
use crate::schema::{quote_ident, DependentGroup, EntitySchema};
use crate::storage::Database;
use ahash::AHashMap;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, ToSql};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Dependent rows removed because a merge made them identical to a kept row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollapsedRow {
    pub table: String,
    pub kept: String,
    pub removed: Vec<String>,
}

/// What rewriting does to one dependent table.
#[derive(Debug, Clone)]
pub struct TableRewrite {
    pub table: String,
    pub key_column: String,
    pub columns: Vec<String>,
    /// Foreign-key values that will change from a loser to the winner.
    pub references: usize,
    pub collapsed: Vec<CollapsedRow>,
    collapse_keys: Vec<Value>,
}

/// Read-only result of planning a reference rewrite. Applying it inside the
/// merge transaction performs exactly the changes it describes.
#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    pub tables: Vec<TableRewrite>,
    pub warnings: Vec<String>,
}

impl RewritePlan {
    pub fn rewritten_counts(&self) -> BTreeMap<String, usize> {
        self.tables
            .iter()
            .map(|t| (t.table.clone(), t.references))
            .collect()
    }

    pub fn collapsed(&self) -> Vec<CollapsedRow> {
        self.tables
            .iter()
            .flat_map(|t| t.collapsed.iter().cloned())
            .collect()
    }
}

/// Hashable image of a column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CellKey {
    Null,
    Integer(i64),
    Real(u64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&Value> for CellKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => CellKey::Null,
            Value::Integer(i) => CellKey::Integer(*i),
            Value::Real(r) => CellKey::Real(r.to_bits()),
            Value::Text(s) => CellKey::Text(s.clone()),
            Value::Blob(b) => CellKey::Blob(b.clone()),
        }
    }
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn display_key(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

/// `?start, ?start+1, …` for `count` parameters.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn any_column_in(columns: &[String], list: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{} IN ({})", quote_ident(c), list))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Plan how every reference to a loser becomes a reference to the winner.
///
/// For each dependent table, rows referencing the winner or a loser are loaded
/// and the losers substituted in memory. Rows that end up identical on every
/// column except their own key, and of which at least one was rewritten, are
/// collapsed under `collapse_duplicates` (keeping a pre-existing winner row if
/// there is one, else the lowest key) or reported under `keep_all`.
pub fn plan_rewrite(
    db: &Database,
    entity: &EntitySchema,
    winner_id: &str,
    loser_ids: &[String],
    policy: ReferencePolicy,
) -> Result<RewritePlan, MergeError> {
    let step = MergeStep::Previewing;
    let groups = entity.dependent_groups();
    if groups.is_empty() {
        return Err(MergeError::integrity_at(
            step,
            &entity.table,
            None,
            format!("no dependent tables are mapped for {}; refusing to delete records", entity.table),
        ));
    }

    let mut plan = RewritePlan::default();
    for group in &groups {
        let table = plan_table(db, group, winner_id, loser_ids, policy, &mut plan.warnings)?;
        debug!(
            "Planned {} reference rewrites and {} collapses in {}",
            table.references,
            table.collapse_keys.len(),
            table.table
        );
        plan.tables.push(table);
    }
    Ok(plan)
}

fn plan_table(
    db: &Database,
    group: &DependentGroup,
    winner_id: &str,
    loser_ids: &[String],
    policy: ReferencePolicy,
    warnings: &mut Vec<String>,
) -> Result<TableRewrite, MergeError> {
    let step = MergeStep::Previewing;
    let columns = db
        .table_columns(&group.table)
        .map_err(MergeError::store(step))?;
    let position = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
    let key_index = position(&group.key_column).ok_or_else(|| {
        MergeError::integrity_at(step, &group.table, Some(group.key_column.as_str()), "key column missing")
    })?;
    let fk_indices = group
        .columns
        .iter()
        .map(|c| {
            position(c).ok_or_else(|| {
                MergeError::integrity_at(step, &group.table, Some(c.as_str()), "foreign key column missing")
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ids: Vec<&str> = std::iter::once(winner_id)
        .chain(loser_ids.iter().map(String::as_str))
        .collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {}",
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        quote_ident(&group.table),
        any_column_in(&group.columns, &placeholders(1, ids.len())),
        quote_ident(&group.key_column),
    );

    let rows: Vec<Vec<Value>> = {
        let mut stmt = db.connection().prepare(&sql).map_err(MergeError::store(step))?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                (0..columns.len())
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(MergeError::store(step))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(MergeError::store(step))?;
        rows
    };

    let mut references = 0usize;
    let mut rewritten = vec![false; rows.len()];
    let mut group_index: AHashMap<Vec<CellKey>, usize> = AHashMap::new();
    let mut identical: Vec<Vec<usize>> = Vec::new();

    for (row_idx, row) in rows.iter().enumerate() {
        let mut image: Vec<CellKey> = Vec::with_capacity(columns.len() - 1);
        for (col_idx, value) in row.iter().enumerate() {
            if col_idx == key_index {
                continue;
            }
            let is_loser_ref = fk_indices.contains(&col_idx)
                && value_as_id(value).is_some_and(|id| loser_ids.contains(&id));
            if is_loser_ref {
                references += 1;
                rewritten[row_idx] = true;
                image.push(CellKey::Text(winner_id.to_string()));
            } else {
                image.push(CellKey::from(value));
            }
        }
        match group_index.get(&image) {
            Some(&g) => identical[g].push(row_idx),
            None => {
                group_index.insert(image, identical.len());
                identical.push(vec![row_idx]);
            }
        }
    }

    let mut collapsed = Vec::new();
    let mut collapse_keys = Vec::new();
    for members in identical.iter().filter(|m| m.len() > 1) {
        if !members.iter().any(|&i| rewritten[i]) {
            continue;
        }
        let keys: Vec<String> = members.iter().map(|&i| display_key(&rows[i][key_index])).collect();
        match (policy, group.collapsible) {
            (ReferencePolicy::KeepAll, _) => {
                warnings.push(format!(
                    "{}: rows {} are identical after the merge and were kept (keep_all)",
                    group.table,
                    keys.join(", ")
                ));
            }
            (ReferencePolicy::CollapseDuplicates, false) => {
                warnings.push(format!(
                    "{}: rows {} are identical after the merge but {} rows are never collapsed",
                    group.table,
                    keys.join(", "),
                    group.table
                ));
            }
            (ReferencePolicy::CollapseDuplicates, true) => {
                let keep = members
                    .iter()
                    .copied()
                    .find(|&i| !rewritten[i])
                    .unwrap_or(members[0]);
                let removed: Vec<usize> = members.iter().copied().filter(|&i| i != keep).collect();
                let row = CollapsedRow {
                    table: group.table.clone(),
                    kept: display_key(&rows[keep][key_index]),
                    removed: removed.iter().map(|&i| display_key(&rows[i][key_index])).collect(),
                };
                warnings.push(format!(
                    "{}: collapsed duplicate row(s) {} into {}",
                    row.table,
                    row.removed.join(", "),
                    row.kept
                ));
                collapse_keys.extend(removed.iter().map(|&i| rows[i][key_index].clone()));
                collapsed.push(row);
            }
        }
    }

    Ok(TableRewrite {
        table: group.table.clone(),
        key_column: group.key_column.clone(),
        columns: group.columns.clone(),
        references,
        collapsed,
        collapse_keys,
    })
}

/// Apply a plan built inside the same transaction. Returns references
/// rewritten per table, as counted by the updates themselves.
pub fn apply_rewrite(
    db: &Database,
    plan: &RewritePlan,
    winner_id: &str,
    loser_ids: &[String],
) -> rusqlite::Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(loser_ids.len() + 1);
    params.push(&winner_id);
    params.extend(loser_ids.iter().map(|id| id as &dyn ToSql));

    for table in &plan.tables {
        let mut updated = 0usize;
        for column in &table.columns {
            let sql = format!(
                "UPDATE {} SET {} = ?1 WHERE {} IN ({})",
                quote_ident(&table.table),
                quote_ident(column),
                quote_ident(column),
                placeholders(2, loser_ids.len()),
            );
            updated += db.connection().execute(&sql, params.as_slice())?;
        }

        if !table.collapse_keys.is_empty() {
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(&table.table),
                quote_ident(&table.key_column),
            );
            let mut stmt = db.connection().prepare(&sql)?;
            for key in &table.collapse_keys {
                stmt.execute([key])?;
            }
            warn!(
                "Collapsed {} duplicate row(s) in {}",
                table.collapse_keys.len(),
                table.table
            );
        }

        counts.insert(table.table.clone(), updated);
    }
    Ok(counts)
}

/// Rows in any dependent table still referencing one of `ids`.
pub fn remaining_references(
    db: &Database,
    entity: &EntitySchema,
    ids: &[String],
) -> rusqlite::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut total = 0usize;
    for group in entity.dependent_groups() {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(&group.table),
            any_column_in(&group.columns, &placeholders(1, ids.len())),
        );
        let count: i64 = db
            .connection()
            .query_row(&sql, params_from_iter(ids.iter()), |row| row.get(0))?;
        total += count as usize;
    }
    Ok(total)
}
