//! Typed mapping of mergeable entity types to their tables, fields and the
//! tables that hold foreign keys to them.
//!
//! Table and column names only ever reach SQL through this mapping, after
//! [`SchemaMap::validate`] has checked them against the live database.

use crate::error::{MergeError, MergeStep};
use crate::storage::Database;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Source,
    Repository,
    Place,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Source, EntityType::Repository, EntityType::Place];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Source => "source",
            EntityType::Repository => "repository",
            EntityType::Place => "place",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source" | "sources" => Ok(EntityType::Source),
            "repository" | "repositories" | "repo" => Ok(EntityType::Repository),
            "place" | "places" => Ok(EntityType::Place),
            other => Err(format!(
                "unknown entity type '{}' (expected source, repository or place)",
                other
            )),
        }
    }
}

/// How the reconciler treats a field under `merge_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text; distinct values may be concatenated.
    #[default]
    Text,
    /// Single-valued (codes, coordinates, foreign keys); never concatenated.
    Singular,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
}

/// How the duplicate finder compares primary labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMatching {
    #[default]
    Flat,
    /// Comma-separated components, most specific first ("Springfield, Sangamon, Illinois").
    Hierarchical,
}

/// One foreign-key column in a table that references an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentTable {
    pub table: String,
    pub key_column: String,
    pub foreign_key_column: String,
    /// Whether rows made identical by a merge may be collapsed.
    #[serde(default = "default_true")]
    pub collapsible: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub table: String,
    pub id_column: String,
    #[serde(default)]
    pub scope_column: Option<String>,
    pub label_column: String,
    #[serde(default)]
    pub label_matching: LabelMatching,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub dependents: Vec<DependentTable>,
}

/// All foreign-key columns of one dependent table that point at the same entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentGroup {
    pub table: String,
    pub key_column: String,
    pub columns: Vec<String>,
    pub collapsible: bool,
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_kind(&self, name: &str) -> FieldKind {
        self.field(name).map_or(FieldKind::Singular, |f| f.kind)
    }

    /// Dependents grouped by table, in declaration order.
    pub fn dependent_groups(&self) -> Vec<DependentGroup> {
        let mut groups: Vec<DependentGroup> = Vec::new();
        for dep in &self.dependents {
            match groups.iter_mut().find(|g| g.table == dep.table) {
                Some(group) => {
                    if !group.columns.contains(&dep.foreign_key_column) {
                        group.columns.push(dep.foreign_key_column.clone());
                    }
                    group.collapsible &= dep.collapsible;
                }
                None => groups.push(DependentGroup {
                    table: dep.table.clone(),
                    key_column: dep.key_column.clone(),
                    columns: vec![dep.foreign_key_column.clone()],
                    collapsible: dep.collapsible,
                }),
            }
        }
        groups
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMap {
    pub entities: BTreeMap<EntityType, EntitySchema>,
}

impl Default for SchemaMap {
    fn default() -> Self {
        Self::heritage()
    }
}

fn text(name: &str) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        kind: FieldKind::Text,
    }
}

fn singular(name: &str) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        kind: FieldKind::Singular,
    }
}

fn dependent(table: &str, key_column: &str, foreign_key_column: &str, collapsible: bool) -> DependentTable {
    DependentTable {
        table: table.to_string(),
        key_column: key_column.to_string(),
        foreign_key_column: foreign_key_column.to_string(),
        collapsible,
    }
}

impl SchemaMap {
    /// Mapping for the bundled HeritagePress tables (see `storage/schema.sql`).
    pub fn heritage() -> Self {
        let mut entities = BTreeMap::new();

        entities.insert(
            EntityType::Source,
            EntitySchema {
                table: "sources".to_string(),
                id_column: "id".to_string(),
                scope_column: Some("tree".to_string()),
                label_column: "title".to_string(),
                label_matching: LabelMatching::Flat,
                fields: vec![
                    text("title"),
                    text("short_title"),
                    text("author"),
                    text("publisher"),
                    singular("call_number"),
                    singular("repository_id"),
                    text("actual_text"),
                    text("comments"),
                ],
                dependents: vec![dependent("citations", "id", "source_id", true)],
            },
        );

        // Sources are mergeable records themselves; merging repositories must
        // never delete one just because two now look alike.
        entities.insert(
            EntityType::Repository,
            EntitySchema {
                table: "repositories".to_string(),
                id_column: "id".to_string(),
                scope_column: Some("tree".to_string()),
                label_column: "name".to_string(),
                label_matching: LabelMatching::Flat,
                fields: vec![
                    text("name"),
                    text("address"),
                    singular("city"),
                    singular("state"),
                    singular("country"),
                    text("notes"),
                ],
                dependents: vec![dependent("sources", "id", "repository_id", false)],
            },
        );

        entities.insert(
            EntityType::Place,
            EntitySchema {
                table: "places".to_string(),
                id_column: "id".to_string(),
                scope_column: Some("tree".to_string()),
                label_column: "name".to_string(),
                label_matching: LabelMatching::Hierarchical,
                fields: vec![
                    singular("name"),
                    singular("latitude"),
                    singular("longitude"),
                    singular("zoom"),
                    singular("place_level"),
                    text("notes"),
                ],
                dependents: vec![
                    dependent("events", "id", "place_id", true),
                    dependent("media_links", "id", "place_id", true),
                    dependent("people", "id", "birth_place_id", false),
                    dependent("people", "id", "death_place_id", false),
                ],
            },
        );

        SchemaMap { entities }
    }

    pub fn entity(&self, entity_type: EntityType) -> Result<&EntitySchema, MergeError> {
        self.entities.get(&entity_type).ok_or_else(|| {
            MergeError::integrity(
                MergeStep::Validating,
                format!("no schema mapping for entity type '{}'", entity_type),
            )
        })
    }

    /// Check every mapped table and column against the database, and that every
    /// foreign key the database declares against an entity table is mapped.
    pub fn validate(&self, db: &Database) -> Result<(), MergeError> {
        let step = MergeStep::SchemaCheck;

        for (entity_type, entity) in &self.entities {
            let columns = existing_columns(db, &entity.table)?;
            let mut required = vec![&entity.id_column, &entity.label_column];
            required.extend(entity.scope_column.as_ref());
            required.extend(entity.fields.iter().map(|f| &f.name));
            for column in required {
                require_column(&entity.table, &columns, column)?;
            }

            for dep in &entity.dependents {
                let dep_columns = existing_columns(db, &dep.table)?;
                require_column(&dep.table, &dep_columns, &dep.key_column)?;
                require_column(&dep.table, &dep_columns, &dep.foreign_key_column)?;
                if dep.key_column == dep.foreign_key_column {
                    return Err(MergeError::integrity_at(
                        step,
                        &dep.table,
                        Some(dep.foreign_key_column.as_str()),
                        "foreign key column cannot also be the row key",
                    ));
                }
            }
            debug!(
                "Schema mapping for {} ({}) checked: {} fields, {} dependents",
                entity_type,
                entity.table,
                entity.fields.len(),
                entity.dependents.len()
            );
        }

        // A foreign key the mapping does not know about would be orphaned when
        // a loser is deleted.
        let tables = db.table_names().map_err(MergeError::store(step))?;
        for table in &tables {
            for fk in db.foreign_keys(table).map_err(MergeError::store(step))? {
                for entity in self.entities.values() {
                    if !fk.target_table.eq_ignore_ascii_case(&entity.table) {
                        continue;
                    }
                    let mapped = entity.dependents.iter().any(|d| {
                        d.table.eq_ignore_ascii_case(table)
                            && d.foreign_key_column.eq_ignore_ascii_case(&fk.from_column)
                    });
                    if !mapped {
                        return Err(MergeError::integrity_at(
                            step,
                            table,
                            Some(fk.from_column.as_str()),
                            format!(
                                "{}.{} references {} but is not mapped as a dependent",
                                table, fk.from_column, entity.table
                            ),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

fn existing_columns(db: &Database, table: &str) -> Result<Vec<String>, MergeError> {
    let step = MergeStep::SchemaCheck;
    if !is_identifier(table) {
        return Err(MergeError::integrity_at(step, table, None, "not a plain SQL identifier"));
    }
    let columns = db.table_columns(table).map_err(MergeError::store(step))?;
    if columns.is_empty() {
        return Err(MergeError::integrity_at(step, table, None, "table does not exist"));
    }
    Ok(columns)
}

fn require_column(table: &str, columns: &[String], column: &str) -> Result<(), MergeError> {
    let step = MergeStep::SchemaCheck;
    if !is_identifier(column) {
        return Err(MergeError::integrity_at(step, table, Some(column), "not a plain SQL identifier"));
    }
    if !columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
        return Err(MergeError::integrity_at(step, table, Some(column), "column does not exist"));
    }
    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
