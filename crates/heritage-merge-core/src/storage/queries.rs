use super::models::*;
use super::sqlite::Database;
use crate::record::{FieldValue, Fields, MergeableRecord};
use crate::schema::{quote_ident, EntitySchema};
use rusqlite::{params, OptionalExtension, Result, Row, ToSql};
use tracing::debug;

/// A foreign key declared by a table (`PRAGMA foreign_key_list`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub from_column: String,
    pub target_table: String,
}

/// `(id, scope, label)` as streamed to the duplicate finder.
#[derive(Debug, Clone)]
pub struct LabelRow {
    pub id: String,
    pub scope: Option<String>,
    pub label: String,
}

impl Database {
    // ── Repositories / Sources / Places ──────────────────────────

    pub fn insert_repository(&self, repo: &Repository) -> Result<()> {
        self.connection().execute(
            "INSERT INTO repositories (id, tree, name, address, city, state, country, notes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                repo.id,
                repo.tree,
                repo.name,
                repo.address,
                repo.city,
                repo.state,
                repo.country,
                repo.notes
            ],
        )?;
        Ok(())
    }

    pub fn insert_source(&self, source: &Source) -> Result<()> {
        self.connection().execute(
            "INSERT INTO sources \
             (id, tree, title, short_title, author, publisher, call_number, \
              repository_id, actual_text, comments) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                source.id,
                source.tree,
                source.title,
                source.short_title,
                source.author,
                source.publisher,
                source.call_number,
                source.repository_id,
                source.actual_text,
                source.comments
            ],
        )?;
        Ok(())
    }

    pub fn insert_place(&self, place: &Place) -> Result<()> {
        self.connection().execute(
            "INSERT INTO places (id, tree, name, latitude, longitude, zoom, place_level, notes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                place.id,
                place.tree,
                place.name,
                place.latitude,
                place.longitude,
                place.zoom,
                place.place_level,
                place.notes
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, id: &str) -> Result<Option<Source>> {
        self.connection()
            .query_row(
                "SELECT id, tree, title, short_title, author, publisher, call_number, \
                        repository_id, actual_text, comments \
                 FROM sources WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Source {
                        id: row.get(0)?,
                        tree: row.get(1)?,
                        title: row.get(2)?,
                        short_title: row.get(3)?,
                        author: row.get(4)?,
                        publisher: row.get(5)?,
                        call_number: row.get(6)?,
                        repository_id: row.get(7)?,
                        actual_text: row.get(8)?,
                        comments: row.get(9)?,
                    })
                },
            )
            .optional()
    }

    pub fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        self.connection()
            .query_row(
                "SELECT id, tree, name, address, city, state, country, notes \
                 FROM repositories WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Repository {
                        id: row.get(0)?,
                        tree: row.get(1)?,
                        name: row.get(2)?,
                        address: row.get(3)?,
                        city: row.get(4)?,
                        state: row.get(5)?,
                        country: row.get(6)?,
                        notes: row.get(7)?,
                    })
                },
            )
            .optional()
    }

    pub fn get_place(&self, id: &str) -> Result<Option<Place>> {
        self.connection()
            .query_row(
                "SELECT id, tree, name, latitude, longitude, zoom, place_level, notes \
                 FROM places WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Place {
                        id: row.get(0)?,
                        tree: row.get(1)?,
                        name: row.get(2)?,
                        latitude: row.get(3)?,
                        longitude: row.get(4)?,
                        zoom: row.get(5)?,
                        place_level: row.get(6)?,
                        notes: row.get(7)?,
                    })
                },
            )
            .optional()
    }

    // ── Dependent rows ───────────────────────────────────────────

    pub fn insert_citation(&self, citation: &Citation) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO citations \
             (tree, source_id, person_family_id, event_id, page, quality, \
              cite_date, cite_text, note) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                citation.tree,
                citation.source_id,
                citation.person_family_id,
                citation.event_id,
                citation.page,
                citation.quality,
                citation.cite_date,
                citation.cite_text,
                citation.note
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn insert_event(&self, event: &Event) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO events (tree, person_family_id, event_type, event_date, place_id, info) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.tree,
                event.person_family_id,
                event.event_type,
                event.event_date,
                event.place_id,
                event.info
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn insert_media_link(&self, link: &MediaLink) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO media_links (tree, media_id, place_id, sort_order) \
             VALUES (?1, ?2, ?3, ?4)",
            params![link.tree, link.media_id, link.place_id, link.sort_order],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn insert_person(&self, person: &Person) -> Result<()> {
        self.connection().execute(
            "INSERT INTO people (id, tree, name, birth_place_id, death_place_id) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                person.id,
                person.tree,
                person.name,
                person.birth_place_id,
                person.death_place_id
            ],
        )?;
        Ok(())
    }

    pub fn get_citations_for_source(&self, source_id: &str) -> Result<Vec<Citation>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, tree, source_id, person_family_id, event_id, page, quality, \
                    cite_date, cite_text, note \
             FROM citations WHERE source_id = ?1 ORDER BY id",
        )?;
        let citations = stmt
            .query_map(params![source_id], citation_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(citations)
    }

    pub fn get_events_at_place(&self, place_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, tree, person_family_id, event_type, event_date, place_id, info \
             FROM events WHERE place_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![place_id], |row| {
                Ok(Event {
                    id: row.get(0)?,
                    tree: row.get(1)?,
                    person_family_id: row.get(2)?,
                    event_type: row.get(3)?,
                    event_date: row.get(4)?,
                    place_id: row.get(5)?,
                    info: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn get_person(&self, id: &str) -> Result<Option<Person>> {
        self.connection()
            .query_row(
                "SELECT id, tree, name, birth_place_id, death_place_id FROM people WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Person {
                        id: row.get(0)?,
                        tree: row.get(1)?,
                        name: row.get(2)?,
                        birth_place_id: row.get(3)?,
                        death_place_id: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    // ── Generic mergeable records ────────────────────────────────
    //
    // Identifiers below come from a validated `EntitySchema`.

    pub fn load_record(&self, entity: &EntitySchema, id: &str) -> Result<Option<MergeableRecord>> {
        let scope_expr = entity
            .scope_column
            .as_deref()
            .map_or_else(|| "NULL".to_string(), quote_ident);
        let field_list: Vec<String> = entity.fields.iter().map(|f| quote_ident(&f.name)).collect();
        let sql = format!(
            "SELECT {}, {}{}{} FROM {} WHERE {} = ?1",
            quote_ident(&entity.id_column),
            scope_expr,
            if field_list.is_empty() { "" } else { ", " },
            field_list.join(", "),
            quote_ident(&entity.table),
            quote_ident(&entity.id_column),
        );

        self.connection()
            .query_row(&sql, params![id], |row| {
                let id: FieldValue = row.get(0)?;
                let scope: FieldValue = row.get(1)?;
                let mut fields = Fields::new();
                for (i, spec) in entity.fields.iter().enumerate() {
                    fields.set(&spec.name, row.get(i + 2)?);
                }
                Ok(MergeableRecord {
                    id: id.to_string(),
                    tree_scope: match scope {
                        FieldValue::Null => None,
                        other => Some(other.to_string()),
                    },
                    fields,
                })
            })
            .optional()
    }

    /// Write the mapped fields present in `fields` to the record. Returns rows changed.
    pub fn update_record_fields(&self, entity: &EntitySchema, id: &str, fields: &Fields) -> Result<usize> {
        let mapped: Vec<(&str, &FieldValue)> = fields
            .iter()
            .filter(|(name, _)| entity.field(name).is_some())
            .collect();
        if mapped.is_empty() {
            return Ok(0);
        }

        let assignments: Vec<String> = mapped
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", quote_ident(name), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(&entity.table),
            assignments.join(", "),
            quote_ident(&entity.id_column),
            mapped.len() + 1,
        );

        let mut values: Vec<&dyn ToSql> = mapped.iter().map(|(_, v)| *v as &dyn ToSql).collect();
        values.push(&id);
        let changed = self.connection().execute(&sql, values.as_slice())?;
        debug!("Updated {} fields on {} {}", mapped.len(), entity.table, id);
        Ok(changed)
    }

    pub fn delete_record(&self, entity: &EntitySchema, id: &str) -> Result<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&entity.table),
            quote_ident(&entity.id_column),
        );
        self.connection().execute(&sql, params![id])
    }

    /// Stream `(id, scope, label)` for every record, optionally restricted to one scope.
    /// Returns the number of rows visited.
    pub fn for_each_label<F>(&self, entity: &EntitySchema, scope: Option<&str>, mut f: F) -> Result<usize>
    where
        F: FnMut(LabelRow),
    {
        let scope_expr = entity
            .scope_column
            .as_deref()
            .map_or_else(|| "NULL".to_string(), quote_ident);
        let filter = match (&entity.scope_column, scope) {
            (Some(column), Some(_)) => format!(" WHERE {} = ?1", quote_ident(column)),
            _ => String::new(),
        };
        let sql = format!(
            "SELECT {}, {}, {} FROM {}{} ORDER BY {}",
            quote_ident(&entity.id_column),
            scope_expr,
            quote_ident(&entity.label_column),
            quote_ident(&entity.table),
            filter,
            quote_ident(&entity.id_column),
        );

        let mut stmt = self.connection().prepare(&sql)?;
        let mut rows = if filter.is_empty() {
            stmt.query([])?
        } else {
            stmt.query(params![scope])?
        };

        let mut visited = 0;
        while let Some(row) = rows.next()? {
            let id: FieldValue = row.get(0)?;
            let row_scope: FieldValue = row.get(1)?;
            let label: FieldValue = row.get(2)?;
            f(LabelRow {
                id: id.to_string(),
                scope: match row_scope {
                    FieldValue::Null => None,
                    other => Some(other.to_string()),
                },
                label: label.to_string(),
            });
            visited += 1;
        }
        Ok(visited)
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.connection().prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Column names of `table`, empty if the table does not exist.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map(params![table], |row| row.get(0))?
            .collect::<Result<Vec<String>>>()?;
        Ok(columns)
    }

    pub fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT \"table\", \"from\" FROM pragma_foreign_key_list(?1)")?;
        let keys = stmt
            .query_map(params![table], |row| {
                Ok(ForeignKey {
                    target_table: row.get(0)?,
                    from_column: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(keys)
    }
}

fn citation_from_row(row: &Row<'_>) -> Result<Citation> {
    Ok(Citation {
        id: row.get(0)?,
        tree: row.get(1)?,
        source_id: row.get(2)?,
        person_family_id: row.get(3)?,
        event_id: row.get(4)?,
        page: row.get(5)?,
        quality: row.get(6)?,
        cite_date: row.get(7)?,
        cite_text: row.get(8)?,
        note: row.get(9)?,
    })
}
