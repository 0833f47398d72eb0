use heritage_merge_core::record::FieldValue;
use heritage_merge_core::schema::{EntityType, SchemaMap};
use heritage_merge_core::storage::models::*;
use heritage_merge_core::storage::Database;

fn make_source(id: &str, title: &str) -> Source {
    Source {
        id: id.to_string(),
        tree: "main".to_string(),
        title: title.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_insert_and_get_source() {
    let db = Database::open_in_memory().unwrap();
    let mut source = make_source("S1", "Smith Family Bible");
    source.author = Some("J. Smith".to_string());
    db.insert_source(&source).unwrap();

    assert_eq!(db.get_source("S1").unwrap(), Some(source));
    assert_eq!(db.get_source("S9").unwrap(), None);
}

#[test]
fn test_citations_for_source_in_id_order() {
    let db = Database::open_in_memory().unwrap();
    db.insert_source(&make_source("S1", "Census 1850")).unwrap();
    for page in ["p. 4", "p. 2"] {
        db.insert_citation(&Citation {
            tree: "main".to_string(),
            source_id: "S1".to_string(),
            page: Some(page.to_string()),
            ..Default::default()
        })
        .unwrap();
    }

    let citations = db.get_citations_for_source("S1").unwrap();
    assert_eq!(citations.len(), 2);
    assert!(citations[0].id < citations[1].id);
    assert_eq!(citations[0].page.as_deref(), Some("p. 4"));
}

#[test]
fn test_foreign_keys_are_enforced() {
    let db = Database::open_in_memory().unwrap();
    let result = db.insert_citation(&Citation {
        tree: "main".to_string(),
        source_id: "missing".to_string(),
        ..Default::default()
    });
    assert!(result.is_err());
}

#[test]
fn test_load_record_reads_mapped_fields() {
    let db = Database::open_in_memory().unwrap();
    db.insert_place(&Place {
        id: "P1".to_string(),
        tree: "main".to_string(),
        name: "Springfield, Sangamon, Illinois".to_string(),
        latitude: Some(39.78),
        zoom: Some(8),
        ..Default::default()
    })
    .unwrap();

    let schema = SchemaMap::heritage();
    let place = schema.entity(EntityType::Place).unwrap();
    let record = db.load_record(place, "P1").unwrap().unwrap();
    assert_eq!(record.id, "P1");
    assert_eq!(record.tree_scope.as_deref(), Some("main"));
    assert_eq!(record.fields.get("latitude"), Some(&FieldValue::Real(39.78)));
    assert_eq!(record.fields.get("zoom"), Some(&FieldValue::Integer(8)));
    assert_eq!(record.fields.get("notes"), Some(&FieldValue::Null));
    assert_eq!(record.fields.len(), place.fields.len());

    assert!(db.load_record(place, "P2").unwrap().is_none());
}

#[test]
fn test_update_record_fields_ignores_unmapped() {
    let db = Database::open_in_memory().unwrap();
    db.insert_source(&make_source("S1", "Bible")).unwrap();
    let schema = SchemaMap::heritage();
    let source = schema.entity(EntityType::Source).unwrap();

    let fields = [("author", "J. Smith"), ("not_a_column", "x")]
        .into_iter()
        .collect();
    let changed = db.update_record_fields(source, "S1", &fields).unwrap();
    assert_eq!(changed, 1);
    assert_eq!(
        db.get_source("S1").unwrap().unwrap().author.as_deref(),
        Some("J. Smith")
    );
}

#[test]
fn test_for_each_label_filters_by_scope() {
    let db = Database::open_in_memory().unwrap();
    db.insert_source(&make_source("S1", "Bible")).unwrap();
    let mut other = make_source("S2", "Bible");
    other.tree = "other".to_string();
    db.insert_source(&other).unwrap();

    let schema = SchemaMap::heritage();
    let source = schema.entity(EntityType::Source).unwrap();

    let mut ids = Vec::new();
    let visited = db
        .for_each_label(source, Some("other"), |row| ids.push(row.id))
        .unwrap();
    assert_eq!(visited, 1);
    assert_eq!(ids, vec!["S2"]);

    let all = db.for_each_label(source, None, |_| {}).unwrap();
    assert_eq!(all, 2);
}

#[test]
fn test_introspection() {
    let db = Database::open_in_memory().unwrap();
    let tables = db.table_names().unwrap();
    for table in ["citations", "events", "media_links", "people", "places", "repositories", "sources"] {
        assert!(tables.contains(&table.to_string()), "missing {}", table);
    }

    let columns = db.table_columns("citations").unwrap();
    assert_eq!(columns[0], "id");
    assert!(columns.contains(&"source_id".to_string()));
    assert!(db.table_columns("no_such_table").unwrap().is_empty());

    let fks = db.foreign_keys("people").unwrap();
    assert_eq!(fks.len(), 2);
    assert!(fks.iter().all(|fk| fk.target_table == "places"));
}

#[test]
fn test_reopen_file_database_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.db");
    let path = path.to_str().unwrap();
    {
        let db = Database::open(path).unwrap();
        db.insert_source(&make_source("S1", "Bible")).unwrap();
    }
    let db = Database::open(path).unwrap();
    assert!(db.get_source("S1").unwrap().is_some());
}
