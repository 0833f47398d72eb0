use heritage_merge_core::schema::{DependentTable, EntityType, SchemaMap};
use heritage_merge_core::storage::Database;
use heritage_merge_core::{AppConfig, ErrorKind, MergeEngine, MergeError, MergeStep};

#[test]
fn test_heritage_mapping_matches_bundled_schema() {
    let db = Database::open_in_memory().unwrap();
    SchemaMap::heritage().validate(&db).unwrap();
}

#[test]
fn test_unmapped_foreign_key_is_an_integrity_error() {
    let db = Database::open_in_memory().unwrap();
    db.connection()
        .execute_batch(
            "CREATE TABLE source_notes (
                 id INTEGER PRIMARY KEY,
                 source_id TEXT REFERENCES sources(id),
                 body TEXT
             );",
        )
        .unwrap();

    let err = MergeEngine::new(db, SchemaMap::heritage(), &AppConfig::default())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ReferenceIntegrityError);
    assert_eq!(err.step(), MergeStep::SchemaCheck);
    assert!(!err.is_retryable());
    match err {
        MergeError::ReferenceIntegrity { table, column, .. } => {
            assert_eq!(table.as_deref(), Some("source_notes"));
            assert_eq!(column.as_deref(), Some("source_id"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_mapping_the_new_table_fixes_validation() {
    let db = Database::open_in_memory().unwrap();
    db.connection()
        .execute_batch(
            "CREATE TABLE source_notes (
                 id INTEGER PRIMARY KEY,
                 source_id TEXT REFERENCES sources(id),
                 body TEXT
             );
             INSERT INTO sources (id, tree, title) VALUES ('S1', 'main', 'Bible'), ('S2', 'main', 'Bible');
             INSERT INTO source_notes (source_id, body) VALUES ('S2', 'rebound 1902');",
        )
        .unwrap();

    let mut schema = SchemaMap::heritage();
    schema
        .entities
        .get_mut(&EntityType::Source)
        .unwrap()
        .dependents
        .push(DependentTable {
            table: "source_notes".to_string(),
            key_column: "id".to_string(),
            foreign_key_column: "source_id".to_string(),
            collapsible: true,
        });

    let engine = MergeEngine::new(db, schema, &AppConfig::default()).unwrap();
    let report = engine
        .execute(&heritage_merge_core::MergeRequest::new(EntityType::Source, "S1", ["S2"]))
        .unwrap();
    assert_eq!(report.rewritten_counts.get("source_notes"), Some(&1));
    assert_eq!(report.rewritten_counts.get("citations"), Some(&0));
}

#[test]
fn test_missing_column_rejected() {
    let db = Database::open_in_memory().unwrap();
    let mut schema = SchemaMap::heritage();
    schema
        .entities
        .get_mut(&EntityType::Place)
        .unwrap()
        .fields
        .push(heritage_merge_core::schema::FieldSpec {
            name: "elevation".to_string(),
            kind: Default::default(),
        });

    let err = schema.validate(&db).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReferenceIntegrityError);
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn test_non_identifier_table_rejected() {
    let db = Database::open_in_memory().unwrap();
    let mut schema = SchemaMap::heritage();
    schema.entities.get_mut(&EntityType::Repository).unwrap().table =
        "repositories; DROP TABLE sources".to_string();
    let err = schema.validate(&db).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReferenceIntegrityError);
    assert!(err.to_string().contains("identifier"));
}

#[test]
fn test_missing_entity_mapping_is_integrity_error() {
    let db = Database::open_in_memory().unwrap();
    let mut schema = SchemaMap::heritage();
    schema.entities.remove(&EntityType::Repository);
    // sources.repository_id now references an unmapped entity table, which is fine
    // for validation: nothing will ever delete repositories.
    let engine = MergeEngine::new(db, schema, &AppConfig::default()).unwrap();

    let err = engine
        .preview(&heritage_merge_core::MergeRequest::new(EntityType::Repository, "R1", ["R2"]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReferenceIntegrityError);
}

#[test]
fn test_schema_map_from_toml_config() {
    let toml = r#"
        [schema.entities.source]
        table = "sources"
        id_column = "id"
        scope_column = "tree"
        label_column = "title"
        fields = [{ name = "title" }, { name = "call_number", kind = "singular" }]
        dependents = [{ table = "citations", key_column = "id", foreign_key_column = "source_id" }]
    "#;
    let config: AppConfig = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap();

    let schema = config.schema.unwrap();
    let source = schema.entity(EntityType::Source).unwrap();
    assert_eq!(source.fields.len(), 2);
    assert!(source.dependents[0].collapsible);
    assert!(schema.entity(EntityType::Place).is_err());
}
