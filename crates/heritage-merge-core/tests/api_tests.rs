use heritage_merge_core::api::{handle_invocation, handle_json, MergeInvocation, MergeResponse};
use heritage_merge_core::merge::{FieldPolicy, ReferencePolicy};
use heritage_merge_core::storage::models::*;
use heritage_merge_core::storage::Database;
use heritage_merge_core::{AppConfig, EntityType, ErrorKind, MergeEngine, SchemaMap};
use serde_json::{json, Value};

fn engine() -> MergeEngine {
    let db = Database::open_in_memory().unwrap();
    for (id, title, author) in [
        ("S1", "Smith Family Bible", ""),
        ("S2", "Smith Family Bible", "J. Smith"),
    ] {
        db.insert_source(&Source {
            id: id.to_string(),
            tree: "main".to_string(),
            title: title.to_string(),
            author: Some(author.to_string()),
            ..Default::default()
        })
        .unwrap();
        db.insert_citation(&Citation {
            tree: "main".to_string(),
            source_id: id.to_string(),
            person_family_id: Some("I1".to_string()),
            page: Some("p. 12".to_string()),
            ..Default::default()
        })
        .unwrap();
    }
    MergeEngine::new(db, SchemaMap::heritage(), &AppConfig::default()).unwrap()
}

fn run(engine: &MergeEngine, invocation: Value) -> Value {
    let output = handle_json(engine, &invocation.to_string()).unwrap();
    serde_json::from_str(&output).unwrap()
}

#[test]
fn test_invocation_defaults() {
    let invocation: MergeInvocation = serde_json::from_value(json!({
        "entityType": "source",
        "winnerID": "S1",
        "loserIDs": ["S2"]
    }))
    .unwrap();
    assert_eq!(invocation.entity_type, EntityType::Source);
    assert_eq!(invocation.field_policy, FieldPolicy::KeepWinner);
    assert_eq!(invocation.reference_policy, ReferencePolicy::KeepAll);
    assert!(!invocation.dry_run);
    assert!(!invocation.allow_cross_scope);
    assert!(invocation.field_overrides.is_empty());
}

#[test]
fn test_dry_run_returns_preview_report() {
    let engine = engine();
    let response = run(
        &engine,
        json!({
            "entityType": "source",
            "winnerID": "S1",
            "loserIDs": ["S2"],
            "fieldPolicy": "fill_empty",
            "referencePolicy": "collapse_duplicates",
            "dryRun": true
        }),
    );

    assert_eq!(response["committed"], false);
    assert_eq!(response["winnerID"], "S1");
    assert_eq!(response["rewrittenCounts"], json!({ "citations": 1 }));
    assert_eq!(response["finalFields"]["author"], "J. Smith");
    assert_eq!(response["deletedIDs"], json!(["S2"]));
    assert_eq!(response["collapsed"][0]["table"], "citations");
    assert!(response.get("executedAt").is_none());
    assert!(engine.database().get_source("S2").unwrap().is_some());
}

#[test]
fn test_execute_returns_committed_report() {
    let engine = engine();
    let invocation: MergeInvocation = serde_json::from_value(json!({
        "entityType": "source",
        "winnerID": "S1",
        "loserIDs": ["S2"],
        "fieldOverrides": { "author": "S2" }
    }))
    .unwrap();

    let response = handle_invocation(&engine, &invocation);
    assert!(response.is_success());
    let report = response.report().unwrap();
    assert!(report.committed);
    assert_eq!(
        engine.database().get_source("S1").unwrap().unwrap().author.as_deref(),
        Some("J. Smith")
    );
}

#[test]
fn test_errors_carry_kind_step_and_state() {
    let engine = engine();
    let response = run(
        &engine,
        json!({
            "entityType": "source",
            "winnerID": "S1",
            "loserIDs": ["S1"]
        }),
    );
    assert_eq!(response["errorKind"], "InvalidMergeRequest");
    assert_eq!(response["details"]["step"], "validating");
    assert_eq!(response["details"]["state"], "rejected");
    assert_eq!(response["details"]["retryable"], false);
    assert!(response["message"].as_str().unwrap().contains("itself"));
}

#[test]
fn test_malformed_json_is_invalid_request() {
    let engine = engine();
    let output = handle_json(&engine, r#"{ "entityType": "person", "winnerID": "I1" }"#).unwrap();
    let response: Value = serde_json::from_str(&output).unwrap();
    assert_eq!(response["errorKind"], "InvalidMergeRequest");

    let output = handle_json(&engine, "not json").unwrap();
    let response: Value = serde_json::from_str(&output).unwrap();
    assert_eq!(response["errorKind"], "InvalidMergeRequest");
}

#[test]
fn test_response_accessors() {
    let engine = engine();
    let invocation = MergeInvocation {
        entity_type: EntityType::Place,
        winner_id: "P1".to_string(),
        loser_ids: vec!["P2".to_string()],
        field_policy: FieldPolicy::KeepWinner,
        reference_policy: ReferencePolicy::KeepAll,
        dry_run: true,
        allow_cross_scope: false,
        field_overrides: Default::default(),
    };
    let response = handle_invocation(&engine, &invocation);
    assert!(!response.is_success());
    assert!(response.report().is_none());
    let error = response.error().unwrap();
    assert_eq!(error.error_kind, ErrorKind::InvalidMergeRequest);
    assert!(matches!(response, MergeResponse::Error(_)));
}
