//! JSON contract for callers outside Rust (admin views, scripts).
//!
//! An invocation maps onto a [`MergeRequest`]; the response is either the
//! merge report or an error object carrying the error kind, the failing step
//! and the terminal state.

use crate::error::{ErrorObject, MergeError, MergeStep};
use crate::merge::{FieldPolicy, MergeEngine, MergeReport, MergeRequest, ReferencePolicy};
use crate::schema::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeInvocation {
    pub entity_type: EntityType,
    #[serde(rename = "winnerID")]
    pub winner_id: String,
    #[serde(rename = "loserIDs")]
    pub loser_ids: Vec<String>,
    #[serde(default)]
    pub field_policy: FieldPolicy,
    #[serde(default)]
    pub reference_policy: ReferencePolicy,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub allow_cross_scope: bool,
    #[serde(default)]
    pub field_overrides: BTreeMap<String, String>,
}

impl MergeInvocation {
    pub fn to_request(&self) -> MergeRequest {
        MergeRequest {
            entity_type: self.entity_type,
            winner_id: self.winner_id.clone(),
            loser_ids: self.loser_ids.clone(),
            field_policy: self.field_policy,
            reference_policy: self.reference_policy,
            allow_cross_scope: self.allow_cross_scope,
            field_overrides: self.field_overrides.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MergeResponse {
    Report(MergeReport),
    Error(ErrorObject),
}

impl MergeResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, MergeResponse::Report(_))
    }

    pub fn report(&self) -> Option<&MergeReport> {
        match self {
            MergeResponse::Report(report) => Some(report),
            MergeResponse::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match self {
            MergeResponse::Error(error) => Some(error),
            MergeResponse::Report(_) => None,
        }
    }
}

impl From<Result<MergeReport, MergeError>> for MergeResponse {
    fn from(result: Result<MergeReport, MergeError>) -> Self {
        match result {
            Ok(report) => MergeResponse::Report(report),
            Err(err) => MergeResponse::Error(err.to_error_object()),
        }
    }
}

pub fn handle_invocation(engine: &MergeEngine, invocation: &MergeInvocation) -> MergeResponse {
    debug!(
        "Merge invocation: {} {} <- {:?} (dry_run={})",
        invocation.entity_type, invocation.winner_id, invocation.loser_ids, invocation.dry_run
    );
    engine.run(&invocation.to_request(), invocation.dry_run).into()
}

/// Parse an invocation, run it and serialize the response. Malformed input is
/// answered with an `InvalidMergeRequest` error object.
pub fn handle_json(engine: &MergeEngine, input: &str) -> Result<String, serde_json::Error> {
    let response = match serde_json::from_str::<MergeInvocation>(input) {
        Ok(invocation) => handle_invocation(engine, &invocation),
        Err(e) => MergeResponse::Error(
            MergeError::invalid(MergeStep::Validating, format!("malformed merge invocation: {}", e))
                .to_error_object(),
        ),
    };
    serde_json::to_string_pretty(&response)
}
