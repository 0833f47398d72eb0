//! Merging duplicate sources, repositories and places.
//!
//! A merge keeps one *winner* record and deletes the *losers* after every
//! reference to them has been pointed at the winner. See [`MergeEngine`].

pub mod lock;
pub mod orchestrator;
pub mod reconcile;
pub mod rewrite;

pub use lock::{LockFailure, LockGuard, LockKey, LockTable};
pub use orchestrator::MergeEngine;
pub use reconcile::{apply_overrides, reconcile_fields};
pub use rewrite::{CollapsedRow, RewritePlan};

use crate::record::Fields;
use crate::schema::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How the winner's final field values are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    #[default]
    KeepWinner,
    FillEmpty,
    MergeAll,
}

/// What to do with dependent rows that become identical after rewriting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    #[default]
    KeepAll,
    CollapseDuplicates,
}

impl FromStr for FieldPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_winner" => Ok(FieldPolicy::KeepWinner),
            "fill_empty" => Ok(FieldPolicy::FillEmpty),
            "merge_all" => Ok(FieldPolicy::MergeAll),
            other => Err(format!(
                "unknown field policy '{}' (expected keep_winner, fill_empty or merge_all)",
                other
            )),
        }
    }
}

impl FromStr for ReferencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_all" => Ok(ReferencePolicy::KeepAll),
            "collapse_duplicates" => Ok(ReferencePolicy::CollapseDuplicates),
            other => Err(format!(
                "unknown reference policy '{}' (expected keep_all or collapse_duplicates)",
                other
            )),
        }
    }
}

/// One user-initiated merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub entity_type: EntityType,
    pub winner_id: String,
    /// Order matters for `fill_empty`: earlier losers are consulted first.
    pub loser_ids: Vec<String>,
    pub field_policy: FieldPolicy,
    pub reference_policy: ReferencePolicy,
    pub allow_cross_scope: bool,
    /// field name → id of the record (winner or loser) whose value is kept.
    pub field_overrides: BTreeMap<String, String>,
}

impl MergeRequest {
    pub fn new<I, S>(entity_type: EntityType, winner_id: &str, loser_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_type,
            winner_id: winner_id.to_string(),
            loser_ids: loser_ids.into_iter().map(Into::into).collect(),
            field_policy: FieldPolicy::default(),
            reference_policy: ReferencePolicy::default(),
            allow_cross_scope: false,
            field_overrides: BTreeMap::new(),
        }
    }

    pub fn with_field_policy(mut self, policy: FieldPolicy) -> Self {
        self.field_policy = policy;
        self
    }

    pub fn with_reference_policy(mut self, policy: ReferencePolicy) -> Self {
        self.reference_policy = policy;
        self
    }

    pub fn allow_cross_scope(mut self, allow: bool) -> Self {
        self.allow_cross_scope = allow;
        self
    }

    pub fn with_override(mut self, field: &str, record_id: &str) -> Self {
        self.field_overrides
            .insert(field.to_string(), record_id.to_string());
        self
    }
}

/// Result of a previewed (`committed == false`) or executed merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub committed: bool,
    pub entity_type: EntityType,
    #[serde(rename = "winnerID")]
    pub winner_id: String,
    /// References pointed at the winner, per dependent table.
    pub rewritten_counts: BTreeMap<String, usize>,
    pub final_fields: Fields,
    /// Losers deleted by the merge (or that would be, for a preview).
    #[serde(rename = "deletedIDs")]
    pub deleted_ids: Vec<String>,
    pub collapsed: Vec<CollapsedRow>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
}

/// Lifecycle of a merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Validating,
    Previewing,
    Executing,
    Committed,
    RolledBack,
    Rejected,
}

impl MergeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MergeState::Committed | MergeState::RolledBack | MergeState::Rejected
        )
    }

    /// Legal transitions of the merge state machine.
    pub fn can_advance_to(&self, next: MergeState) -> bool {
        use MergeState::*;
        matches!(
            (self, next),
            (Validating, Previewing)
                | (Validating, Executing)
                | (Validating, Rejected)
                | (Previewing, Executing)
                | (Previewing, Rejected)
                | (Executing, Committed)
                | (Executing, RolledBack)
                | (Executing, Rejected)
        )
    }
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeState::Validating => "validating",
            MergeState::Previewing => "previewing",
            MergeState::Executing => "executing",
            MergeState::Committed => "committed",
            MergeState::RolledBack => "rolled_back",
            MergeState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}
