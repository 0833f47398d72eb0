use super::lock::{LockFailure, LockKey, LockTable};
use super::reconcile::{apply_overrides, reconcile_fields};
use super::rewrite::{apply_rewrite, plan_rewrite, remaining_references, RewritePlan};
use super::{MergeReport, MergeRequest, MergeState};
use crate::analysis::{find_duplicates, label_similarity, DuplicateScan};
use crate::config::{AppConfig, FinderSettings, LockMode, MergeSettings};
use crate::error::{is_busy, Error, MergeError, MergeStep};
use crate::progress::{MergeReporter, SilentReporter};
use crate::record::{Fields, MergeableRecord};
use crate::schema::{EntitySchema, EntityType, SchemaMap};
use crate::storage::Database;
use rusqlite::{ErrorCode, Transaction, TransactionBehavior};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sequences validation, preview and execution of merges against one database
/// connection.
///
/// Engines on different threads (each with its own connection) coordinate
/// through a shared [`LockTable`]; see [`MergeEngine::with_lock_table`].
pub struct MergeEngine {
    db: Database,
    schema: SchemaMap,
    settings: MergeSettings,
    finder: FinderSettings,
    locks: Arc<LockTable>,
}

/// Everything a merge will do, computed without writing.
struct Prepared {
    winner: MergeableRecord,
    loser_ids: Vec<String>,
    plan: RewritePlan,
    final_fields: Fields,
    warnings: Vec<String>,
}

impl Prepared {
    fn report(&self, entity_type: EntityType) -> MergeReport {
        MergeReport {
            committed: false,
            entity_type,
            winner_id: self.winner.id.clone(),
            rewritten_counts: self.plan.rewritten_counts(),
            final_fields: self.final_fields.clone(),
            deleted_ids: self.loser_ids.clone(),
            collapsed: self.plan.collapsed(),
            warnings: self.warnings.clone(),
            executed_at: None,
        }
    }
}

/// State of one request, refusing illegal transitions.
struct Tracker<'a> {
    state: MergeState,
    entity_type: EntityType,
    winner_id: &'a str,
    reporter: &'a dyn MergeReporter,
}

impl<'a> Tracker<'a> {
    fn start(entity_type: EntityType, winner_id: &'a str, reporter: &'a dyn MergeReporter) -> Self {
        reporter.on_state(entity_type, winner_id, MergeState::Validating);
        Self {
            state: MergeState::Validating,
            entity_type,
            winner_id,
            reporter,
        }
    }

    fn advance(&mut self, next: MergeState) -> Result<(), MergeError> {
        if !self.state.can_advance_to(next) {
            error!("Refusing merge state transition {} -> {}", self.state, next);
            return Err(MergeError::invalid(
                MergeStep::Validating,
                format!("illegal merge state transition {} -> {}", self.state, next),
            ));
        }
        info!(
            "Merge {} {}: {} -> {}",
            self.entity_type, self.winner_id, self.state, next
        );
        self.state = next;
        self.reporter.on_state(self.entity_type, self.winner_id, next);
        Ok(())
    }

    /// Move to the terminal state implied by `err` and hand the error back.
    fn fail(&mut self, err: MergeError) -> MergeError {
        let terminal = err.terminal_state();
        if terminal == MergeState::RolledBack {
            warn!("Merge {} {} rolled back during {}: {}", self.entity_type, self.winner_id, err.step(), err);
        } else {
            info!("Merge {} {} rejected during {}: {}", self.entity_type, self.winner_id, err.step(), err);
        }
        if self.advance(terminal).is_err() {
            // Already terminal; keep the original error.
            debug!("Merge already in state {}", self.state);
        }
        err
    }
}

impl MergeEngine {
    /// Validate `schema` against `db` and build an engine.
    pub fn new(db: Database, schema: SchemaMap, config: &AppConfig) -> Result<Self, MergeError> {
        schema.validate(&db)?;
        let busy_timeout = match config.merge.lock_mode {
            LockMode::Blocking => config.merge.lock_timeout(),
            LockMode::FailFast => Duration::ZERO,
        };
        db.set_busy_timeout(busy_timeout)
            .map_err(MergeError::store(MergeStep::SchemaCheck))?;
        Ok(Self {
            db,
            schema,
            settings: config.merge.clone(),
            finder: config.finder.clone(),
            locks: Arc::new(LockTable::new()),
        })
    }

    /// Open `config.database_path` with the configured (or built-in) mapping.
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let db = Database::open(&config.database_path)?;
        let schema = config.schema.clone().unwrap_or_default();
        Ok(Self::new(db, schema, config)?)
    }

    /// Share record locks with other engines.
    pub fn with_lock_table(mut self, locks: Arc<LockTable>) -> Self {
        self.locks = locks;
        self
    }

    pub fn lock_table(&self) -> Arc<LockTable> {
        Arc::clone(&self.locks)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn schema(&self) -> &SchemaMap {
        &self.schema
    }

    // ── Duplicate finder ─────────────────────────────────────────

    /// Scan one entity table; `threshold` defaults to `finder.default_threshold`.
    pub fn find_duplicates(
        &self,
        entity_type: EntityType,
        scope: Option<&str>,
        threshold: Option<f64>,
    ) -> Result<DuplicateScan, MergeError> {
        self.find_duplicates_with(entity_type, scope, threshold, &SilentReporter)
    }

    pub fn find_duplicates_with(
        &self,
        entity_type: EntityType,
        scope: Option<&str>,
        threshold: Option<f64>,
        reporter: &dyn MergeReporter,
    ) -> Result<DuplicateScan, MergeError> {
        let entity = self.schema.entity(entity_type)?;
        find_duplicates(
            &self.db,
            entity_type,
            entity,
            scope,
            threshold.unwrap_or(self.finder.default_threshold),
            &self.finder,
            reporter,
        )
    }

    // ── Merges ───────────────────────────────────────────────────

    /// Check a request without planning it.
    pub fn validate(&self, request: &MergeRequest) -> Result<(), MergeError> {
        let (entity, loser_ids) = self.checked_request(request)?;
        self.load_participants(entity, request, &loser_ids)?;
        Ok(())
    }

    /// Dry run: what [`MergeEngine::execute`] would do right now. Never writes.
    pub fn preview(&self, request: &MergeRequest) -> Result<MergeReport, MergeError> {
        let mut tracker = Tracker::start(request.entity_type, &request.winner_id, &SilentReporter);
        self.preview_tracked(request, &mut tracker)
            .map_err(|e| tracker.fail(e))
    }

    fn preview_tracked(&self, request: &MergeRequest, tracker: &mut Tracker<'_>) -> Result<MergeReport, MergeError> {
        let (entity, loser_ids) = self.checked_request(request)?;

        // A read transaction gives every step the same snapshot; dropping it
        // rolls back, and nothing was written anyway.
        let tx = Transaction::new_unchecked(self.db.connection(), TransactionBehavior::Deferred)
            .map_err(MergeError::store(MergeStep::Previewing))?;
        let prepared = self.prepare(entity, request, loser_ids)?;
        tracker.advance(MergeState::Previewing)?;
        drop(tx);

        let report = prepared.report(request.entity_type);
        info!(
            "Preview of {} {}: {} references, {} losers, {} warnings",
            request.entity_type,
            request.winner_id,
            report.rewritten_counts.values().sum::<usize>(),
            report.deleted_ids.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    pub fn execute(&self, request: &MergeRequest) -> Result<MergeReport, MergeError> {
        self.execute_with(request, &SilentReporter)
    }

    /// Run the merge in one transaction. On any error the transaction is rolled
    /// back and the error names the step that failed.
    pub fn execute_with(
        &self,
        request: &MergeRequest,
        reporter: &dyn MergeReporter,
    ) -> Result<MergeReport, MergeError> {
        let mut tracker = Tracker::start(request.entity_type, &request.winner_id, reporter);
        self.execute_tracked(request, &mut tracker, reporter)
            .map_err(|e| tracker.fail(e))
    }

    /// `preview` when `dry_run`, else `execute`.
    pub fn run(&self, request: &MergeRequest, dry_run: bool) -> Result<MergeReport, MergeError> {
        if dry_run {
            self.preview(request)
        } else {
            self.execute(request)
        }
    }

    fn execute_tracked(
        &self,
        request: &MergeRequest,
        tracker: &mut Tracker<'_>,
        reporter: &dyn MergeReporter,
    ) -> Result<MergeReport, MergeError> {
        let (entity, loser_ids) = self.checked_request(request)?;
        let winner_id = request.winner_id.as_str();

        let keys: Vec<LockKey> = std::iter::once(winner_id)
            .chain(loser_ids.iter().map(String::as_str))
            .map(|id| LockKey::new(request.entity_type, id))
            .collect();
        let _guard = self
            .locks
            .acquire(keys, self.settings.lock_mode, self.settings.lock_timeout())
            .map_err(|failure| match failure {
                LockFailure::Busy(held) => MergeError::Conflict {
                    step: MergeStep::Locking,
                    ids: held.into_iter().map(|k| k.id).collect(),
                    reason: "records are part of another running merge".to_string(),
                },
                LockFailure::TimedOut { waited, .. } => MergeError::Timeout {
                    step: MergeStep::Locking,
                    elapsed_ms: waited.as_millis() as u64,
                },
            })?;

        let started = Instant::now();
        let deadline = started + self.settings.transaction_timeout();
        let check_deadline = |step: MergeStep| -> Result<(), MergeError> {
            if Instant::now() > deadline {
                return Err(MergeError::Timeout {
                    step,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            Ok(())
        };
        let store = |step: MergeStep| self.store_error(step, started);

        let tx = Transaction::new_unchecked(self.db.connection(), TransactionBehavior::Immediate)
            .map_err(store(MergeStep::Locking))?;
        tracker.advance(MergeState::Executing)?;

        // Fresh state under the write lock; the preview we commit to.
        let prepared = self.prepare(entity, request, loser_ids)?;
        check_deadline(MergeStep::Previewing)?;

        let step = MergeStep::RewritingReferences;
        let rewritten = apply_rewrite(&self.db, &prepared.plan, winner_id, &prepared.loser_ids)
            .map_err(store(step))?;
        if rewritten != prepared.plan.rewritten_counts() {
            return Err(MergeError::Conflict {
                step,
                ids: prepared.loser_ids.clone(),
                reason: "dependent rows changed while references were being rewritten".to_string(),
            });
        }
        for (table, count) in &rewritten {
            reporter.on_references_rewritten(table, *count);
        }
        for row in prepared.plan.collapsed() {
            reporter.on_collapse(&row);
        }
        check_deadline(step)?;

        let step = MergeStep::ReconcilingFields;
        let (winner, losers) = self
            .load_participants(entity, request, &prepared.loser_ids)
            .map_err(|e| MergeError::Conflict {
                step,
                ids: prepared.loser_ids.clone(),
                reason: e.to_string(),
            })?;
        let recomputed = self.reconcile(entity, request, &winner, &losers)?;
        if recomputed != prepared.final_fields {
            return Err(MergeError::Conflict {
                step,
                ids: std::iter::once(winner.id.clone())
                    .chain(prepared.loser_ids.iter().cloned())
                    .collect(),
                reason: "reconciled fields differ from the preview".to_string(),
            });
        }
        let changed: Fields = recomputed
            .iter()
            .filter(|(name, value)| winner.fields.get(name) != Some(*value))
            .map(|(name, value)| (name, value.clone()))
            .collect();
        if !changed.is_empty() {
            self.db
                .update_record_fields(entity, winner_id, &changed)
                .map_err(store(step))?;
            debug!("Wrote {} changed field(s) to {} {}", changed.len(), entity.table, winner_id);
        }
        check_deadline(step)?;

        let step = MergeStep::DeletingLosers;
        for loser_id in &prepared.loser_ids {
            let deleted = self
                .db
                .delete_record(entity, loser_id)
                .map_err(store(step))?;
            if deleted != 1 {
                return Err(MergeError::Conflict {
                    step,
                    ids: vec![loser_id.clone()],
                    reason: "loser disappeared before it could be deleted".to_string(),
                });
            }
        }
        check_deadline(step)?;

        let step = MergeStep::Verifying;
        let orphans = remaining_references(&self.db, entity, &prepared.loser_ids).map_err(store(step))?;
        if orphans > 0 {
            return Err(MergeError::integrity_at(
                step,
                &entity.table,
                None,
                format!("{} reference(s) to deleted records remain", orphans),
            ));
        }
        check_deadline(step)?;

        tx.commit().map_err(store(MergeStep::Committing))?;
        tracker.advance(MergeState::Committed)?;

        let mut report = prepared.report(request.entity_type);
        report.committed = true;
        report.rewritten_counts = rewritten;
        report.executed_at = Some(chrono::Utc::now().to_rfc3339());
        info!(
            "Merged {} {} <- {:?} in {:.2?} ({} references rewritten)",
            request.entity_type,
            winner_id,
            report.deleted_ids,
            started.elapsed(),
            report.rewritten_counts.values().sum::<usize>()
        );
        Ok(report)
    }

    /// Structural checks that need no store access. Returns the entity mapping
    /// and the loser ids, deduplicated in request order.
    fn checked_request(&self, request: &MergeRequest) -> Result<(&EntitySchema, Vec<String>), MergeError> {
        let step = MergeStep::Validating;
        let entity = self.schema.entity(request.entity_type)?;

        if request.winner_id.trim().is_empty() {
            return Err(MergeError::invalid(step, "winner id is empty"));
        }
        if request.loser_ids.is_empty() {
            return Err(MergeError::invalid(step, "at least one loser id is required"));
        }

        let mut loser_ids: Vec<String> = Vec::with_capacity(request.loser_ids.len());
        for id in &request.loser_ids {
            if id.trim().is_empty() {
                return Err(MergeError::invalid(step, "loser ids must not be empty"));
            }
            if *id == request.winner_id {
                return Err(MergeError::invalid(
                    step,
                    format!("{} {} cannot be merged into itself", request.entity_type, id),
                ));
            }
            if !loser_ids.contains(id) {
                loser_ids.push(id.clone());
            }
        }

        for field in request.field_overrides.keys() {
            if entity.field(field).is_none() {
                return Err(MergeError::invalid(
                    step,
                    format!("override names unknown field '{}' of {}", field, entity.table),
                ));
            }
        }
        Ok((entity, loser_ids))
    }

    /// Load the winner and losers, requiring all to exist in a compatible scope.
    fn load_participants(
        &self,
        entity: &EntitySchema,
        request: &MergeRequest,
        loser_ids: &[String],
    ) -> Result<(MergeableRecord, Vec<MergeableRecord>), MergeError> {
        let step = MergeStep::Validating;
        let load = |id: &str| -> Result<MergeableRecord, MergeError> {
            self.db
                .load_record(entity, id)
                .map_err(MergeError::store(step))?
                .ok_or_else(|| {
                    MergeError::invalid(step, format!("{} {} does not exist", request.entity_type, id))
                })
        };

        let winner = load(request.winner_id.as_str())?;
        let losers = loser_ids
            .iter()
            .map(|id| load(id.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        if !request.allow_cross_scope {
            let mismatched: Vec<&str> = losers
                .iter()
                .filter(|l| l.tree_scope != winner.tree_scope)
                .map(|l| l.id.as_str())
                .collect();
            if !mismatched.is_empty() {
                return Err(MergeError::invalid(
                    step,
                    format!(
                        "{} not in the winner's tree {:?}; set allowCrossScope to merge across trees",
                        mismatched.join(", "),
                        winner.tree_scope.as_deref().unwrap_or("")
                    ),
                ));
            }
        }
        Ok((winner, losers))
    }

    fn reconcile(
        &self,
        entity: &EntitySchema,
        request: &MergeRequest,
        winner: &MergeableRecord,
        losers: &[MergeableRecord],
    ) -> Result<Fields, MergeError> {
        let mut fields = reconcile_fields(
            winner,
            losers,
            request.field_policy,
            entity,
            &self.settings.separator,
        );
        apply_overrides(&mut fields, winner, losers, &request.field_overrides, entity)?;
        Ok(fields)
    }

    fn prepare(
        &self,
        entity: &EntitySchema,
        request: &MergeRequest,
        loser_ids: Vec<String>,
    ) -> Result<Prepared, MergeError> {
        let (winner, losers) = self.load_participants(entity, request, &loser_ids)?;
        let plan = plan_rewrite(&self.db, entity, &winner.id, &loser_ids, request.reference_policy)?;
        let final_fields = self.reconcile(entity, request, &winner, &losers)?;

        let mut warnings = plan.warnings.clone();
        let winner_label = winner
            .fields
            .get(&entity.label_column)
            .map(ToString::to_string)
            .unwrap_or_default();
        for loser in &losers {
            let label = loser
                .fields
                .get(&entity.label_column)
                .map(ToString::to_string)
                .unwrap_or_default();
            let score = label_similarity(entity.label_matching, &winner_label, &label);
            if score < self.finder.default_threshold {
                warnings.push(format!(
                    "{} {} ({:?}) scores {:.2} against the winner's {:?}",
                    request.entity_type, loser.id, label, score, winner_label
                ));
            }
        }
        if request.allow_cross_scope && losers.iter().any(|l| l.tree_scope != winner.tree_scope) {
            warnings.push("merging records from different trees".to_string());
        }

        Ok(Prepared {
            winner,
            loser_ids,
            plan,
            final_fields,
            warnings,
        })
    }

    /// Map a store error raised during execution. Busy errors mean another
    /// connection holds the write lock.
    fn store_error(&self, step: MergeStep, started: Instant) -> impl Fn(rusqlite::Error) -> MergeError {
        let lock_mode = self.settings.lock_mode;
        move |source| {
            if is_busy(&source) {
                return match lock_mode {
                    LockMode::FailFast => MergeError::Conflict {
                        step,
                        ids: Vec::new(),
                        reason: "database is locked by another writer".to_string(),
                    },
                    LockMode::Blocking => MergeError::Timeout {
                        step,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                };
            }
            if let rusqlite::Error::SqliteFailure(ref e, ref message) = source {
                if e.code == ErrorCode::ConstraintViolation {
                    return MergeError::ReferenceIntegrity {
                        step,
                        table: None,
                        column: None,
                        reason: message.clone().unwrap_or_else(|| e.to_string()),
                    };
                }
            }
            MergeError::StoreUnavailable { step, source }
        }
    }
}
