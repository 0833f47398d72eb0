use crate::analysis::normalize::{normalize_label, place_components, tokens};
use crate::analysis::similarity::{edit_ratio, place_similarity};
use crate::config::FinderSettings;
use crate::error::{MergeError, MergeStep};
use crate::progress::MergeReporter;
use crate::schema::{EntitySchema, EntityType, LabelMatching};
use crate::storage::Database;
use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

const PROGRESS_INTERVAL: usize = 1_000;

/// Records that are likely the same real-world source, repository or place.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCandidate {
    pub entity_type: EntityType,
    #[serde(rename = "recordIDs")]
    pub record_ids: Vec<String>,
    pub similarity_score: f64,
    pub matched_on: Vec<String>,
}

/// A record whose label normalizes to nothing and cannot be compared automatically.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    pub tree_scope: Option<String>,
    pub label: String,
}

/// Records sharing one normalized label within one scope.
#[derive(Debug)]
struct LabelEntry {
    normalized: String,
    components: Vec<String>,
    ids: Vec<String>,
}

/// Indexed labels of one entity table. Candidates are computed lazily from the
/// index; [`DuplicateScan::candidates`] may be iterated any number of times.
#[derive(Debug)]
pub struct DuplicateScan {
    entity_type: EntityType,
    label_field: String,
    matching: LabelMatching,
    threshold: f64,
    labels: Vec<LabelEntry>,
    pairs: Vec<(usize, usize)>,
    needs_review: Vec<ReviewItem>,
    records_scanned: usize,
}

impl DuplicateScan {
    /// Exact normalized-label groups first (score 1.0), then fuzzy pairs at or
    /// above the threshold.
    pub fn candidates(&self) -> impl Iterator<Item = DuplicateCandidate> + '_ {
        let exact = self
            .labels
            .iter()
            .filter(|entry| entry.ids.len() >= 2)
            .map(move |entry| DuplicateCandidate {
                entity_type: self.entity_type,
                record_ids: entry.ids.clone(),
                similarity_score: 1.0,
                matched_on: vec![self.label_field.clone()],
            });

        let fuzzy = self.pairs.iter().filter_map(move |&(a, b)| {
            let (left, right) = (&self.labels[a], &self.labels[b]);
            let score = self.score(left, right);
            if score < self.threshold {
                return None;
            }
            let mut ids: Vec<String> = left.ids.iter().chain(&right.ids).cloned().collect();
            ids.sort();
            ids.dedup();
            Some(DuplicateCandidate {
                entity_type: self.entity_type,
                record_ids: ids,
                similarity_score: score,
                matched_on: vec![self.label_field.clone()],
            })
        });

        exact.chain(fuzzy)
    }

    pub fn needs_review(&self) -> &[ReviewItem] {
        &self.needs_review
    }

    pub fn records_scanned(&self) -> usize {
        self.records_scanned
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, a: &LabelEntry, b: &LabelEntry) -> f64 {
        match self.matching {
            LabelMatching::Flat => edit_ratio(&a.normalized, &b.normalized),
            LabelMatching::Hierarchical => place_similarity(&a.components, &b.components),
        }
    }
}

/// Index the labels of `entity` and prepare candidate pairs.
///
/// 1. Stream `(id, scope, label)` rows and group them by normalized label
///    (per scope unless `cross_scope` is set); empty labels go to review
/// 2. Build an inverted index of tokens and token trigrams → labels
///    (locality component only for places)
/// 3. Skip keys shared by more than `max_token_frequency` labels (noise)
/// 4. Labels sharing a remaining key become candidate pairs, scored on demand
pub fn find_duplicates(
    db: &Database,
    entity_type: EntityType,
    entity: &EntitySchema,
    scope: Option<&str>,
    threshold: f64,
    settings: &FinderSettings,
    reporter: &dyn MergeReporter,
) -> Result<DuplicateScan, MergeError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(MergeError::invalid(
            MergeStep::Finding,
            format!("similarity threshold must be within [0, 1], got {}", threshold),
        ));
    }
    info!(
        "Finding duplicate {} records (threshold={:.2}, scope={:?})...",
        entity_type, threshold, scope
    );
    let start = Instant::now();

    let mut index: AHashMap<(Option<String>, String), usize> = AHashMap::new();
    let mut label_scopes: Vec<Option<String>> = Vec::new();
    let mut labels: Vec<LabelEntry> = Vec::new();
    let mut needs_review: Vec<ReviewItem> = Vec::new();
    let mut visited = 0usize;

    let records_scanned = db
        .for_each_label(entity, scope, |row| {
            visited += 1;
            if visited % PROGRESS_INTERVAL == 0 {
                reporter.on_labels_indexed(visited);
            }

            let normalized = normalize_label(&row.label);
            if normalized.is_empty() {
                needs_review.push(ReviewItem {
                    id: row.id,
                    tree_scope: row.scope,
                    label: row.label,
                });
                return;
            }

            let scope_key = if settings.cross_scope { None } else { row.scope };
            let key = (scope_key, normalized);
            match index.get(&key) {
                Some(&i) => labels[i].ids.push(row.id),
                None => {
                    let components = match entity.label_matching {
                        LabelMatching::Flat => Vec::new(),
                        LabelMatching::Hierarchical => place_components(&row.label),
                    };
                    labels.push(LabelEntry {
                        normalized: key.1.clone(),
                        components,
                        ids: vec![row.id],
                    });
                    label_scopes.push(key.0.clone());
                    index.insert(key, labels.len() - 1);
                }
            }
        })
        .map_err(MergeError::store(MergeStep::Finding))?;
    reporter.on_labels_indexed(records_scanned);

    let (pair_set, noisy_keys) =
        candidate_pairs(&labels, &label_scopes, entity.label_matching, settings);
    let mut pairs: Vec<(usize, usize)> = pair_set.into_iter().collect();
    pairs.sort_unstable();

    debug!(
        "{} labels, {} candidate pairs, {} noisy keys skipped, {} records need review",
        labels.len(),
        pairs.len(),
        noisy_keys,
        needs_review.len()
    );
    reporter.on_candidates_ready(labels.len(), pairs.len(), start.elapsed().as_secs_f64());

    Ok(DuplicateScan {
        entity_type,
        label_field: entity.label_column.clone(),
        matching: entity.label_matching,
        threshold,
        labels,
        pairs,
        needs_review,
        records_scanned,
    })
}

/// Score two raw labels the way the finder scores candidate pairs.
pub fn label_similarity(matching: LabelMatching, a: &str, b: &str) -> f64 {
    match matching {
        LabelMatching::Flat => edit_ratio(&normalize_label(a), &normalize_label(b)),
        LabelMatching::Hierarchical => place_similarity(&place_components(a), &place_components(b)),
    }
}

/// Blocking key of the inverted index. Whole tokens pair labels sharing a
/// word; trigrams of each token (padded with `#` at both ends) pair labels
/// whose words differ by a typo.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockKey<'a> {
    Token(&'a str),
    Gram(String),
}

fn token_grams(token: &str) -> impl Iterator<Item = String> {
    let padded: Vec<char> = std::iter::once('#')
        .chain(token.chars())
        .chain(std::iter::once('#'))
        .collect();
    let grams: Vec<String> = padded.windows(3).map(|w| w.iter().collect()).collect();
    grams.into_iter()
}

/// Pairs of label indices (lower first) sharing at least one non-noisy key
/// within the same scope.
fn candidate_pairs(
    labels: &[LabelEntry],
    label_scopes: &[Option<String>],
    matching: LabelMatching,
    settings: &FinderSettings,
) -> (AHashSet<(usize, usize)>, usize) {
    let mut inverted: AHashMap<(Option<&str>, BlockKey<'_>), Vec<usize>> = AHashMap::new();
    for (i, entry) in labels.iter().enumerate() {
        let source = match matching {
            LabelMatching::Flat => entry.normalized.as_str(),
            LabelMatching::Hierarchical => entry
                .components
                .first()
                .map_or(entry.normalized.as_str(), String::as_str),
        };
        let mut keys: AHashSet<BlockKey<'_>> = AHashSet::new();
        for token in tokens(source) {
            keys.insert(BlockKey::Token(token));
            keys.extend(token_grams(token).map(BlockKey::Gram));
        }
        for key in keys {
            inverted
                .entry((label_scopes[i].as_deref(), key))
                .or_default()
                .push(i);
        }
    }

    let mut pairs: AHashSet<(usize, usize)> = AHashSet::new();
    let mut noisy_keys = 0usize;
    for label_ids in inverted.values() {
        if label_ids.len() > settings.max_token_frequency {
            noisy_keys += 1;
            continue;
        }
        for i in 0..label_ids.len() {
            for j in (i + 1)..label_ids.len() {
                let (a, b) = if label_ids[i] < label_ids[j] {
                    (label_ids[i], label_ids[j])
                } else {
                    (label_ids[j], label_ids[i])
                };
                pairs.insert((a, b));
            }
        }
    }
    (pairs, noisy_keys)
}
