use crate::config::LockMode;
use crate::schema::EntityType;
use ahash::AHashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One record taking part in a merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub entity: EntityType,
    pub id: String,
}

impl LockKey {
    pub fn new(entity: EntityType, id: &str) -> Self {
        Self {
            entity,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.id)
    }
}

/// Why a set of records could not be locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFailure {
    /// Fail-fast mode and these records were already held.
    Busy(Vec<LockKey>),
    /// Blocking mode gave up waiting.
    TimedOut { waited: Duration, held: Vec<LockKey> },
}

/// In-process registry of records held by running merges.
///
/// Merges touching disjoint record sets proceed in parallel. A merge takes all
/// of its records at once or none of them, so two merges can never deadlock
/// each other by holding one record each.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<AHashSet<LockKey>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, AHashSet<LockKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.held().contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    /// Take every key in `keys`.
    pub fn acquire(
        self: &Arc<Self>,
        keys: Vec<LockKey>,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard, LockFailure> {
        let mut keys = keys;
        keys.sort();
        keys.dedup();

        let start = Instant::now();
        let mut held = self.held();
        loop {
            let busy: Vec<LockKey> = keys.iter().filter(|k| held.contains(*k)).cloned().collect();
            if busy.is_empty() {
                held.extend(keys.iter().cloned());
                trace!("Locked {} record(s)", keys.len());
                return Ok(LockGuard {
                    table: Arc::clone(self),
                    keys,
                });
            }

            if mode == LockMode::FailFast {
                debug!("Records already locked: {:?}", busy);
                return Err(LockFailure::Busy(busy));
            }

            let waited = start.elapsed();
            let Some(remaining) = timeout.checked_sub(waited).filter(|d| !d.is_zero()) else {
                return Err(LockFailure::TimedOut { waited, held: busy });
            };
            held = self
                .released
                .wait_timeout(held, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn release(&self, keys: &[LockKey]) {
        let mut held = self.held();
        for key in keys {
            held.remove(key);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Records held by one merge; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    table: Arc<LockTable>,
    keys: Vec<LockKey>,
}

impl LockGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.keys);
        trace!("Released {} record(s)", self.keys.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn keys(ids: &[&str]) -> Vec<LockKey> {
        ids.iter().map(|id| LockKey::new(EntityType::Source, id)).collect()
    }

    #[test]
    fn test_fail_fast_reports_overlap() {
        let table = Arc::new(LockTable::new());
        let _first = table
            .acquire(keys(&["S1", "S2"]), LockMode::FailFast, Duration::from_millis(10))
            .unwrap();

        let err = table
            .acquire(keys(&["S2", "S3"]), LockMode::FailFast, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, LockFailure::Busy(keys(&["S2"])));
        // All-or-nothing: S3 was not taken.
        assert!(!table.is_locked(&LockKey::new(EntityType::Source, "S3")));
    }

    #[test]
    fn test_disjoint_sets_lock_independently() {
        let table = Arc::new(LockTable::new());
        let _a = table
            .acquire(keys(&["S1"]), LockMode::FailFast, Duration::ZERO)
            .unwrap();
        let _b = table
            .acquire(keys(&["S2"]), LockMode::FailFast, Duration::ZERO)
            .unwrap();
        assert_eq!(table.held_count(), 2);
    }

    #[test]
    fn test_guard_drop_releases() {
        let table = Arc::new(LockTable::new());
        {
            let _guard = table
                .acquire(keys(&["S1"]), LockMode::FailFast, Duration::ZERO)
                .unwrap();
            assert_eq!(table.held_count(), 1);
        }
        assert_eq!(table.held_count(), 0);
    }

    #[test]
    fn test_blocking_waits_for_release() {
        let table = Arc::new(LockTable::new());
        let guard = table
            .acquire(keys(&["S1"]), LockMode::Blocking, Duration::from_secs(1))
            .unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table
                    .acquire(keys(&["S1"]), LockMode::Blocking, Duration::from_secs(5))
                    .map(|g| g.keys().len())
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), Ok(1));
    }

    #[test]
    fn test_blocking_times_out() {
        let table = Arc::new(LockTable::new());
        let _guard = table
            .acquire(keys(&["S1"]), LockMode::Blocking, Duration::from_secs(1))
            .unwrap();
        let err = table
            .acquire(keys(&["S1"]), LockMode::Blocking, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, LockFailure::TimedOut { .. }));
    }
}
