//! Shared answer cache and oracle-call budget.
//!
//! Strategy: every oracle answer is cached under its composite
//! (template, transcript, question, context-kind) key. The hot layer is a
//! `DashMap` - the only mutable state shared across evaluation workers, and
//! writes are idempotent so atomic map insertion is all the locking needed.
//! An optional persistent layer in redb lets a resumed run reuse every answer
//! already paid for, mirroring the skip-if-already-computed discipline of the
//! original pipeline.
//!
//! Cache structure:
//! - Database: `<run_dir>/answers.redb`
//! - Key: `"{template}|{transcript}|{question}|{context}"`
//! - Value: bincode-serialized `AnswerDistribution`

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};

use crate::types::{AnswerDistribution, AnswerKey};

const ANSWERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("answers");

/// Global oracle-call budget, shared by reference across workers.
///
/// `try_charge` is the single gate in front of every real oracle call;
/// once it starts refusing, the controller winds the run down as `Exhausted`.
/// In-flight overshoot is bounded by the worker-pool size.
#[derive(Debug)]
pub struct BudgetMeter {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl BudgetMeter {
    pub fn new(limit: Option<usize>) -> Self {
        BudgetMeter {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Reserve one oracle call. Returns false when the budget is spent.
    pub fn try_charge(&self) -> bool {
        match self.limit {
            None => {
                self.used.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(limit) => self
                .used
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    if used < limit {
                        Some(used + 1)
                    } else {
                        None
                    }
                })
                .is_ok(),
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn exhausted(&self) -> bool {
        matches!(self.limit, Some(limit) if self.used() >= limit)
    }
}

/// Two-layer answer cache: DashMap in front, optional redb behind.
pub struct AnswerCache {
    hot: DashMap<AnswerKey, AnswerDistribution>,
    db: Option<Database>,
}

impl AnswerCache {
    /// Purely in-memory cache (tests, one-shot runs).
    pub fn in_memory() -> Self {
        AnswerCache {
            hot: DashMap::new(),
            db: None,
        }
    }

    /// Open or create the persistent cache at `<dir>/answers.redb`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create cache directory {}", dir.display()))?;
        let db_path = dir.join("answers.redb");
        let db = Database::create(&db_path)
            .with_context(|| format!("open cache database {}", db_path.display()))?;
        Ok(AnswerCache {
            hot: DashMap::new(),
            db: Some(db),
        })
    }

    fn storage_key(key: &AnswerKey) -> String {
        format!(
            "{}|{}|{}|{}",
            key.template_id,
            key.transcript_id,
            key.question_id,
            key.context.as_str()
        )
    }

    /// Look up an answer, promoting persistent hits into the hot layer.
    pub fn get(&self, key: &AnswerKey) -> Option<AnswerDistribution> {
        if let Some(hit) = self.hot.get(key) {
            return Some(hit.clone());
        }

        let db = self.db.as_ref()?;
        let storage_key = Self::storage_key(key);
        let read = db.begin_read().ok()?;
        let table = read.open_table(ANSWERS_TABLE).ok()?;
        let bytes = table.get(storage_key.as_str()).ok()??;
        let dist: AnswerDistribution = bincode::deserialize(bytes.value()).ok()?;
        self.hot.insert(key.clone(), dist.clone());
        Some(dist)
    }

    /// Insert an answer. Idempotent: re-inserting an equivalent value is
    /// safe, and persistence failures degrade to in-memory-only.
    pub fn put(&self, key: AnswerKey, dist: AnswerDistribution) {
        if let Some(db) = self.db.as_ref() {
            let _ = Self::persist(db, &key, &dist);
        }
        self.hot.insert(key, dist);
    }

    fn persist(db: &Database, key: &AnswerKey, dist: &AnswerDistribution) -> Result<()> {
        let bytes = bincode::serialize(dist).context("serialize answer")?;
        let storage_key = Self::storage_key(key);
        let write = db.begin_write()?;
        {
            let mut table = write.open_table(ANSWERS_TABLE)?;
            table.insert(storage_key.as_str(), bytes.as_slice())?;
        }
        write.commit()?;
        Ok(())
    }

    /// Number of answers in the hot layer.
    pub fn len(&self) -> usize {
        self.hot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(probs: &[f64]) -> AnswerDistribution {
        AnswerDistribution::from_probs(probs).unwrap()
    }

    #[test]
    fn test_meter_unlimited() {
        let meter = BudgetMeter::unlimited();
        for _ in 0..100 {
            assert!(meter.try_charge());
        }
        assert_eq!(meter.used(), 100);
        assert!(!meter.exhausted());
    }

    #[test]
    fn test_meter_limit() {
        let meter = BudgetMeter::new(Some(3));
        assert!(meter.try_charge());
        assert!(meter.try_charge());
        assert!(meter.try_charge());
        assert!(!meter.try_charge(), "fourth charge must be refused");
        assert_eq!(meter.used(), 3);
        assert!(meter.exhausted());
    }

    #[test]
    fn test_in_memory_roundtrip() {
        let cache = AnswerCache::in_memory();
        let key = AnswerKey::template("t1", "p1", "q1");
        assert!(cache.get(&key).is_none());

        cache.put(key.clone(), dist(&[0.5, 0.5]));
        let hit = cache.get(&key).unwrap();
        assert!((hit.probs()[0] - 0.5).abs() < 1e-6);

        // Idempotent overwrite with an equivalent value
        cache.put(key.clone(), dist(&[0.5, 0.5]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_context_kinds_do_not_collide() {
        let cache = AnswerCache::in_memory();
        cache.put(AnswerKey::template("t1", "p1", "q1"), dist(&[0.9, 0.1]));
        cache.put(AnswerKey::transcript("p1", "q1"), dist(&[0.1, 0.9]));

        let template_hit = cache.get(&AnswerKey::template("t1", "p1", "q1")).unwrap();
        let transcript_hit = cache.get(&AnswerKey::transcript("p1", "q1")).unwrap();
        assert!(template_hit.probs()[0] > 0.5);
        assert!(transcript_hit.probs()[1] > 0.5);
    }

    #[test]
    fn test_persistent_roundtrip() {
        let dir = std::env::temp_dir().join(format!("evoloop_cache_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let key = AnswerKey::template("t1", "p1", "q1");
        {
            let cache = AnswerCache::open(&dir).unwrap();
            cache.put(key.clone(), dist(&[0.2, 0.8]));
        }
        // Fresh handle, cold hot-layer: must come back from redb
        {
            let cache = AnswerCache::open(&dir).unwrap();
            let hit = cache.get(&key).expect("persisted answer should survive reopen");
            assert!((hit.probs()[1] - 0.8).abs() < 1e-3);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
