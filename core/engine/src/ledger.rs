use chrono::{DateTime, Utc};
use para_schemas::{Category, ClassificationDecision, FeedbackCorrection, LedgerEntry, NoteId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::storage::{append_only_triggers, json_error, open_connection, to_json, ts_to_sql};

const ENTRY_COLUMNS: &str = "kind, payload";

/// Append-only store of classification decisions and user corrections.
///
/// Every operation opens its own connection. Writes for one note are
/// serialised through a per-note mutex; writes for different notes only meet
/// in SQLite's WAL writer lock.
pub struct FeedbackLedger {
    path: PathBuf,
    retry_backoff: Duration,
    note_locks: Mutex<HashMap<NoteId, Arc<Mutex<()>>>>,
}

/// Consistent read of the ledger taken inside one read transaction.
#[derive(Debug, Clone, Default)]
pub struct LedgerView {
    pub entries: Vec<LedgerEntry>,
}

/// A decision together with the correction that overrode it, if any.
#[derive(Debug, Clone, Copy)]
pub struct DecisionOutcome<'a> {
    pub decision: &'a ClassificationDecision,
    pub correction: Option<&'a FeedbackCorrection>,
}

impl DecisionOutcome<'_> {
    pub fn is_corrected(&self) -> bool {
        self.correction.is_some()
    }
}

impl LedgerView {
    pub fn decisions(&self) -> impl Iterator<Item = &ClassificationDecision> {
        self.entries.iter().filter_map(|entry| match entry {
            LedgerEntry::Decision(d) => Some(d),
            LedgerEntry::Correction(_) => None,
        })
    }

    pub fn corrections(&self) -> impl Iterator<Item = &FeedbackCorrection> {
        self.entries.iter().filter_map(|entry| match entry {
            LedgerEntry::Correction(c) => Some(c),
            LedgerEntry::Decision(_) => None,
        })
    }

    pub fn decision_count(&self) -> usize {
        self.decisions().count()
    }

    pub fn correction_count(&self) -> usize {
        self.corrections().count()
    }

    /// Pair every decision with the latest correction for the same note that
    /// falls before the note's next decision. Corrections whose decision lies
    /// outside the view are ignored.
    pub fn outcomes(&self) -> Vec<DecisionOutcome<'_>> {
        let mut outcomes: Vec<DecisionOutcome<'_>> = Vec::new();
        let mut open: HashMap<&NoteId, usize> = HashMap::new();

        for entry in &self.entries {
            match entry {
                LedgerEntry::Decision(decision) => {
                    open.insert(&decision.note_id, outcomes.len());
                    outcomes.push(DecisionOutcome {
                        decision,
                        correction: None,
                    });
                }
                LedgerEntry::Correction(correction) => {
                    if let Some(idx) = open.get(&correction.note_id) {
                        outcomes[*idx].correction = Some(correction);
                    }
                }
            }
        }

        outcomes
    }
}

impl FeedbackLedger {
    pub fn open<P: AsRef<Path>>(path: P, retry_backoff: Duration) -> Result<Self> {
        let ledger = Self {
            path: path.as_ref().to_path_buf(),
            retry_backoff,
            note_locks: Mutex::new(HashMap::new()),
        };
        ledger.init_schema()?;

        info!("Feedback ledger ready at {}", ledger.path.display());
        Ok(ledger)
    }

    fn connect(&self) -> Result<Connection> {
        Ok(open_connection(&self.path)?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ledger_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                note_id TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('decision', 'correction')),
                ts TEXT NOT NULL,
                category TEXT NOT NULL,
                confidence REAL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_note ON ledger_entries(note_id, ts, seq);
            CREATE INDEX IF NOT EXISTS idx_ledger_ts ON ledger_entries(ts, seq);",
        )?;
        conn.execute_batch(&append_only_triggers("ledger_entries"))?;
        Ok(())
    }

    /// Run `op` holding the note's mutex. The map entry is dropped again
    /// once no other writer holds or waits on it.
    fn with_note_lock<T>(&self, note_id: &NoteId, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.note_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(note_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            op()
        };

        // Clones are only handed out under the map lock, so a count of one
        // means nobody else can reach this entry.
        let mut locks = self.note_locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks.get(note_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(note_id);
        }
        result
    }

    #[cfg(test)]
    fn tracked_notes(&self) -> usize {
        self.note_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run a write, retrying once after the backoff on storage failures.
    fn with_retry<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        match op() {
            Err(EngineError::Storage(e)) => {
                warn!("Ledger {} failed ({}), retrying in {:?}", what, e, self.retry_backoff);
                std::thread::sleep(self.retry_backoff);
                op()
            }
            other => other,
        }
    }

    pub fn record_decision(&self, decision: &ClassificationDecision) -> Result<()> {
        self.with_note_lock(&decision.note_id, || self.append_decision(decision))
    }

    fn append_decision(&self, decision: &ClassificationDecision) -> Result<()> {
        let payload = to_json(&LedgerEntry::Decision(decision.clone()))?;
        self.with_retry("decision insert", || {
            let conn = self.connect()?;
            conn.execute(
                "INSERT INTO ledger_entries (note_id, kind, ts, category, confidence, payload)
                 VALUES (?1, 'decision', ?2, ?3, ?4, ?5)",
                params![
                    decision.note_id.as_str(),
                    ts_to_sql(&decision.timestamp),
                    decision.category.as_str(),
                    decision.confidence,
                    payload,
                ],
            )?;
            Ok(())
        })?;

        debug!(
            "Recorded decision for {}: {} ({:.3})",
            decision.note_id, decision.category, decision.confidence
        );
        Ok(())
    }

    /// Append a correction. Fails with `NotFound` unless a decision for the
    /// note exists at or before the correction timestamp.
    pub fn record_correction(&self, correction: &FeedbackCorrection) -> Result<()> {
        self.with_note_lock(&correction.note_id, || self.append_correction(correction))
    }

    /// Correct the note's latest decision. The decision is read and the
    /// correction appended under the same per-note lock, so a decision
    /// landing concurrently cannot leave `original_category` stale.
    pub fn correct_latest(
        &self,
        note_id: &NoteId,
        category: Category,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FeedbackCorrection> {
        self.with_note_lock(note_id, || {
            let latest = self.latest_decision(note_id)?.ok_or_else(|| {
                EngineError::NotFound(format!("no decision recorded for note {}", note_id))
            })?;

            let correction = FeedbackCorrection {
                note_id: note_id.clone(),
                original_category: latest.category,
                corrected_category: category,
                reason,
                timestamp: now.max(latest.timestamp),
            };
            self.append_correction(&correction)?;
            Ok(correction)
        })
    }

    fn append_correction(&self, correction: &FeedbackCorrection) -> Result<()> {
        let payload = to_json(&LedgerEntry::Correction(correction.clone()))?;
        let ts = ts_to_sql(&correction.timestamp);

        self.with_retry("correction insert", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let prior: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM ledger_entries
                     WHERE note_id = ?1 AND kind = 'decision' AND ts <= ?2
                     ORDER BY ts DESC, seq DESC LIMIT 1",
                    params![correction.note_id.as_str(), ts],
                    |row| row.get(0),
                )
                .optional()?;
            if prior.is_none() {
                return Err(EngineError::NotFound(format!(
                    "no decision for note {} at or before {}",
                    correction.note_id, ts
                )));
            }

            tx.execute(
                "INSERT INTO ledger_entries (note_id, kind, ts, category, confidence, payload)
                 VALUES (?1, 'correction', ?2, ?3, NULL, ?4)",
                params![
                    correction.note_id.as_str(),
                    ts,
                    correction.corrected_category.as_str(),
                    payload,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        info!(
            "Recorded correction for {}: {} -> {}",
            correction.note_id, correction.original_category, correction.corrected_category
        );
        Ok(())
    }

    /// All entries for a note, ordered by timestamp then insertion order.
    pub fn history(&self, note_id: &NoteId) -> Result<Vec<LedgerEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ledger_entries WHERE note_id = ?1 ORDER BY ts, seq",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![note_id.as_str()], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn latest_decision(&self, note_id: &NoteId) -> Result<Option<ClassificationDecision>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM ledger_entries
                     WHERE note_id = ?1 AND kind = 'decision'
                     ORDER BY ts DESC, seq DESC LIMIT 1",
                    ENTRY_COLUMNS
                ),
                params![note_id.as_str()],
                row_to_entry,
            )
            .optional()?;

        Ok(match entry {
            Some(LedgerEntry::Decision(decision)) => Some(decision),
            _ => None,
        })
    }

    pub fn all_corrections(&self, since: Option<DateTime<Utc>>) -> Result<Vec<FeedbackCorrection>> {
        let view = self.read_view(since)?;
        Ok(view.corrections().cloned().collect())
    }

    /// Snapshot of every entry at or after `since` (all time when `None`).
    pub fn read_view(&self, since: Option<DateTime<Utc>>) -> Result<LedgerView> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let lower = since.map(|ts| ts_to_sql(&ts)).unwrap_or_default();

        let entries = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM ledger_entries WHERE ts >= ?1 ORDER BY ts, seq",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![lower], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.commit()?;

        Ok(LedgerView { entries })
    }

    pub fn count_entries(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        debug!("Ledger WAL checkpointed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LedgerEntry> {
    let payload: String = row.get(1)?;
    serde_json::from_str(&payload).map_err(json_error)
}
