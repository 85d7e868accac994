use chrono::{DateTime, Utc};
use para_schemas::{
    generate_adjustment_id, Adjustment, AdjustmentId, AppliedAdjustment, FactorWeightTable,
    TunableParameter,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::storage::{
    append_only_triggers, json_error, open_connection, to_json, ts_from_sql, ts_to_sql,
};

/// Live weight table. Readers clone the inner `Arc`, so a swap never
/// disturbs a classification already holding the old table.
#[derive(Clone)]
pub struct SharedWeights {
    inner: Arc<RwLock<Arc<FactorWeightTable>>>,
    version: Arc<RwLock<i64>>,
}

impl SharedWeights {
    pub fn new(table: FactorWeightTable, version: i64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(table))),
            version: Arc::new(RwLock::new(version)),
        }
    }

    pub fn current(&self) -> Arc<FactorWeightTable> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn version(&self) -> i64 {
        *self.version.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn swap(&self, table: FactorWeightTable, version: i64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut current_version = self.version.write().unwrap_or_else(|e| e.into_inner());
        *inner = Arc::new(table);
        *current_version = version;
    }
}

/// Versioned, append-only persistence for weight tables and the log of
/// applied adjustments.
pub struct WeightStore {
    path: PathBuf,
}

impl WeightStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS weight_tables (
                version INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                source TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS weight_adjustments (
                id TEXT PRIMARY KEY,
                parameter TEXT NOT NULL,
                previous REAL NOT NULL,
                proposed REAL NOT NULL,
                reason TEXT NOT NULL,
                table_version INTEGER NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )?;
        conn.execute_batch(&append_only_triggers("weight_tables"))?;
        conn.execute_batch(&append_only_triggers("weight_adjustments"))?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        Ok(open_connection(&self.path)?)
    }

    /// Latest persisted table and its version.
    pub fn latest(&self) -> Result<Option<(i64, FactorWeightTable)>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT version, payload FROM weight_tables ORDER BY version DESC LIMIT 1",
                [],
                |row| {
                    let version: i64 = row.get(0)?;
                    let payload: String = row.get(1)?;
                    let table: FactorWeightTable =
                        serde_json::from_str(&payload).map_err(json_error)?;
                    Ok((version, table))
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn save(&self, table: &FactorWeightTable, source: &str) -> Result<i64> {
        table.validate()?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO weight_tables (created_at, source, payload) VALUES (?1, ?2, ?3)",
            params![ts_to_sql(&Utc::now()), source, to_json(table)?],
        )?;
        let version = conn.last_insert_rowid();
        debug!("Saved weight table version {} ({})", version, source);
        Ok(version)
    }

    /// Persist a tuned table together with the adjustments that produced it,
    /// in one transaction.
    pub fn save_tuned(
        &self,
        table: &FactorWeightTable,
        adjustments: &[Adjustment],
    ) -> Result<(i64, Vec<AppliedAdjustment>)> {
        table.validate()?;
        let applied_at = Utc::now();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO weight_tables (created_at, source, payload) VALUES (?1, 'tuner', ?2)",
            params![ts_to_sql(&applied_at), to_json(table)?],
        )?;
        let version = tx.last_insert_rowid();

        let mut applied = Vec::with_capacity(adjustments.len());
        for adjustment in adjustments {
            let record = AppliedAdjustment {
                id: generate_adjustment_id(),
                adjustment: adjustment.clone(),
                table_version: version,
                applied_at,
            };
            tx.execute(
                "INSERT INTO weight_adjustments
                    (id, parameter, previous, proposed, reason, table_version, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.0,
                    adjustment.parameter.as_str(),
                    adjustment.current,
                    adjustment.proposed,
                    adjustment.reason,
                    version,
                    ts_to_sql(&applied_at),
                ],
            )?;
            applied.push(record);
        }
        tx.commit()?;

        Ok((version, applied))
    }

    /// Persist a table received from another installation as a new version.
    /// Its adjustment log is attached to that version; entries already
    /// present (same id) are kept as they are. Returns the new version and
    /// how many adjustments were added.
    pub fn save_imported(
        &self,
        table: &FactorWeightTable,
        adjustments: &[AppliedAdjustment],
    ) -> Result<(i64, usize)> {
        table.validate()?;
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO weight_tables (created_at, source, payload) VALUES (?1, 'import', ?2)",
            params![ts_to_sql(&Utc::now()), to_json(table)?],
        )?;
        let version = tx.last_insert_rowid();

        let mut added = 0;
        for record in adjustments {
            let adjustment = &record.adjustment;
            added += tx.execute(
                "INSERT OR IGNORE INTO weight_adjustments
                    (id, parameter, previous, proposed, reason, table_version, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.0,
                    adjustment.parameter.as_str(),
                    adjustment.current,
                    adjustment.proposed,
                    adjustment.reason,
                    version,
                    ts_to_sql(&record.applied_at),
                ],
            )?;
        }
        tx.commit()?;

        debug!("Imported weight table version {} with {} adjustments", version, added);
        Ok((version, added))
    }

    /// Applied adjustments, oldest first, optionally bounded below.
    pub fn adjustments(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AppliedAdjustment>> {
        let conn = self.connect()?;
        let lower = since.map(|ts| ts_to_sql(&ts)).unwrap_or_default();
        let mut stmt = conn.prepare(
            "SELECT id, parameter, previous, proposed, reason, table_version, applied_at
             FROM weight_adjustments WHERE applied_at >= ?1
             ORDER BY applied_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![lower], |row| {
                let parameter: String = row.get(1)?;
                let applied_at: String = row.get(6)?;
                Ok(AppliedAdjustment {
                    id: AdjustmentId(row.get(0)?),
                    adjustment: Adjustment {
                        parameter: parse_parameter(&parameter)?,
                        current: row.get(2)?,
                        proposed: row.get(3)?,
                        reason: row.get(4)?,
                    },
                    table_version: row.get(5)?,
                    applied_at: ts_from_sql(&applied_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn version_count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM weight_tables", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Resolve the startup table: latest persisted version, else the weights
    /// file, else defaults. A freshly resolved table is saved as a version.
    pub fn load_or_init(&self, weights_file: Option<&Path>) -> Result<(i64, FactorWeightTable)> {
        if let Some((version, table)) = self.latest()? {
            info!("Loaded weight table version {}", version);
            return Ok((version, table));
        }

        let (table, source) = match weights_file {
            Some(path) => (load_weights_file(path)?, "file"),
            None => (FactorWeightTable::default(), "default"),
        };
        let version = self.save(&table, source)?;
        info!("Initialised weight table version {} from {}", version, source);
        Ok((version, table))
    }
}

fn parse_parameter(raw: &str) -> rusqlite::Result<TunableParameter> {
    match raw {
        "confidence_threshold" => Ok(TunableParameter::ConfidenceThreshold),
        "semantic_weight" => Ok(TunableParameter::SemanticWeight),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown tunable parameter: {}", other).into(),
        )),
    }
}

/// Parse a weight table from a TOML (`.toml`) or JSON file. An unreadable
/// path is an input error; a table that cannot be parsed, names unknown
/// factors or categories, or carries negative weights violates the table's
/// invariants.
pub fn load_weights_file(path: &Path) -> Result<FactorWeightTable> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Input(format!("weights file {}: {}", path.display(), e)))?;

    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    let parsed = if is_toml {
        toml::from_str::<FactorWeightTable>(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<FactorWeightTable>(&raw).map_err(|e| e.to_string())
    };

    parsed.map_err(|e| {
        EngineError::InvariantViolation(format!("weights file {}: {}", path.display(), e))
    })
}
