use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PORT: u16 = 21960;
const DEFAULT_DIRECTIVE: &str = "Classify this note into exactly one PARA category: \
Projects (active efforts with a goal or deadline), Areas (ongoing responsibilities), \
Resources (reference material) or Archive (inactive or completed).";

/// Runtime configuration of the engine and its services.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub neighbor_k: usize,
    pub scoped_queries: bool,
    pub index_timeout: Duration,
    pub oracle_timeout: Duration,
    /// Observation window for metrics and tuning; `None` means all time.
    pub metrics_window_days: Option<u32>,
    /// Cadence of the background snapshot worker; `None` disables it.
    pub snapshot_interval: Option<Duration>,
    pub weights_file: Option<PathBuf>,
    pub bind_addr: SocketAddr,
    pub notes_dir: Option<PathBuf>,
    pub ledger_retry_backoff: Duration,
    pub velocity_window: usize,
    pub oracle_directive: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            neighbor_k: 10,
            scoped_queries: false,
            index_timeout: Duration::from_millis(2000),
            oracle_timeout: Duration::from_millis(30_000),
            metrics_window_days: None,
            snapshot_interval: None,
            weights_file: None,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            notes_dir: None,
            ledger_retry_backoff: Duration::from_millis(50),
            velocity_window: 10,
            oracle_directive: DEFAULT_DIRECTIVE.to_string(),
        }
    }
}

impl EngineConfig {
    /// Config with every default except the database location.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Create config from `PARA_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`. Unparseable
    /// values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| -> Option<String> {
            lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };

        Self {
            db_path: parsed("PARA_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            neighbor_k: number(&parsed, "PARA_NEIGHBOR_K").unwrap_or(defaults.neighbor_k),
            scoped_queries: parsed("PARA_SCOPED_QUERIES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.scoped_queries),
            index_timeout: number(&parsed, "PARA_INDEX_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.index_timeout),
            oracle_timeout: number(&parsed, "PARA_ORACLE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.oracle_timeout),
            metrics_window_days: number(&parsed, "PARA_METRICS_WINDOW_DAYS")
                .filter(|d: &u32| *d > 0),
            snapshot_interval: number(&parsed, "PARA_SNAPSHOT_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs),
            weights_file: parsed("PARA_WEIGHTS_FILE").map(PathBuf::from),
            bind_addr: number(&parsed, "PARA_BIND_ADDR").unwrap_or(defaults.bind_addr),
            notes_dir: parsed("PARA_NOTES_DIR").map(PathBuf::from),
            ..defaults
        }
    }
}

fn number<T: FromStr>(parsed: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = parsed(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

fn default_db_path() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".para").join("para.db"),
        Err(_) => PathBuf::from("para.db"),
    }
}
