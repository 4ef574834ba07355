use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::HealthConfig;

/// Environment variable naming the directory for the default store.
pub const DATA_DIR_ENV: &str = "RELAY_LLM_DATA_DIR";

const DEFAULT_DB_FILE: &str = "model_metrics.sqlite3";

/// Health queries never look at more than this many samples, however
/// large the configured window is.
const MAX_WINDOW_CALLS: u32 = 10;

/// Health queries never look further back than this, so a once-slow
/// model cannot stay unhealthy forever.
const MAX_RECOVERY_TIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum HealthStoreError {
    #[error("health store is closed")]
    Closed,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timestamp format error: {0}")]
    FormatTimestamp(#[from] time::error::Format),
    #[error("timestamp parse error: {0}")]
    ParseTimestamp(#[from] time::error::Parse),
}

/// Rolling-latency recorder consumed by the router and the attempt
/// executor. Implementations must be safe for concurrent record and
/// query calls.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Appends one latency sample for `model`, stamped with the current
    /// UTC time.
    async fn record(&self, model: &str, latency_seconds: f64) -> Result<(), HealthStoreError>;

    /// A model is healthy iff the mean latency of its most recent
    /// `min(no_of_calls, 10)` samples inside `min(recovery_time, 1h)`
    /// is strictly below the threshold. No samples in the window means
    /// healthy.
    async fn is_healthy(
        &self,
        model: &str,
        config: &HealthConfig,
    ) -> Result<bool, HealthStoreError>;
}

/// Embedded sqlite implementation. One connection, serialized behind a
/// lock; blocking work runs on the tokio blocking pool.
#[derive(Clone)]
pub struct SqliteHealthStore {
    conn: Arc<Mutex<Option<rusqlite::Connection>>>,
    path: Option<PathBuf>,
}

impl SqliteHealthStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HealthStoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: Some(path),
        })
    }

    /// Opens the store in the directory named by `RELAY_LLM_DATA_DIR`,
    /// falling back to the OS temp directory.
    pub fn open_default() -> Result<Self, HealthStoreError> {
        let dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self::open(dir.join(DEFAULT_DB_FILE))
    }

    pub fn in_memory() -> Result<Self, HealthStoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: None,
        })
    }

    /// Closes the underlying database. Every operation afterwards fails
    /// with [`HealthStoreError::Closed`].
    pub async fn close(&self) -> Result<(), HealthStoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), HealthStoreError> {
            let mut guard = lock_connection(&conn);
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, err)| HealthStoreError::Sqlite(err))?;
            }
            Ok(())
        })
        .await?
    }

    /// Closes the store and deletes its database file.
    pub async fn drop_store(&self) -> Result<(), HealthStoreError> {
        self.close().await?;
        if let Some(path) = &self.path {
            std::fs::remove_file(path)?;
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = path.clone().into_os_string();
                sidecar.push(suffix);
                let _ = std::fs::remove_file(sidecar);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HealthStore for SqliteHealthStore {
    async fn record(&self, model: &str, latency_seconds: f64) -> Result<(), HealthStoreError> {
        let conn = Arc::clone(&self.conn);
        let model = model.to_string();
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
        tokio::task::spawn_blocking(move || -> Result<(), HealthStoreError> {
            let guard = lock_connection(&conn);
            let Some(conn) = guard.as_ref() else {
                return Err(HealthStoreError::Closed);
            };
            conn.execute(
                "INSERT INTO model_metrics (timestamp, model, latency) VALUES (?1, ?2, ?3)",
                rusqlite::params![timestamp, model, latency_seconds],
            )?;
            Ok(())
        })
        .await?
    }

    async fn is_healthy(
        &self,
        model: &str,
        config: &HealthConfig,
    ) -> Result<bool, HealthStoreError> {
        let conn = Arc::clone(&self.conn);
        let model = model.to_string();
        let window = config.no_of_calls.clamp(1, MAX_WINDOW_CALLS);
        let recovery = config.recovery_time.min(MAX_RECOVERY_TIME);
        let threshold = config.avg_latency_threshold;
        let cutoff =
            OffsetDateTime::now_utc() - time::Duration::seconds_f64(recovery.as_secs_f64());
        tokio::task::spawn_blocking(move || -> Result<bool, HealthStoreError> {
            let guard = lock_connection(&conn);
            let Some(conn) = guard.as_ref() else {
                return Err(HealthStoreError::Closed);
            };
            let mut stmt = conn.prepare(
                "SELECT timestamp, latency FROM model_metrics
                 WHERE model = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![model, window], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;

            let mut total = 0.0;
            let mut samples = 0u32;
            for row in rows {
                let (timestamp, latency) = row?;
                let recorded = OffsetDateTime::parse(&timestamp, &Rfc3339)?;
                if recorded >= cutoff {
                    total += latency;
                    samples += 1;
                }
            }
            if samples == 0 {
                return Ok(true);
            }
            Ok(total / f64::from(samples) < threshold)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS model_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            model TEXT NOT NULL,
            latency REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_model_metrics_model_id
            ON model_metrics(model, id);",
    )
}

fn lock_connection(
    conn: &Mutex<Option<rusqlite::Connection>>,
) -> MutexGuard<'_, Option<rusqlite::Connection>> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
