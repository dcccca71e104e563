// Storage schema and database management

use crate::model::{DataKind, WorkItemId, WorkItemRecord, DATE_FORMAT};
use crate::store::{Result, Store, StoreError, StoreQuery};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path
    pub db_path: PathBuf,

    /// Whether to enable WAL mode
    pub wal_enabled: bool,

    /// Cache size in pages
    pub cache_size_pages: Option<usize>,

    /// How long a writer waits on a locked database, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".lerelais/relais.db"),
            wal_enabled: true,
            cache_size_pages: Some(10000),
            busy_timeout_ms: 5_000,
        }
    }
}

/// SQLite-backed [`Store`].
///
/// The connection is guarded by a mutex so the store can be shared across
/// fetch workers; every operation is a single statement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    config: StorageConfig,
}

impl SqliteStore {
    /// Open storage with default config at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = StorageConfig {
            db_path: path.as_ref().to_path_buf(),
            ..StorageConfig::default()
        };
        Self::open_with_config(config)
    }

    /// Open storage with custom config
    pub fn open_with_config(config: StorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(&config.db_path)?;
        Self::from_connection(conn, config)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let config = StorageConfig {
            db_path: PathBuf::from(":memory:"),
            wal_enabled: false,
            ..StorageConfig::default()
        };
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(conn: Connection, config: StorageConfig) -> Result<Self> {
        // Enable WAL mode for better concurrency
        if config.wal_enabled {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        if let Some(cache_size) = config.cache_size_pages {
            conn.pragma_update(None, "cache_size", cache_size)?;
        }

        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;

        let store = Self {
            conn: Mutex::new(conn),
            config,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Database path this store was opened with.
    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))
    }

    /// Initialize database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS work_items (
                kind TEXT NOT NULL,
                facility TEXT NOT NULL,
                event_date TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                payload TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY (kind, facility, event_date, sequence)
            )",
            [],
        )?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_work_items_kind_date ON work_items(kind, event_date)",
            "CREATE INDEX IF NOT EXISTS idx_work_items_fetched_at ON work_items(fetched_at)",
        ];
        for index_sql in indexes {
            conn.execute(index_sql, [])?;
        }

        Ok(())
    }

    /// Number of stored items per kind.
    pub fn count_by_kind(&self) -> Result<HashMap<DataKind, usize>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM work_items GROUP BY kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (kind, count) = row?;
            let kind = DataKind::from_str_name(&kind)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown kind '{}'", kind)))?;
            counts.insert(kind, count.max(0) as usize);
        }
        Ok(counts)
    }

    /// Load one stored record.
    pub fn get(&self, kind: DataKind, id: &WorkItemId) -> Result<Option<WorkItemRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT payload, fetched_at FROM work_items
                 WHERE kind = ?1 AND facility = ?2 AND event_date = ?3 AND sequence = ?4",
                params![
                    kind.as_str(),
                    id.facility,
                    id.date.format(DATE_FORMAT).to_string(),
                    id.sequence
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(payload, fetched_at)| WorkItemRecord {
            kind,
            id: id.clone(),
            payload,
            fetched_at,
        }))
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("invalid event_date '{}': {}", raw, e)))
}

impl Store for SqliteStore {
    fn existing(&self, query: &StoreQuery) -> Result<HashSet<WorkItemId>> {
        if query.facilities.is_empty() || query.date_from > query.date_to {
            return Ok(HashSet::new());
        }

        let facilities: HashSet<&str> = query.facilities.iter().map(String::as_str).collect();
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT facility, event_date, sequence FROM work_items
             WHERE kind = ?1
               AND event_date BETWEEN ?2 AND ?3
               AND sequence BETWEEN ?4 AND ?5",
        )?;
        let rows = stmt.query_map(
            params![
                query.kind.as_str(),
                query.date_from.format(DATE_FORMAT).to_string(),
                query.date_to.format(DATE_FORMAT).to_string(),
                query.sequence_from,
                query.sequence_to,
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                ))
            },
        )?;

        let mut found = HashSet::new();
        for row in rows {
            let (facility, date, sequence) = row?;
            if !facilities.contains(facility.as_str()) {
                continue;
            }
            found.insert(WorkItemId {
                facility,
                date: parse_date(&date)?,
                sequence,
            });
        }

        debug!(kind = %query.kind, existing = found.len(), "bulk existence query");
        Ok(found)
    }

    fn contains(&self, kind: DataKind, id: &WorkItemId) -> Result<bool> {
        let conn = self.conn()?;
        let hit = conn
            .query_row(
                "SELECT 1 FROM work_items
                 WHERE kind = ?1 AND facility = ?2 AND event_date = ?3 AND sequence = ?4",
                params![
                    kind.as_str(),
                    id.facility,
                    id.date.format(DATE_FORMAT).to_string(),
                    id.sequence
                ],
                |_| Ok(()),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    fn upsert(&self, record: &WorkItemRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO work_items (kind, facility, event_date, sequence, payload, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind, facility, event_date, sequence)
             DO UPDATE SET payload = excluded.payload, fetched_at = excluded.fetched_at",
            params![
                record.kind.as_str(),
                record.id.facility,
                record.id.date.format(DATE_FORMAT).to_string(),
                record.id.sequence,
                record.payload,
                record.fetched_at,
            ],
        )?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}
