//! SQLite-based rollup catalog.
//!
//! Persists the last successful snapshot of every rollup partition so a
//! restarted engine can re-adopt tables built by a previous process. The
//! catalog is stored in `{data_dir}/prism/catalog.db` unless configured.
//!
//! # Design
//!
//! - One row per `(rollup, partition)`, replaced on every successful build
//! - Rows carry the schema hash; callers ignore rows from another schema
//! - Versioned - auto-clears on version mismatch

mod hash;
pub use hash::{definitions_hash, table_hash};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Current catalog schema version. Bump this when the table layout changes.
const CATALOG_VERSION: i32 = 1;

/// Errors that can occur during catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to determine data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid timestamp '{0}' in catalog")]
    InvalidTimestamp(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Last successful build of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub rollup: String,
    pub partition: String,
    pub schema: Option<String>,
    pub table: String,
    pub version: u64,
    pub built_at: DateTime<Utc>,
    pub refresh_key: Option<String>,
    pub schema_hash: String,
}

pub struct RollupCatalog {
    conn: Connection,
}

impl std::fmt::Debug for RollupCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupCatalog").finish_non_exhaustive()
    }
}

impl RollupCatalog {
    /// Open or create the catalog at `path`.
    ///
    /// If the catalog version doesn't match, it's automatically cleared.
    pub fn open<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let catalog = Self {
            conn: Connection::open(path)?,
        };
        catalog.init()?;
        Ok(catalog)
    }

    /// Open an in-memory catalog (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        let catalog = Self {
            conn: Connection::open_in_memory()?,
        };
        catalog.init()?;
        Ok(catalog)
    }

    pub fn default_path() -> CacheResult<PathBuf> {
        let base = dirs::data_dir().ok_or(CacheError::NoDataDir)?;
        Ok(base.join("prism").join("catalog.db"))
    }

    fn init(&self) -> CacheResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rollup_snapshots (
                rollup TEXT NOT NULL,
                partition_label TEXT NOT NULL,
                schema_name TEXT,
                table_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                built_at TEXT NOT NULL,
                refresh_key TEXT,
                schema_hash TEXT NOT NULL,
                PRIMARY KEY (rollup, partition_label)
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<i32> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        match stored_version {
            Some(v) if v == CATALOG_VERSION => {}
            Some(_) => {
                self.clear_all()?;
                self.set_version()?;
            }
            None => self.set_version()?,
        }

        Ok(())
    }

    fn set_version(&self) -> CacheResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
            params![CATALOG_VERSION.to_string()],
        )?;
        Ok(())
    }

    /// Record the current snapshot of a partition, replacing any previous row.
    pub fn record(&self, entry: &CatalogEntry) -> CacheResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO rollup_snapshots
                (rollup, partition_label, schema_name, table_name, version, built_at, refresh_key, schema_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.rollup,
                entry.partition,
                entry.schema,
                entry.table,
                entry.version as i64,
                entry.built_at.to_rfc3339(),
                entry.refresh_key,
                entry.schema_hash,
            ],
        )?;
        Ok(())
    }

    pub fn lookup(&self, rollup: &str, partition: &str) -> CacheResult<Option<CatalogEntry>> {
        let raw = self
            .conn
            .query_row(
                "SELECT rollup, partition_label, schema_name, table_name, version, built_at, refresh_key, schema_hash
                 FROM rollup_snapshots WHERE rollup = ? AND partition_label = ?",
                params![rollup, partition],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// All recorded snapshots, ordered by rollup and partition.
    pub fn entries(&self) -> CacheResult<Vec<CatalogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT rollup, partition_label, schema_name, table_name, version, built_at, refresh_key, schema_hash
             FROM rollup_snapshots ORDER BY rollup, partition_label",
        )?;
        let raw = stmt
            .query_map([], RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }

    pub fn remove(&self, rollup: &str, partition: &str) -> CacheResult<bool> {
        let rows = self.conn.execute(
            "DELETE FROM rollup_snapshots WHERE rollup = ? AND partition_label = ?",
            params![rollup, partition],
        )?;
        Ok(rows > 0)
    }

    pub fn clear_all(&self) -> CacheResult<()> {
        self.conn.execute("DELETE FROM rollup_snapshots", [])?;
        Ok(())
    }
}

/// Row as stored, before timestamp parsing.
struct RawEntry {
    rollup: String,
    partition: String,
    schema: Option<String>,
    table: String,
    version: i64,
    built_at: String,
    refresh_key: Option<String>,
    schema_hash: String,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rollup: row.get(0)?,
            partition: row.get(1)?,
            schema: row.get(2)?,
            table: row.get(3)?,
            version: row.get(4)?,
            built_at: row.get(5)?,
            refresh_key: row.get(6)?,
            schema_hash: row.get(7)?,
        })
    }

    fn into_entry(self) -> CacheResult<CatalogEntry> {
        let built_at = DateTime::parse_from_rfc3339(&self.built_at)
            .map_err(|_| CacheError::InvalidTimestamp(self.built_at.clone()))?
            .with_timezone(&Utc);
        Ok(CatalogEntry {
            rollup: self.rollup,
            partition: self.partition,
            schema: self.schema,
            table: self.table,
            version: self.version.max(0) as u64,
            built_at,
            refresh_key: self.refresh_key,
            schema_hash: self.schema_hash,
        })
    }
}
