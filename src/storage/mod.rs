//!
//! policydesk storage module
//! -------------------------
//! One Parquet file per logical table under a configured root folder
//! (`policies.parquet`, `users.parquet`, `user_roles.parquet`,
//! `profiles.parquet`). Tables are small enough that every mutation is a
//! whole-table read-modify-write; single-record atomicity only, last write
//! wins. The public API centers around `Store`, usually wrapped in the
//! thread-safe `SharedStore` (`Arc<Mutex<Store>>`): callers hold the mutex
//! across a read-modify-write cycle.

use std::{fs, path::{Path, PathBuf}};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use polars::prelude::*;
use tracing::debug;

/// On-disk table store rooted at a single folder.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a new Store rooted at the given filesystem path.
    /// The directory is created if it does not already exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &PathBuf { &self.root }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.parquet"))
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.table_path(table).exists()
    }

    /// Read a whole table. Returns None when the table file does not exist
    /// yet; callers substitute their empty schema frame.
    pub fn read_table(&self, table: &str) -> Result<Option<DataFrame>> {
        let path = self.table_path(table);
        if !path.exists() { return Ok(None); }
        let file = fs::File::open(&path)
            .with_context(|| format!("opening table {}", path.display()))?;
        let df = ParquetReader::new(file).finish()
            .with_context(|| format!("reading table {}", path.display()))?;
        Ok(Some(df))
    }

    /// Replace a whole table with the given frame.
    pub fn write_table(&self, table: &str, mut df: DataFrame) -> Result<()> {
        let path = self.table_path(table);
        if let Some(dir) = path.parent() { fs::create_dir_all(dir).ok(); }
        debug!(target: "policydesk::storage", "write_table: table='{}' rows={}", table, df.height());
        let mut f = fs::File::create(&path)
            .with_context(|| format!("creating table {}", path.display()))?;
        ParquetWriter::new(&mut f).finish(&mut df)
            .with_context(|| format!("writing table {}", path.display()))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<Store>>);

impl SharedStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Store::new(root)?))))
    }
}

/// Current wall-clock time in epoch milliseconds; the timestamp unit for all
/// server-assigned created_at/updated_at columns.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
