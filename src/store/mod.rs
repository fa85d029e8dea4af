//! Per-rule duplicate-check store session.
//!
//! One [`DuplicateStore`] is open per rule at a time. The dedup decision is
//! made synchronously against an in-memory collision index and never waits
//! on disk; durability comes from a single writer thread per store and an
//! explicit [`DuplicateStore::flush`] barrier.
//!
//! # Concurrency Model
//!
//! The index mutation and the decision happen in one critical section, so
//! two threads checking the same content on the same store can never both be
//! told "new". Stores for different rules share nothing.
//!
//! # Persisted layout
//!
//! One redb database file per rule directory with two tables: `rows` maps
//! encoded [`ContentKey`] bytes to the canonical row serialization, and
//! `info` holds the schema version and the column-name header.

mod writer;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use redb::{Database, ReadTransaction, ReadableTable, ReadableTableMetadata};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::codec::{ContentKey, RowCodec};
use crate::config::DuplicateStoreConfig;
use crate::dirs::StoreDir;
use crate::models::{
    DuplicateCheckRow, DuplicateCheckRows, FindDuplicateCheckCriteria, ResultPage, SortDirection,
};
use crate::{Error, Result};

use writer::{
    INFO_COLUMN_NAMES, INFO_SCHEMA_VERSION, INFO_TABLE, ROWS_TABLE, StoreWriter, WriteTask,
};

/// Version of the persisted layout. A store written with a different version
/// is discarded and recreated at open.
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// In-memory collision index: content hash to the recorded entries for that
/// hash, each entry being the discriminator plus the canonical serialization
/// it was assigned to.
type CollisionIndex = HashMap<u64, Vec<(u32, Vec<u8>)>>;

/// One open duplicate-check session for a rule.
///
/// Obtained through [`crate::StorePool`] in production; opening directly is
/// useful in tests and tools. The session owns the embedded database
/// exclusively until [`close`](Self::close) (redb's file lock enforces this
/// across processes as well).
pub struct DuplicateStore {
    rule_uuid: Uuid,
    db: Arc<Database>,
    codec: RowCodec,
    index: Mutex<CollisionIndex>,
    writer: StoreWriter,
}

impl DuplicateStore {
    /// Opens (or creates) the store for a rule in the given directory.
    ///
    /// Performs a full scan of the persisted rows to rebuild the in-memory
    /// index, so dedup decisions immediately reflect everything recorded
    /// before a restart. A database written with an unknown schema version
    /// is deleted and recreated empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if the database cannot be opened or
    /// created; only this rule's session is affected.
    pub fn open(
        dir: &StoreDir,
        rule_uuid: Uuid,
        codec: RowCodec,
        config: &DuplicateStoreConfig,
    ) -> Result<Self> {
        let db = open_validated_db(dir, rule_uuid)?;
        let db = Arc::new(db);

        let index = rebuild_index(&db).map_err(|e| Error::StoreUnavailable {
            rule_uuid,
            cause: format!("rebuilding dedup index: {e}"),
        })?;
        debug!(
            rule_uuid = %rule_uuid,
            hashes = index.len(),
            "Rebuilt in-memory dedup index"
        );

        let writer = StoreWriter::spawn(Arc::clone(&db), config.max_puts_before_commit)?;

        Ok(Self {
            rule_uuid,
            db,
            codec,
            index: Mutex::new(index),
            writer,
        })
    }

    /// The rule this session was opened for.
    #[must_use]
    pub const fn rule_uuid(&self) -> Uuid {
        self.rule_uuid
    }

    /// Checks a row and records it if it is new.
    ///
    /// Returns `true` iff this call caused a new logical entry to be
    /// recorded; `false` if an entry with the same content already existed.
    /// The decision is made entirely in memory; the durable write is queued
    /// behind it and confirmed by the next [`flush`](Self::flush).
    ///
    /// Rows colliding on the content hash are compared byte-for-byte against
    /// every recorded serialization for that hash, so a collision can never
    /// merge two distinct rows or lose one.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the row cannot be encoded; only this
    /// row is affected. Returns `Error::OperationFailed` if the store is
    /// closed.
    #[instrument(skip(self, row), fields(operation = "try_insert", rule_uuid = %self.rule_uuid))]
    pub fn try_insert(&self, row: &DuplicateCheckRow) -> Result<bool> {
        let bytes = self.codec.encode(row)?;
        let hash = self.codec.hash(&bytes);

        let mut index = acquire_lock(&self.index);
        let entries = index.entry(hash).or_default();

        if entries.iter().any(|(_, existing)| *existing == bytes) {
            debug!(key_hash = hash, "Duplicate row");
            metrics::counter!("dupstore_rows_checked_total", "outcome" => "duplicate")
                .increment(1);
            return Ok(false);
        }

        let discriminator = entries.iter().map(|(d, _)| *d).max().map_or(0, |d| d + 1);
        let key = ContentKey::new(hash, discriminator);
        entries.push((discriminator, bytes.clone()));

        if let Err(e) = self.writer.submit(WriteTask::PutRow {
            key: key.to_bytes(),
            value: bytes,
        }) {
            // The write will never happen, so the decision must not stand.
            if let Some(entries) = index.get_mut(&hash) {
                entries.retain(|(d, _)| *d != discriminator);
            }
            return Err(e);
        }

        debug!(key = %key, "New row");
        metrics::counter!("dupstore_rows_checked_total", "outcome" => "new").increment(1);
        Ok(true)
    }

    /// Durability barrier.
    ///
    /// Blocks until every write enqueued before this call is committed, then
    /// reports any background write error recorded since the previous
    /// barrier. After a successful flush, every earlier decision is visible
    /// to read queries and survives a close/reopen of the same directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::OperationFailed` carrying the first background write
    /// failure since the last barrier. The in-memory decisions already
    /// returned to callers are not retracted; the error reports the
    /// durability gap rather than hiding it.
    #[instrument(skip(self), fields(operation = "flush", rule_uuid = %self.rule_uuid))]
    pub fn flush(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.writer.barrier();
        #[allow(clippy::cast_precision_loss)]
        metrics::histogram!("dupstore_flush_duration_ms")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    /// The most recent background write error, if one occurred since the
    /// last flush barrier. Peeking does not clear it.
    #[must_use]
    pub fn write_error(&self) -> Option<String> {
        self.writer.last_error()
    }

    /// Test-only: queues a write that fails inside the writer thread, the
    /// way a real storage error would.
    #[cfg(test)]
    fn inject_write_failure(&self, cause: &str) -> Result<()> {
        self.writer.submit(WriteTask::Fail {
            cause: cause.to_string(),
        })
    }

    /// Persists the rule's column-name header.
    ///
    /// Idempotent when the names are unchanged. If names were already
    /// written and differ, all stored rows are cleared first: a column
    /// change (added, removed, re-ordered) means new rows cannot match the
    /// positional layout of the existing data. Durable once this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read or written.
    #[instrument(skip(self, column_names), fields(operation = "write_column_names", rule_uuid = %self.rule_uuid))]
    pub fn write_column_names(&self, column_names: &[String]) -> Result<()> {
        // Earlier header writes always flushed, so the committed state is
        // current.
        let current = self.fetch_column_names()?;

        if current.as_deref() == Some(column_names) {
            debug!("Column names unchanged");
            return Ok(());
        }

        let encoded = RowCodec::encode_values(column_names)?;

        {
            // Hold the index lock across both queue submissions so no
            // concurrent insert can slip a row in between the clear and the
            // header write.
            let mut index = acquire_lock(&self.index);
            if current.is_some() {
                info!(
                    rule_uuid = %self.rule_uuid,
                    "Column names changed; clearing all rows in duplicate store"
                );
                index.clear();
                self.writer.submit(WriteTask::ClearRows)?;
            }
            self.writer.submit(WriteTask::PutInfo {
                key: INFO_COLUMN_NAMES,
                value: encoded,
            })?;
        }

        self.flush()
    }

    /// Reads the rule's column-name header.
    ///
    /// `None` means the header was never written, as opposed to a rule whose
    /// query has zero columns. Works with or without pending writes, since
    /// header writes always flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn fetch_column_names(&self) -> Result<Option<Vec<String>>> {
        let txn = begin_read(&self.db)?;
        read_column_names_txn(&txn)
    }

    /// Fetches one page of stored rows plus the exact total match count.
    ///
    /// Reads the committed state directly, bypassing the in-memory index:
    /// call [`flush`](Self::flush) first when recent decisions must be
    /// visible. Without a sort the rows come back in durable key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read or a stored row fails
    /// to decode.
    #[instrument(skip(self, criteria), fields(operation = "fetch_data", rule_uuid = %self.rule_uuid))]
    pub fn fetch_data(&self, criteria: &FindDuplicateCheckCriteria) -> Result<DuplicateCheckRows> {
        let txn = begin_read(&self.db)?;
        fetch_data_txn(&txn, &self.codec, criteria)
    }

    /// Deletes the given rows from the store, returning `true` on success.
    ///
    /// Matching is by content, so forced hash collisions delete exactly the
    /// requested rows and leave colliding neighbours intact. Rows not
    /// present are ignored. Durable once this returns; afterwards the same
    /// content inserts as new again.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be encoded or the deletion cannot be
    /// made durable.
    #[instrument(skip(self, rows), fields(operation = "delete_rows", rule_uuid = %self.rule_uuid, count = rows.len()))]
    pub fn delete_rows(&self, rows: &[DuplicateCheckRow]) -> Result<bool> {
        {
            let mut index = acquire_lock(&self.index);
            for row in rows {
                let bytes = self.codec.encode(row)?;
                let hash = self.codec.hash(&bytes);
                let Some(entries) = index.get_mut(&hash) else {
                    continue;
                };
                let Some(pos) = entries.iter().position(|(_, existing)| *existing == bytes)
                else {
                    continue;
                };
                let (discriminator, _) = entries.remove(pos);
                if entries.is_empty() {
                    index.remove(&hash);
                }
                self.writer.submit(WriteTask::DeleteRow {
                    key: ContentKey::new(hash, discriminator).to_bytes(),
                })?;
            }
        }
        self.flush()?;
        Ok(true)
    }

    /// Number of distinct rows currently committed.
    ///
    /// Call [`flush`](Self::flush) first to count queued writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn size(&self) -> Result<u64> {
        let txn = begin_read(&self.db)?;
        match txn.open_table(ROWS_TABLE) {
            Ok(table) => table
                .len()
                .map_err(|e| op_err("count_rows", &e)),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(op_err("count_rows", &e)),
        }
    }

    /// Closes the session: queued writes complete and commit, then the
    /// writer stops. The store directory is never deleted here.
    pub fn close(&self) {
        self.writer.close();
        debug!(rule_uuid = %self.rule_uuid, "Closed duplicate store");
    }

    /// Reads the column-name header for a directory without opening a full
    /// session.
    ///
    /// Used for metadata queries against rules with no open session. Returns
    /// `None` when the directory holds no database yet. Must not run while a
    /// session owns the directory (redb's file lock would refuse the open);
    /// [`crate::StorePool`] serializes this against its own sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing database cannot be opened or read.
    pub fn read_column_names(dir: &StoreDir) -> Result<Option<Vec<String>>> {
        if !dir.db_exists() {
            return Ok(None);
        }
        let db = Database::open(dir.db_path()).map_err(|e| op_err("open_store_db", &e))?;
        let txn = begin_read(&db)?;
        read_column_names_txn(&txn)
    }

    /// Fetches stored rows for a directory without opening a full session.
    ///
    /// Returns an empty result when the directory holds no database yet.
    /// Same exclusivity caveat as [`Self::read_column_names`].
    ///
    /// # Errors
    ///
    /// Returns an error if an existing database cannot be opened or read.
    pub fn read_data(
        dir: &StoreDir,
        codec: &RowCodec,
        criteria: &FindDuplicateCheckCriteria,
    ) -> Result<DuplicateCheckRows> {
        if !dir.db_exists() {
            return Ok(DuplicateCheckRows {
                column_names: Vec::new(),
                page: ResultPage::new(Vec::new(), criteria.page.offset, 0),
            });
        }
        let db = Database::open(dir.db_path()).map_err(|e| op_err("open_store_db", &e))?;
        let txn = begin_read(&db)?;
        fetch_data_txn(&txn, codec, criteria)
    }
}

impl fmt::Debug for DuplicateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicateStore")
            .field("rule_uuid", &self.rule_uuid)
            .finish_non_exhaustive()
    }
}

/// Locks a mutex, recovering the guard if a panicking thread poisoned it.
///
/// Index entries are self-contained values; no invariant spans the lock, so
/// continuing after a poison is safe.
pub(crate) fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn op_err(operation: &str, cause: &dyn fmt::Display) -> Error {
    Error::OperationFailed {
        operation: operation.to_string(),
        cause: cause.to_string(),
    }
}

fn begin_read(db: &Database) -> Result<ReadTransaction> {
    db.begin_read().map_err(|e| op_err("begin_read", &e))
}

/// Opens the database for a rule directory, creating it if missing and
/// discarding it when the schema version is absent or stale.
fn open_validated_db(dir: &StoreDir, rule_uuid: Uuid) -> Result<Database> {
    let db_path = dir.db_path();

    if dir.db_exists() {
        let db = Database::open(&db_path).map_err(|e| Error::StoreUnavailable {
            rule_uuid,
            cause: format!("{}: {e}", db_path.display()),
        })?;
        match read_schema_version(&db) {
            Ok(Some(CURRENT_SCHEMA_VERSION)) => return Ok(db),
            Ok(version) => {
                info!(
                    rule_uuid = %rule_uuid,
                    found = ?version,
                    expected = CURRENT_SCHEMA_VERSION,
                    "Schema version mismatch; discarding duplicate store"
                );
            },
            Err(e) => {
                info!(
                    rule_uuid = %rule_uuid,
                    cause = %e,
                    "Unreadable schema version; discarding duplicate store"
                );
            },
        }
        drop(db);
        fs::remove_file(&db_path).map_err(|e| Error::StoreUnavailable {
            rule_uuid,
            cause: format!("removing stale database {}: {e}", db_path.display()),
        })?;
    }

    let db = Database::create(&db_path).map_err(|e| Error::StoreUnavailable {
        rule_uuid,
        cause: format!("{}: {e}", db_path.display()),
    })?;
    initialize_db(&db).map_err(|e| Error::StoreUnavailable {
        rule_uuid,
        cause: format!("initializing database: {e}"),
    })?;
    Ok(db)
}

/// Creates both tables and stamps the schema version.
fn initialize_db(db: &Database) -> Result<()> {
    let txn = db.begin_write().map_err(|e| op_err("begin_write", &e))?;
    {
        let _rows = txn
            .open_table(ROWS_TABLE)
            .map_err(|e| op_err("open_rows_table", &e))?;
        let mut info = txn
            .open_table(INFO_TABLE)
            .map_err(|e| op_err("open_info_table", &e))?;
        info.insert(
            INFO_SCHEMA_VERSION,
            CURRENT_SCHEMA_VERSION.to_be_bytes().to_vec(),
        )
        .map_err(|e| op_err("write_schema_version", &e))?;
    }
    txn.commit().map_err(|e| op_err("commit", &e))
}

fn read_schema_version(db: &Database) -> Result<Option<u32>> {
    let txn = begin_read(db)?;
    let table = match txn.open_table(INFO_TABLE) {
        Ok(table) => table,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(op_err("open_info_table", &e)),
    };
    let Some(guard) = table
        .get(INFO_SCHEMA_VERSION)
        .map_err(|e| op_err("read_schema_version", &e))?
    else {
        return Ok(None);
    };
    let bytes = guard.value();
    let Ok(version_bytes) = <[u8; 4]>::try_from(bytes.as_slice()) else {
        return Ok(None);
    };
    Ok(Some(u32::from_be_bytes(version_bytes)))
}

/// Full scan of the rows table into the in-memory collision index.
fn rebuild_index(db: &Database) -> Result<CollisionIndex> {
    let mut index = CollisionIndex::new();
    let txn = begin_read(db)?;
    let table = match txn.open_table(ROWS_TABLE) {
        Ok(table) => table,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(index),
        Err(e) => return Err(op_err("open_rows_table", &e)),
    };
    for entry in table.iter().map_err(|e| op_err("scan_rows", &e))? {
        let (key_guard, value_guard) = entry.map_err(|e| op_err("scan_rows", &e))?;
        let key = ContentKey::from_bytes(key_guard.value());
        index
            .entry(key.hash)
            .or_default()
            .push((key.discriminator, value_guard.value()));
    }
    for entries in index.values_mut() {
        entries.sort_by_key(|(discriminator, _)| *discriminator);
    }
    Ok(index)
}

fn read_column_names_txn(txn: &ReadTransaction) -> Result<Option<Vec<String>>> {
    let table = match txn.open_table(INFO_TABLE) {
        Ok(table) => table,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(op_err("open_info_table", &e)),
    };
    let Some(guard) = table
        .get(INFO_COLUMN_NAMES)
        .map_err(|e| op_err("read_column_names", &e))?
    else {
        return Ok(None);
    };
    RowCodec::decode_values(&guard.value()).map(Some)
}

/// Scans the rows table applying the criteria's filter, sort, and paging.
fn fetch_data_txn(
    txn: &ReadTransaction,
    codec: &RowCodec,
    criteria: &FindDuplicateCheckCriteria,
) -> Result<DuplicateCheckRows> {
    let column_names = read_column_names_txn(txn)?.unwrap_or_default();

    let table = match txn.open_table(ROWS_TABLE) {
        Ok(table) => table,
        Err(redb::TableError::TableDoesNotExist(_)) => {
            return Ok(DuplicateCheckRows {
                column_names,
                page: ResultPage::new(Vec::new(), criteria.page.offset, 0),
            });
        },
        Err(e) => return Err(op_err("open_rows_table", &e)),
    };

    let matches_filter = |row: &DuplicateCheckRow| {
        criteria
            .filter
            .as_deref()
            .is_none_or(|needle| row.matches_filter(needle))
    };

    let page = if let Some(sort) = criteria.sort {
        // Sorted reads need every match in hand before paging.
        let mut matched = Vec::new();
        for entry in table.iter().map_err(|e| op_err("scan_rows", &e))? {
            let (_, value_guard) = entry.map_err(|e| op_err("scan_rows", &e))?;
            let row = codec.decode(&value_guard.value())?;
            if matches_filter(&row) {
                matched.push(row);
            }
        }
        matched.sort();
        if sort == SortDirection::Descending {
            matched.reverse();
        }
        let total = matched.len();
        let values: Vec<_> = matched
            .into_iter()
            .skip(criteria.page.offset)
            .take(criteria.page.length)
            .collect();
        ResultPage::new(values, criteria.page.offset, total)
    } else {
        // Unsorted reads stream in key order: collect only the page but
        // keep counting to report the exact total.
        let mut values = Vec::new();
        let mut total = 0_usize;
        for entry in table.iter().map_err(|e| op_err("scan_rows", &e))? {
            let (_, value_guard) = entry.map_err(|e| op_err("scan_rows", &e))?;
            let row = codec.decode(&value_guard.value())?;
            if !matches_filter(&row) {
                continue;
            }
            if total >= criteria.page.offset && values.len() < criteria.page.length {
                values.push(row);
            }
            total += 1;
        }
        ResultPage::new(values, criteria.page.offset, total)
    };

    Ok(DuplicateCheckRows { column_names, page })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::codec::RowHasher;
    use crate::dirs::StoreDirManager;
    use crate::models::PageRequest;
    use tempfile::TempDir;

    /// Forces every row onto one hash value, so every insert exercises the
    /// collision path.
    struct ConstantHasher;

    impl RowHasher for ConstantHasher {
        fn hash(&self, _bytes: &[u8]) -> u64 {
            123
        }
    }

    fn test_config(tmp: &TempDir) -> DuplicateStoreConfig {
        DuplicateStoreConfig::new(tmp.path())
    }

    fn open_store(tmp: &TempDir, rule_uuid: Uuid, codec: RowCodec) -> DuplicateStore {
        let config = test_config(tmp);
        let dirs = StoreDirManager::new(&config.root_dir).unwrap();
        let dir = dirs.dir(rule_uuid).unwrap();
        DuplicateStore::open(&dir, rule_uuid, codec, &config).unwrap()
    }

    fn row_a() -> DuplicateCheckRow {
        DuplicateCheckRow::of(["val1a", "val2a", "val3a"])
    }

    fn row_b() -> DuplicateCheckRow {
        DuplicateCheckRow::of(["val1b", "val2b", "val3b"])
    }

    fn row_c() -> DuplicateCheckRow {
        DuplicateCheckRow::of(["val1c", "val2c", "val3c"])
    }

    #[test]
    fn test_try_insert_at_most_once() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        assert!(store.try_insert(&row_a()).unwrap());
        assert!(store.try_insert(&row_b()).unwrap());
        assert!(!store.try_insert(&row_b()).unwrap());
        assert!(store.try_insert(&row_c()).unwrap());
        assert!(!store.try_insert(&row_a()).unwrap());
        assert!(!store.try_insert(&row_c()).unwrap());

        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 3);
        store.close();
    }

    #[test]
    fn test_collision_safety() {
        let tmp = TempDir::new().unwrap();
        let codec = RowCodec::with_hasher(Arc::new(ConstantHasher));
        let store = open_store(&tmp, Uuid::new_v4(), codec);

        assert!(store.try_insert(&row_a()).unwrap());
        assert!(store.try_insert(&row_b()).unwrap());
        assert!(!store.try_insert(&row_b()).unwrap());
        assert!(store.try_insert(&row_c()).unwrap());
        assert!(!store.try_insert(&row_a()).unwrap());
        assert!(!store.try_insert(&row_c()).unwrap());

        store.flush().unwrap();
        let rows = store
            .fetch_data(&FindDuplicateCheckCriteria::default())
            .unwrap();
        assert_eq!(rows.page.total, 3);
        let mut values = rows.page.values;
        values.sort();
        assert_eq!(values, vec![row_a(), row_b(), row_c()]);
        store.close();
    }

    #[test]
    fn test_reload_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let rule_uuid = Uuid::new_v4();

        let store = open_store(&tmp, rule_uuid, RowCodec::new());
        assert!(store.try_insert(&row_a()).unwrap());
        assert!(store.try_insert(&row_b()).unwrap());
        store.flush().unwrap();
        store.close();
        drop(store);

        let store = open_store(&tmp, rule_uuid, RowCodec::new());
        assert!(!store.try_insert(&row_a()).unwrap());
        assert!(!store.try_insert(&row_b()).unwrap());
        assert!(store.try_insert(&row_c()).unwrap());
        store.flush().unwrap();
        store.close();
    }

    #[test]
    fn test_reload_preserves_collision_discriminators() {
        let tmp = TempDir::new().unwrap();
        let rule_uuid = Uuid::new_v4();
        let codec = RowCodec::with_hasher(Arc::new(ConstantHasher));

        let store = open_store(&tmp, rule_uuid, codec.clone());
        assert!(store.try_insert(&row_a()).unwrap());
        assert!(store.try_insert(&row_b()).unwrap());
        store.flush().unwrap();
        store.close();
        drop(store);

        let store = open_store(&tmp, rule_uuid, codec);
        assert!(!store.try_insert(&row_a()).unwrap());
        assert!(!store.try_insert(&row_b()).unwrap());
        assert!(store.try_insert(&row_c()).unwrap());
        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 3);
        store.close();
    }

    #[test]
    fn test_column_names_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        assert_eq!(store.fetch_column_names().unwrap(), None);
        store
            .write_column_names(&["col1".to_string(), "col2".to_string()])
            .unwrap();
        assert_eq!(
            store.fetch_column_names().unwrap(),
            Some(vec!["col1".to_string(), "col2".to_string()])
        );
        store.close();
    }

    #[test]
    fn test_column_change_clears_rows() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        store
            .write_column_names(&["favouriteAnimal".to_string(), "favouriteThing".to_string()])
            .unwrap();
        assert!(store.try_insert(&DuplicateCheckRow::of(["lamb", "rolex"])).unwrap());
        assert!(store.try_insert(&DuplicateCheckRow::of(["cat", "bed"])).unwrap());
        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 2);

        // Unchanged rewrite is a no-op
        store
            .write_column_names(&["favouriteAnimal".to_string(), "favouriteThing".to_string()])
            .unwrap();
        assert_eq!(store.size().unwrap(), 2);

        // Changed columns clear everything
        store
            .write_column_names(&["favouriteFood".to_string(), "favouriteThing".to_string()])
            .unwrap();
        assert_eq!(store.size().unwrap(), 0);

        assert!(store.try_insert(&DuplicateCheckRow::of(["lamb", "rolex"])).unwrap());
        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 1);
        store.close();
    }

    #[test]
    fn test_delete_rows_then_reinsert() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        assert!(store.try_insert(&row_a()).unwrap());
        assert!(store.try_insert(&row_b()).unwrap());
        store.flush().unwrap();

        store.delete_rows(&[row_a()]).unwrap();
        // Deleting an absent row is fine
        store.delete_rows(&[row_a()]).unwrap();
        assert!(store.try_insert(&row_a()).unwrap());

        store.delete_rows(&[row_b()]).unwrap();
        assert!(store.try_insert(&row_b()).unwrap());
        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 2);
        store.close();
    }

    #[test]
    fn test_delete_rows_with_collisions() {
        let tmp = TempDir::new().unwrap();
        let codec = RowCodec::with_hasher(Arc::new(ConstantHasher));
        let store = open_store(&tmp, Uuid::new_v4(), codec);

        assert!(store.try_insert(&row_a()).unwrap());
        assert!(store.try_insert(&row_b()).unwrap());
        assert!(store.try_insert(&row_c()).unwrap());
        store.flush().unwrap();

        store.delete_rows(&[row_b()]).unwrap();
        assert_eq!(store.size().unwrap(), 2);

        // The colliding neighbours are untouched
        assert!(!store.try_insert(&row_a()).unwrap());
        assert!(!store.try_insert(&row_c()).unwrap());
        assert!(store.try_insert(&row_b()).unwrap());
        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 3);
        store.close();
    }

    #[test]
    fn test_large_values() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        let row = DuplicateCheckRow::of([
            "x".repeat(1_000),
            "y".repeat(10_000),
            "z".repeat(100_000),
        ]);
        assert!(store.try_insert(&row).unwrap());
        assert!(!store.try_insert(&row).unwrap());
        store.flush().unwrap();

        let rows = store
            .fetch_data(&FindDuplicateCheckCriteria::default())
            .unwrap();
        assert_eq!(rows.page.values, vec![row]);
        store.close();
    }

    #[test]
    fn test_fetch_data_filter_and_total() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        for i in 0..10 {
            let marker = if i % 2 == 0 { "even" } else { "odd" };
            assert!(
                store
                    .try_insert(&DuplicateCheckRow::of([format!("row{i}"), marker.to_string()]))
                    .unwrap()
            );
        }
        store.flush().unwrap();

        let criteria = FindDuplicateCheckCriteria::default()
            .with_filter("EVEN")
            .with_page(PageRequest::new(0, 3));
        let rows = store.fetch_data(&criteria).unwrap();
        assert_eq!(rows.page.values.len(), 3);
        assert_eq!(rows.page.total, 5);
        store.close();
    }

    #[test]
    fn test_fetch_data_sorted() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        for value in ["banana", "apple", "cherry"] {
            assert!(store.try_insert(&DuplicateCheckRow::of([value])).unwrap());
        }
        store.flush().unwrap();

        let rows = store
            .fetch_data(
                &FindDuplicateCheckCriteria::default().with_sort(SortDirection::Ascending),
            )
            .unwrap();
        let values: Vec<_> = rows
            .page
            .values
            .iter()
            .map(|r| r.values()[0].clone())
            .collect();
        assert_eq!(values, vec!["apple", "banana", "cherry"]);

        let rows = store
            .fetch_data(
                &FindDuplicateCheckCriteria::default().with_sort(SortDirection::Descending),
            )
            .unwrap();
        let values: Vec<_> = rows
            .page
            .values
            .iter()
            .map(|r| r.values()[0].clone())
            .collect();
        assert_eq!(values, vec!["cherry", "banana", "apple"]);
        store.close();
    }

    #[test]
    fn test_schema_version_mismatch_discards_store() {
        let tmp = TempDir::new().unwrap();
        let rule_uuid = Uuid::new_v4();
        let config = test_config(&tmp);
        let dirs = StoreDirManager::new(&config.root_dir).unwrap();
        let dir = dirs.dir(rule_uuid).unwrap();

        let store = DuplicateStore::open(&dir, rule_uuid, RowCodec::new(), &config).unwrap();
        store
            .write_column_names(&["foo".to_string(), "bar".to_string()])
            .unwrap();
        store.close();
        drop(store);

        // Strip the schema version entry, as an old-format store would lack it
        let db = Database::open(dir.db_path()).unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut info = txn.open_table(INFO_TABLE).unwrap();
            info.remove(INFO_SCHEMA_VERSION).unwrap();
        }
        txn.commit().unwrap();
        drop(db);

        // Reopening discards the unversioned database and starts fresh
        let store = DuplicateStore::open(&dir, rule_uuid, RowCodec::new(), &config).unwrap();
        assert_eq!(store.fetch_column_names().unwrap(), None);
        store.close();
        drop(store);

        // And the fresh store is stamped with the current version
        let db = Database::open(dir.db_path()).unwrap();
        assert_eq!(
            read_schema_version(&db).unwrap(),
            Some(CURRENT_SCHEMA_VERSION)
        );
    }

    #[test]
    fn test_valid_version_preserves_data_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let rule_uuid = Uuid::new_v4();
        let config = test_config(&tmp);
        let dirs = StoreDirManager::new(&config.root_dir).unwrap();
        let dir = dirs.dir(rule_uuid).unwrap();

        let store = DuplicateStore::open(&dir, rule_uuid, RowCodec::new(), &config).unwrap();
        store
            .write_column_names(&["foo".to_string(), "bar".to_string()])
            .unwrap();
        store.close();
        drop(store);

        let store = DuplicateStore::open(&dir, rule_uuid, RowCodec::new(), &config).unwrap();
        assert_eq!(
            store.fetch_column_names().unwrap(),
            Some(vec!["foo".to_string(), "bar".to_string()])
        );
        store.close();
    }

    #[test]
    fn test_background_write_failure_reported_at_flush() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Uuid::new_v4(), RowCodec::new());

        assert!(store.try_insert(&row_a()).unwrap());
        store.inject_write_failure("no space left on device").unwrap();

        // The error is visible through the peek accessor once recorded,
        // and peeking does not consume it
        for _ in 0..500 {
            if store.write_error().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(store.write_error().unwrap().contains("no space left on device"));
        assert!(store.write_error().is_some());

        // The next flush reports the failure and consumes it
        let err = store.flush().unwrap_err();
        assert!(err.to_string().contains("no space left on device"));
        assert!(store.write_error().is_none());

        // The "new" decision already returned is not retracted, even though
        // the failed batch lost the durable write
        assert!(!store.try_insert(&row_a()).unwrap());
        assert_eq!(store.size().unwrap(), 0);

        // Later rows are unaffected
        assert!(store.try_insert(&row_b()).unwrap());
        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 1);
        store.close();
    }

    #[test]
    fn test_concurrent_inserts_single_winner() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(open_store(&tmp, Uuid::new_v4(), RowCodec::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.try_insert(&DuplicateCheckRow::of(["shared", "content"])).unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);

        store.flush().unwrap();
        assert_eq!(store.size().unwrap(), 1);
        store.close();
    }

    #[test]
    fn test_read_helpers_without_session() {
        let tmp = TempDir::new().unwrap();
        let rule_uuid = Uuid::new_v4();
        let config = test_config(&tmp);
        let dirs = StoreDirManager::new(&config.root_dir).unwrap();
        let dir = dirs.dir(rule_uuid).unwrap();

        // Nothing on disk yet
        assert_eq!(DuplicateStore::read_column_names(&dir).unwrap(), None);

        let store = DuplicateStore::open(&dir, rule_uuid, RowCodec::new(), &config).unwrap();
        store.write_column_names(&["col1".to_string()]).unwrap();
        store.try_insert(&row_a()).unwrap();
        store.flush().unwrap();
        store.close();
        drop(store);

        assert_eq!(
            DuplicateStore::read_column_names(&dir).unwrap(),
            Some(vec!["col1".to_string()])
        );
        let rows = DuplicateStore::read_data(
            &dir,
            &RowCodec::new(),
            &FindDuplicateCheckCriteria::default(),
        )
        .unwrap();
        assert_eq!(rows.page.total, 1);
    }
}
