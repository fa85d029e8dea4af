//! Single-writer durable queue for one store.
//!
//! Every open [`super::DuplicateStore`] owns one writer thread. Callers get
//! their dedup decision from the in-memory index and never wait on disk; the
//! writer applies the queued puts in enqueue order, committing a write
//! transaction every `max_puts_before_commit` puts and at every barrier.
//!
//! A failed background write never blocks later rows: the error is recorded
//! and handed to the caller at the next flush barrier, and the current
//! transaction is aborted so the database stays consistent.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use redb::{Database, TableDefinition, WriteTransaction};
use tracing::{debug, error, trace};

use super::acquire_lock;
use crate::codec::CONTENT_KEY_LEN;
use crate::{Error, Result};

/// Durable row entries: encoded content key -> canonical row serialization.
pub(crate) const ROWS_TABLE: TableDefinition<'_, &'_ [u8; CONTENT_KEY_LEN], Vec<u8>> =
    TableDefinition::new("rows");

/// Store metadata: info key -> encoded value.
pub(crate) const INFO_TABLE: TableDefinition<'_, u8, Vec<u8>> = TableDefinition::new("info");

/// Info key holding the store schema version.
pub(crate) const INFO_SCHEMA_VERSION: u8 = 0;
/// Info key holding the encoded column-name header.
pub(crate) const INFO_COLUMN_NAMES: u8 = 1;

/// A unit of work for the writer thread.
pub(crate) enum WriteTask {
    /// Record one row under its content key.
    PutRow {
        /// Encoded content key bytes.
        key: [u8; CONTENT_KEY_LEN],
        /// Canonical row serialization.
        value: Vec<u8>,
    },
    /// Remove one row by content key.
    DeleteRow {
        /// Encoded content key bytes.
        key: [u8; CONTENT_KEY_LEN],
    },
    /// Write a metadata entry.
    PutInfo {
        /// Info key.
        key: u8,
        /// Encoded value.
        value: Vec<u8>,
    },
    /// Drop every row entry, keeping metadata.
    ClearRows,
    /// Commit everything queued so far and reply with the error recorded
    /// since the previous barrier, if any.
    Barrier(Sender<Option<String>>),
    /// Test-only: fail inside the writer, as a real storage error would.
    #[cfg(test)]
    Fail {
        /// Reported cause.
        cause: String,
    },
}

/// Handle to a store's writer thread.
pub(crate) struct StoreWriter {
    tx: Mutex<Option<Sender<WriteTask>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl StoreWriter {
    /// Spawns the writer thread for a database.
    pub(crate) fn spawn(db: Arc<Database>, max_puts_before_commit: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let last_error = Arc::new(Mutex::new(None));
        let thread_error = Arc::clone(&last_error);

        let handle = std::thread::Builder::new()
            .name("dupstore-writer".to_string())
            .spawn(move || run(&db, max_puts_before_commit, &thread_error, &rx))
            .map_err(|e| Error::OperationFailed {
                operation: "spawn_store_writer".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            last_error,
        })
    }

    /// Enqueues a task for the writer thread.
    pub(crate) fn submit(&self, task: WriteTask) -> Result<()> {
        let guard = acquire_lock(&self.tx);
        let tx = guard.as_ref().ok_or_else(|| Error::OperationFailed {
            operation: "submit_write".to_string(),
            cause: "store writer is closed".to_string(),
        })?;
        tx.send(task).map_err(|_| Error::OperationFailed {
            operation: "submit_write".to_string(),
            cause: "store writer thread has stopped".to_string(),
        })
    }

    /// Durability barrier: blocks until every previously enqueued write is
    /// committed, then reports any background write error recorded since the
    /// previous barrier.
    pub(crate) fn barrier(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.submit(WriteTask::Barrier(reply_tx))?;
        let outcome = reply_rx.recv().map_err(|_| Error::OperationFailed {
            operation: "flush".to_string(),
            cause: "store writer thread stopped before the barrier completed".to_string(),
        })?;
        match outcome {
            None => Ok(()),
            Some(cause) => Err(Error::OperationFailed {
                operation: "flush".to_string(),
                cause,
            }),
        }
    }

    /// Peeks at the most recent background write error without clearing it.
    pub(crate) fn last_error(&self) -> Option<String> {
        acquire_lock(&self.last_error).clone()
    }

    /// Stops the writer, letting queued writes complete and commit first.
    ///
    /// Idempotent; later calls are no-ops.
    pub(crate) fn close(&self) {
        let tx = acquire_lock(&self.tx).take();
        drop(tx);
        let handle = acquire_lock(&self.handle).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("Store writer thread panicked during shutdown");
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writer thread main loop.
fn run(
    db: &Database,
    max_puts_before_commit: usize,
    last_error: &Mutex<Option<String>>,
    rx: &Receiver<WriteTask>,
) {
    let mut pending: Option<WriteTransaction> = None;
    let mut uncommitted = 0_usize;

    while let Ok(task) = rx.recv() {
        match task {
            WriteTask::Barrier(reply) => {
                if let Err(cause) = commit_pending(&mut pending, &mut uncommitted) {
                    record_error(last_error, &cause);
                }
                let outcome = acquire_lock(last_error).take();
                // The flush caller may have given up waiting; nothing to do
                // if the reply channel is gone.
                let _ = reply.send(outcome);
            },
            task => {
                match apply(db, &mut pending, task) {
                    Ok(()) => {
                        uncommitted += 1;
                        if uncommitted >= max_puts_before_commit {
                            trace!(uncommitted, "Committing write batch");
                            if let Err(cause) = commit_pending(&mut pending, &mut uncommitted) {
                                record_error(last_error, &cause);
                            }
                        }
                    },
                    Err(cause) => {
                        record_error(last_error, &cause);
                        // Abort the batch so a partially applied transaction
                        // never commits.
                        if let Some(txn) = pending.take() {
                            let _ = txn.abort();
                        }
                        uncommitted = 0;
                    },
                }
            },
        }
    }

    // Channel closed: graceful drain. Queued writes were already applied
    // above; commit whatever remains so no reported decision is lost.
    if let Err(cause) = commit_pending(&mut pending, &mut uncommitted) {
        record_error(last_error, &cause);
    }
    debug!("Store writer stopped");
}

/// Applies one mutating task inside the pending transaction, opening one if
/// none is in progress.
fn apply(
    db: &Database,
    pending: &mut Option<WriteTransaction>,
    task: WriteTask,
) -> std::result::Result<(), String> {
    if pending.is_none() {
        let txn = db
            .begin_write()
            .map_err(|e| format!("begin write transaction: {e}"))?;
        *pending = Some(txn);
    }
    let Some(txn) = pending.as_ref() else {
        return Err("write transaction unavailable".to_string());
    };

    match task {
        WriteTask::PutRow { key, value } => {
            let mut table = txn
                .open_table(ROWS_TABLE)
                .map_err(|e| format!("open rows table: {e}"))?;
            table
                .insert(&key, value)
                .map_err(|e| format!("put row: {e}"))?;
        },
        WriteTask::DeleteRow { key } => {
            let mut table = txn
                .open_table(ROWS_TABLE)
                .map_err(|e| format!("open rows table: {e}"))?;
            table
                .remove(&key)
                .map_err(|e| format!("delete row: {e}"))?;
        },
        WriteTask::PutInfo { key, value } => {
            let mut table = txn
                .open_table(INFO_TABLE)
                .map_err(|e| format!("open info table: {e}"))?;
            table
                .insert(key, value)
                .map_err(|e| format!("put info entry: {e}"))?;
        },
        WriteTask::ClearRows => {
            txn.delete_table(ROWS_TABLE)
                .map_err(|e| format!("clear rows table: {e}"))?;
        },
        WriteTask::Barrier(_) => {
            // Handled in the main loop before reaching here.
        },
        #[cfg(test)]
        WriteTask::Fail { cause } => return Err(cause),
    }
    Ok(())
}

/// Commits the pending transaction, if any.
fn commit_pending(
    pending: &mut Option<WriteTransaction>,
    uncommitted: &mut usize,
) -> std::result::Result<(), String> {
    *uncommitted = 0;
    if let Some(txn) = pending.take() {
        txn.commit().map_err(|e| format!("commit write batch: {e}"))?;
    }
    Ok(())
}

/// Records a background write error, keeping the first one since the last
/// barrier. The first error usually names the root cause; later ones are
/// noise from the same broken batch.
fn record_error(last_error: &Mutex<Option<String>>, cause: &str) {
    error!(cause, "Background write failed");
    metrics::counter!("dupstore_write_errors_total").increment(1);
    let mut slot = acquire_lock(last_error);
    if slot.is_none() {
        *slot = Some(cause.to_string());
    }
}
