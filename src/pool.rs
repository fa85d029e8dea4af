//! Bounded pool of open duplicate-check sessions.
//!
//! Rule evaluation checks a session out per batch; the pool keeps sessions
//! open across batches so the in-memory index is not rebuilt on every use,
//! and caps how many are open at once. Checked-out sessions are pinned:
//! eviction only ever touches idle ones, so the pool can temporarily exceed
//! its bound while more rules than the cap are evaluating concurrently.
//!
//! The pool is also the sole arbiter of directory exclusivity. The embedded
//! database allows one open handle per directory, so a per-rule lock
//! serializes transient read-only opens against checkouts of the same
//! directory. Metadata queries flush or scan outside the shared sessions
//! lock, so a slow query for one rule never blocks another rule's checkout.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::codec::RowCodec;
use crate::config::DuplicateStoreConfig;
use crate::dirs::StoreDirManager;
use crate::models::{DuplicateCheckRows, FindDuplicateCheckCriteria, ResultPage, RuleIdentity};
use crate::store::{DuplicateStore, acquire_lock};
use crate::Result;

struct PoolEntry {
    store: Arc<DuplicateStore>,
    refs: usize,
}

/// Pool of open [`DuplicateStore`] sessions, one per rule at most.
///
/// # Example
///
/// ```rust,no_run
/// use dupstore::{DuplicateCheckRow, DuplicateStoreConfig, RuleIdentity, StorePool};
/// use uuid::Uuid;
///
/// # fn main() -> dupstore::Result<()> {
/// let pool = StorePool::new(DuplicateStoreConfig::new("./dupstore"))?;
/// let identity = RuleIdentity::new(Uuid::new_v4(), vec!["user".into()]);
///
/// let store = pool.checkout(&identity)?;
/// if store.try_insert(&DuplicateCheckRow::of(["jbloggs"]))? {
///     // first sighting
/// }
/// store.flush()?;
/// # Ok(())
/// # }
/// ```
pub struct StorePool {
    config: DuplicateStoreConfig,
    dirs: StoreDirManager,
    codec: RowCodec,
    sessions: Mutex<LruCache<Uuid, PoolEntry>>,
    // One lock per rule ever touched; taken before opening the rule's
    // directory, pooled or transient.
    dir_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl StorePool {
    /// Creates a pool over the configured root directory, creating the root
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(config: DuplicateStoreConfig) -> Result<Self> {
        Self::with_codec(config, RowCodec::new())
    }

    /// Creates a pool with a custom codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn with_codec(config: DuplicateStoreConfig, codec: RowCodec) -> Result<Self> {
        let dirs = StoreDirManager::new(&config.root_dir)?;
        Ok(Self {
            config,
            dirs,
            codec,
            sessions: Mutex::new(LruCache::unbounded()),
            dir_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The directory manager the pool opens stores through.
    ///
    /// Exposed for the maintenance job, which lists and deletes orphaned
    /// store directories (see [`StoreDirManager::reconcile`]).
    #[must_use]
    pub const fn dir_manager(&self) -> &StoreDirManager {
        &self.dirs
    }

    /// Checks out the session for a rule, opening it if absent.
    ///
    /// The returned guard pins the session for its lifetime; dropping it
    /// checks the session back in. The rule's column names are written (or
    /// verified) on every checkout, so a schema change takes effect the next
    /// time the rule evaluates, clearing stored rows that no longer match
    /// the positional layout.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if the store cannot be opened; only
    /// this rule is affected.
    #[instrument(skip(self, identity), fields(operation = "checkout", rule_uuid = %identity.rule_uuid))]
    pub fn checkout(&self, identity: &RuleIdentity) -> Result<CheckedOutStore<'_>> {
        let dir_lock = self.dir_lock(identity.rule_uuid);
        let store = {
            let _dir_guard = acquire_lock(&dir_lock);
            let mut sessions = acquire_lock(&self.sessions);
            if let Some(entry) = sessions.get_mut(&identity.rule_uuid) {
                entry.refs += 1;
                Arc::clone(&entry.store)
            } else {
                let dir = self.dirs.dir(identity.rule_uuid)?;
                let store = Arc::new(DuplicateStore::open(
                    &dir,
                    identity.rule_uuid,
                    self.codec.clone(),
                    &self.config,
                )?);
                debug!(rule_uuid = %identity.rule_uuid, "Opened duplicate store session");
                sessions.put(
                    identity.rule_uuid,
                    PoolEntry {
                        store: Arc::clone(&store),
                        refs: 1,
                    },
                );
                Self::evict_idle(&mut sessions, self.config.max_open_stores);
                store
            }
        };

        // Outside the pool lock: a column change flushes, which can block.
        // An error here drops the guard, checking the session back in.
        let guard = CheckedOutStore { pool: self, store };
        guard.write_column_names(&identity.column_names)?;
        Ok(guard)
    }

    /// Reads a rule's column-name header, with or without an open session.
    ///
    /// A pooled session is flushed first so the header reflects every
    /// earlier write. Rules with no session are answered by a transient
    /// open; rules that never stored anything yield `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    #[instrument(skip(self), fields(operation = "fetch_column_names"))]
    pub fn fetch_column_names(&self, rule_uuid: Uuid) -> Result<Option<Vec<String>>> {
        let dir_lock = self.dir_lock(rule_uuid);
        let dir_guard = acquire_lock(&dir_lock);
        if let Some(store) = self.pin_session(rule_uuid) {
            // Pinned: the session cannot be evicted mid-query
            drop(dir_guard);
            store.flush()?;
            return store.fetch_column_names();
        }
        // The per-rule lock keeps checkouts for this directory out until the
        // transient open is finished.
        match self.dirs.existing_dir(rule_uuid) {
            Some(dir) => DuplicateStore::read_column_names(&dir),
            None => Ok(None),
        }
    }

    /// Fetches a page of a rule's stored rows, with or without an open
    /// session.
    ///
    /// Same session handling as [`Self::fetch_column_names`]. Rules that
    /// never stored anything yield an empty page with a total of zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    #[instrument(skip(self, criteria), fields(operation = "fetch_data"))]
    pub fn fetch_data(
        &self,
        rule_uuid: Uuid,
        criteria: &FindDuplicateCheckCriteria,
    ) -> Result<DuplicateCheckRows> {
        let dir_lock = self.dir_lock(rule_uuid);
        let dir_guard = acquire_lock(&dir_lock);
        if let Some(store) = self.pin_session(rule_uuid) {
            drop(dir_guard);
            store.flush()?;
            return store.fetch_data(criteria);
        }
        match self.dirs.existing_dir(rule_uuid) {
            Some(dir) => DuplicateStore::read_data(&dir, &self.codec, criteria),
            None => Ok(DuplicateCheckRows {
                column_names: Vec::new(),
                page: ResultPage::new(Vec::new(), criteria.page.offset, 0),
            }),
        }
    }

    /// Number of sessions currently open, checked out or idle.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        acquire_lock(&self.sessions).len()
    }

    /// Closes every open session, draining queued writes first.
    ///
    /// Intended for shutdown, after rule evaluation has stopped and every
    /// guard has been dropped.
    pub fn close_all(&self) {
        let mut sessions = acquire_lock(&self.sessions);
        while let Some((rule_uuid, entry)) = sessions.pop_lru() {
            if entry.refs > 0 {
                warn!(
                    rule_uuid = %rule_uuid,
                    refs = entry.refs,
                    "Closing duplicate store session that is still checked out"
                );
            }
            entry.store.close();
        }
        metrics::gauge!("dupstore_open_sessions").set(0.0);
    }

    /// The serialization lock for one rule's directory.
    fn dir_lock(&self, rule_uuid: Uuid) -> Arc<Mutex<()>> {
        let mut locks = acquire_lock(&self.dir_locks);
        Arc::clone(locks.entry(rule_uuid).or_default())
    }

    /// Pins the pooled session for a rule, if one is open. The returned
    /// guard checks it back in on drop, like a regular checkout.
    fn pin_session(&self, rule_uuid: Uuid) -> Option<CheckedOutStore<'_>> {
        let mut sessions = acquire_lock(&self.sessions);
        let entry = sessions.get_mut(&rule_uuid)?;
        entry.refs += 1;
        Some(CheckedOutStore {
            pool: self,
            store: Arc::clone(&entry.store),
        })
    }

    fn checkin(&self, rule_uuid: Uuid) {
        let mut sessions = acquire_lock(&self.sessions);
        if let Some(entry) = sessions.peek_mut(&rule_uuid) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        Self::evict_idle(&mut sessions, self.config.max_open_stores);
    }

    /// Closes least-recently-used idle sessions until the pool is within its
    /// bound. Checked-out sessions are never touched, so the pool stays over
    /// the bound while too many rules hold sessions at once.
    fn evict_idle(sessions: &mut LruCache<Uuid, PoolEntry>, max_open: usize) {
        while sessions.len() > max_open {
            let victim = sessions
                .iter()
                .map(|(rule_uuid, entry)| (*rule_uuid, entry.refs))
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .find_map(|(rule_uuid, refs)| (refs == 0).then_some(rule_uuid));
            let Some(rule_uuid) = victim else {
                break;
            };
            if let Some(entry) = sessions.pop(&rule_uuid) {
                entry.store.close();
                debug!(rule_uuid = %rule_uuid, "Evicted idle duplicate store session");
            }
        }
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("dupstore_open_sessions").set(sessions.len() as f64);
    }
}

impl fmt::Debug for StorePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorePool")
            .field("root_dir", &self.config.root_dir)
            .field("max_open_stores", &self.config.max_open_stores)
            .finish_non_exhaustive()
    }
}

/// A checked-out session, pinned in the pool until dropped.
///
/// Dereferences to [`DuplicateStore`], so store operations are called
/// directly on the guard.
pub struct CheckedOutStore<'a> {
    pool: &'a StorePool,
    store: Arc<DuplicateStore>,
}

impl Deref for CheckedOutStore<'_> {
    type Target = DuplicateStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl Drop for CheckedOutStore<'_> {
    fn drop(&mut self) {
        self.pool.checkin(self.store.rule_uuid());
    }
}

impl fmt::Debug for CheckedOutStore<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedOutStore")
            .field("rule_uuid", &self.store.rule_uuid())
            .finish_non_exhaustive()
    }
}
