//! # dupstore
//!
//! Per-rule duplicate-detection store for streaming analytics rules.
//!
//! Each detection rule gets its own embedded key-value database on disk.
//! When a rule produces an output row, [`DuplicateStore::try_insert`] decides
//! synchronously whether an equivalent row was already recorded, so that
//! downstream notifications fire at most once per distinct detection. The
//! durable write happens behind the decision on a dedicated writer thread;
//! [`DuplicateStore::flush`] is the barrier that makes prior decisions
//! durable and visible to readers.
//!
//! ## Architecture
//!
//! - **Codec**: canonical row serialization and the 64-bit content hash that
//!   forms the durable key ([`codec`]).
//! - **Directories**: one store directory per rule UUID, plus reconciliation
//!   of on-disk directories against the live rule set ([`dirs`]).
//! - **Store**: one open session per rule with an in-memory collision index
//!   and a single-writer durable queue ([`store`]).
//! - **Pool**: bounded, reference-counted cache of open sessions with
//!   metadata queries that work without a live session ([`pool`]).
//!
//! ## Example
//!
//! ```rust,ignore
//! use dupstore::{DuplicateCheckRow, DuplicateStoreConfig, RuleIdentity, StorePool};
//!
//! let pool = StorePool::new(DuplicateStoreConfig::new("./dupstore"))?;
//! let identity = RuleIdentity::new(rule_uuid, vec!["user".into(), "host".into()]);
//! let store = pool.checkout(&identity)?;
//!
//! if store.try_insert(&DuplicateCheckRow::of(["jbloggs", "host-1"]))? {
//!     // first sighting, emit the notification
//! }
//! store.flush()?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use thiserror::Error as ThisError;

// Module declarations
pub mod codec;
pub mod config;
pub mod dirs;
pub mod models;
pub mod pool;
pub mod store;

// Re-exports for convenience
pub use codec::{ContentKey, RowCodec, RowHasher};
pub use config::DuplicateStoreConfig;
pub use dirs::{StoreDir, StoreDirManager};
pub use models::{
    DuplicateCheckRow, DuplicateCheckRows, FindDuplicateCheckCriteria, PageRequest, ResultPage,
    RuleIdentity, SortDirection,
};
pub use pool::{CheckedOutStore, StorePool};
pub use store::DuplicateStore;

/// Error type for dupstore operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Oversized row values, truncated or non-UTF-8 stored bytes |
/// | `OperationFailed` | Embedded database errors, filesystem I/O errors, failed background writes reported at the flush barrier |
/// | `StoreUnavailable` | The store directory for a rule cannot be created or opened |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - A row value exceeds the encodable size limit
    /// - Stored bytes are truncated or not valid UTF-8 when decoding
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - Embedded database transactions fail
    /// - Filesystem operations on store directories fail
    /// - A background write failed since the last flush barrier
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A rule's store could not be opened.
    ///
    /// Fatal for that rule's session only; other rules are unaffected.
    #[error("duplicate store for rule {rule_uuid} unavailable: {cause}")]
    StoreUnavailable {
        /// The rule whose store failed to open.
        rule_uuid: uuid::Uuid,
        /// The underlying cause.
        cause: String,
    },
}

/// Result type alias for dupstore operations.
pub type Result<T> = std::result::Result<T, Error>;
