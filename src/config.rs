//! Configuration for the duplicate-detection store.

use std::path::PathBuf;

/// Configuration for store directories, the session pool, and the writer.
///
/// # Example
///
/// ```rust
/// use dupstore::DuplicateStoreConfig;
///
/// let config = DuplicateStoreConfig::new("/var/lib/dupstore")
///     .with_max_open_stores(32);
/// ```
#[derive(Debug, Clone)]
pub struct DuplicateStoreConfig {
    /// Root directory under which each rule gets its own store directory.
    pub root_dir: PathBuf,
    /// Maximum number of concurrently open store sessions in the pool.
    ///
    /// Checked-out sessions are never evicted, so the pool may temporarily
    /// exceed this bound while more than this many rules are evaluating.
    pub max_open_stores: usize,
    /// Number of queued puts the writer applies before committing a write
    /// transaction. A flush barrier always commits regardless of this count.
    pub max_puts_before_commit: usize,
}

impl DuplicateStoreConfig {
    /// Creates a configuration with defaults and the given root directory.
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_open_stores: 10,
            max_puts_before_commit: 100,
        }
    }

    /// Sets the maximum number of open store sessions (minimum 1).
    #[must_use]
    pub fn with_max_open_stores(mut self, max_open_stores: usize) -> Self {
        self.max_open_stores = max_open_stores.max(1);
        self
    }

    /// Sets the writer commit batch size (minimum 1).
    #[must_use]
    pub fn with_max_puts_before_commit(mut self, max_puts_before_commit: usize) -> Self {
        self.max_puts_before_commit = max_puts_before_commit.max(1);
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `DUPSTORE_ROOT_DIR` | Store root directory | `./dupstore` |
    /// | `DUPSTORE_MAX_OPEN_STORES` | Max pooled sessions | 10 |
    /// | `DUPSTORE_MAX_PUTS_BEFORE_COMMIT` | Writer commit batch size | 100 |
    #[must_use]
    pub fn from_env() -> Self {
        Self::new("./dupstore").with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    // Lookup seam so the override rules are testable without mutating the
    // process environment.
    fn with_overrides_from(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = get("DUPSTORE_ROOT_DIR")
            && !v.is_empty()
        {
            self.root_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DUPSTORE_MAX_OPEN_STORES")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_open_stores = parsed.max(1);
        }
        if let Some(v) = get("DUPSTORE_MAX_PUTS_BEFORE_COMMIT")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_puts_before_commit = parsed.max(1);
        }
        self
    }
}
