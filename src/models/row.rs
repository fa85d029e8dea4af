//! Row and rule-identity types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One ordered row of output column values produced by a rule evaluation.
///
/// A row is a fixed-arity sequence of string values, one per compiled output
/// column. Rows are transient and caller-owned; the store keeps its own
/// canonical serialization of every recorded row.
///
/// # Example
///
/// ```rust
/// use dupstore::DuplicateCheckRow;
///
/// let row = DuplicateCheckRow::of(["jbloggs", "host-1", "login"]);
/// assert_eq!(row.values().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DuplicateCheckRow {
    values: Vec<String>,
}

impl DuplicateCheckRow {
    /// Creates a row from an ordered list of column values.
    #[must_use]
    pub const fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    /// Creates a row from anything yielding string-like values.
    #[must_use]
    pub fn of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the ordered column values.
    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Returns true if any value contains `needle`, ignoring case.
    ///
    /// Used by read queries to apply the optional quick-filter.
    #[must_use]
    pub fn matches_filter(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.values
            .iter()
            .any(|v| v.to_lowercase().contains(&needle))
    }
}

/// The identity a duplicate-check session is opened for.
///
/// A rule UUID plus the compiled output column names in effect when the
/// session was opened. Two sessions for the same UUID but different column
/// schemas are not interchangeable: a schema change invalidates the
/// positional layout of previously stored rows, so checking a session out
/// with changed columns clears the stored data for that rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleIdentity {
    /// The rule's UUID, which names the on-disk store directory.
    pub rule_uuid: Uuid,
    /// Ordered output column names from the rule's compiled query.
    pub column_names: Vec<String>,
}

impl RuleIdentity {
    /// Creates a rule identity.
    #[must_use]
    pub const fn new(rule_uuid: Uuid, column_names: Vec<String>) -> Self {
        Self {
            rule_uuid,
            column_names,
        }
    }
}
