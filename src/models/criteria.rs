//! Read-query request and response types.

use serde::{Deserialize, Serialize};

use super::row::DuplicateCheckRow;

/// A page window over a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Number of matching rows to skip.
    pub offset: usize,
    /// Maximum number of rows to return.
    pub length: usize,
}

impl PageRequest {
    /// Creates a page request.
    #[must_use]
    pub const fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// A page request that returns everything.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            offset: 0,
            length: usize::MAX,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Sort direction for fetched rows.
///
/// Rows compare by their ordered column values. When no sort is requested,
/// rows come back in durable key order (hash, then discriminator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending by column values.
    Ascending,
    /// Descending by column values.
    Descending,
}

/// Criteria for fetching stored duplicate-check rows.
///
/// # Example
///
/// ```rust
/// use dupstore::{FindDuplicateCheckCriteria, PageRequest};
///
/// let criteria = FindDuplicateCheckCriteria::default()
///     .with_page(PageRequest::new(0, 100))
///     .with_filter("host-1");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindDuplicateCheckCriteria {
    /// The page window to return.
    pub page: PageRequest,
    /// Optional case-insensitive substring filter applied to every value.
    pub filter: Option<String>,
    /// Optional sort over the matching rows.
    pub sort: Option<SortDirection>,
}

impl FindDuplicateCheckCriteria {
    /// Sets the page window.
    #[must_use]
    pub const fn with_page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }

    /// Sets the quick filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Sets the sort direction.
    #[must_use]
    pub const fn with_sort(mut self, sort: SortDirection) -> Self {
        self.sort = Some(sort);
        self
    }
}

/// One page of results plus the exact total over all matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPage<T> {
    /// The rows in this page.
    pub values: Vec<T>,
    /// The page offset the rows were taken from.
    pub offset: usize,
    /// Total number of matching rows across all pages.
    pub total: usize,
}

impl<T> ResultPage<T> {
    /// Creates a result page.
    #[must_use]
    pub const fn new(values: Vec<T>, offset: usize, total: usize) -> Self {
        Self {
            values,
            offset,
            total,
        }
    }
}

/// The response to a duplicate-check data fetch: the rule's column names and
/// one page of stored rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCheckRows {
    /// Ordered column names for the rule, empty if none were ever written.
    pub column_names: Vec<String>,
    /// The requested page of stored rows.
    pub page: ResultPage<DuplicateCheckRow>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_unlimited_page() {
        let page = PageRequest::unlimited();
        assert_eq!(page.offset, 0);
        assert_eq!(page.length, usize::MAX);
    }

    #[test]
    fn test_criteria_builder() {
        let criteria = FindDuplicateCheckCriteria::default()
            .with_page(PageRequest::new(10, 20))
            .with_filter("abc")
            .with_sort(SortDirection::Descending);
        assert_eq!(criteria.page.offset, 10);
        assert_eq!(criteria.page.length, 20);
        assert_eq!(criteria.filter.as_deref(), Some("abc"));
        assert_eq!(criteria.sort, Some(SortDirection::Descending));
    }
}
