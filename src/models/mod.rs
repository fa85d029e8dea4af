//! Core data types for the duplicate-detection store.

mod criteria;
mod row;

pub use criteria::{
    DuplicateCheckRows, FindDuplicateCheckCriteria, PageRequest, ResultPage, SortDirection,
};
pub use row::{DuplicateCheckRow, RuleIdentity};
