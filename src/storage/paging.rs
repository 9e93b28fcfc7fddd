//! Paging parameters and result pages.

use crate::config::ConfigParams;
use serde::{Deserialize, Serialize};

/// Default upper bound on rows per page.
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 100;

/// Paging request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingParams {
    /// Rows to skip; unset means start at the beginning.
    pub skip: Option<u64>,
    /// Rows to return; unset means the maximum page size.
    pub take: Option<u64>,
    /// Whether the total count is requested.
    #[serde(default)]
    pub total: bool,
}

impl PagingParams {
    /// Creates paging parameters.
    #[must_use]
    pub const fn new(skip: Option<u64>, take: Option<u64>, total: bool) -> Self {
        Self { skip, take, total }
    }

    /// Reads `skip`, `take` and `total` from flat parameters.
    #[must_use]
    pub fn from_config(params: &ConfigParams) -> Self {
        Self {
            skip: params.get_as_u64("skip"),
            take: params.get_as_u64("take"),
            total: params.get_as_bool_or("total", false),
        }
    }

    /// Returns `skip`, or zero.
    #[must_use]
    pub fn skip_or_zero(&self) -> u64 {
        self.skip.unwrap_or(0)
    }

    /// Returns `take` clamped to `max_page_size`.
    #[must_use]
    pub fn take_clamped(&self, max_page_size: u64) -> u64 {
        self.take.map_or(max_page_size, |t| t.min(max_page_size))
    }
}

/// A page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPage<T> {
    /// Rows in query order.
    pub data: Vec<T>,
    /// Total matching rows, present only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl<T> DataPage<T> {
    /// Creates a page.
    #[must_use]
    pub const fn new(data: Vec<T>, total: Option<u64>) -> Self {
        Self { data, total }
    }

    /// Returns the number of rows in the page.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the page has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<T> Default for DataPage<T> {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}
