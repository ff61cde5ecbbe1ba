//! Error type for the neighbour search.

use thiserror::Error;

use crate::SearchBackend;

/// Failures that abort a search stage.
#[derive(Debug, Error)]
pub enum SearchError {
    /// A scratch buffer could not be allocated.
    #[error("failed to allocate {what} scratch buffer for {count} particles")]
    ScratchAllocation {
        /// Which buffer
        what: &'static str,
        /// Requested element count
        count: usize,
    },
    /// The configured backend is not built into this crate.
    #[error("neighbour search backend {0:?} is not available")]
    UnsupportedBackend(SearchBackend),
}
