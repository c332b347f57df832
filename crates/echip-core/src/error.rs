//! Error types for echip-core

use thiserror::Error;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or building a memory image
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The image does not have exactly 256 pages
    #[error("Invalid structure: expected {expected} pages, found {found}")]
    PageCount {
        /// Number of pages a chip image holds
        expected: usize,
        /// Number of pages supplied
        found: usize,
    },

    /// A non-empty page failed its CRC16 check
    #[error("Invalid structure: page {page} failed CRC16 check")]
    Checksum {
        /// Index of the failing page
        page: usize,
    },

    /// A record chain did not terminate within the chip's capacity
    #[error("Invalid structure: record chain of model {model} does not terminate")]
    RecordChain {
        /// Model id (hex) whose chain is broken
        model: String,
    },

    /// Too many models or records to fit on a chip
    #[error("Capacity exceeded: {directories} models / {records} records (max {max_directories} / {max_records})")]
    CapacityExceeded {
        /// Requested number of models
        directories: usize,
        /// Requested number of records
        records: usize,
        /// Directory slots available
        max_directories: usize,
        /// Record pages available
        max_records: usize,
    },

    /// A set's serial string could not be encoded
    #[error("Invalid serial string: {0:?}")]
    InvalidSerial(String),

    /// A set's time does not fit the chip's 32-bit seconds field
    #[error("Time out of range: {0}")]
    TimeOutOfRange(String),

    /// A hex identifier (model id or version tag) could not be parsed
    #[error("Invalid hex identifier: {0:?}")]
    InvalidHex(String),
}

impl Error {
    /// Whether this error describes a malformed image (as opposed to bad input
    /// handed to the builder)
    pub fn is_invalid_structure(&self) -> bool {
        matches!(
            self,
            Error::PageCount { .. } | Error::Checksum { .. } | Error::RecordChain { .. }
        )
    }
}
