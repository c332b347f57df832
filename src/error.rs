//! Error types for chip access

use echip_ds2490::Retryable;
use thiserror::Error;

/// Result type for chip operations
pub type Result<T> = std::result::Result<T, ChipError>;

/// Errors raised by the chip façade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChipError {
    /// The bus engine failed
    #[error(transparent)]
    Adapter(#[from] echip_ds2490::Error),

    /// The memory image could not be parsed or built
    #[error(transparent)]
    Codec(#[from] echip_core::Error),

    /// Re-reading the chip after a write did not return the written image
    #[error("Write was unsuccessful: chip contents do not match the written image")]
    ChecksumMismatch,

    /// A fixed-address payload was never accepted by the chip
    #[error("Payload at address {address:#06x} was not accepted")]
    Rejected { address: u16 },

    /// A payload does not fit its region
    #[error("Payload of {len} bytes does not fit in {max} bytes")]
    PayloadTooLong { len: usize, max: usize },
}

impl Retryable for ChipError {
    fn is_retryable(&self) -> bool {
        match self {
            ChipError::Adapter(e) => e.is_retryable(),
            ChipError::Codec(e) => e.is_invalid_structure(),
            ChipError::ChecksumMismatch | ChipError::Rejected { .. } => true,
            ChipError::PayloadTooLong { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ChipError::ChecksumMismatch.is_retryable());
        assert!(ChipError::Codec(echip_core::Error::Checksum { page: 3 }).is_retryable());
        assert!(!ChipError::Codec(echip_core::Error::InvalidSerial("x".into())).is_retryable());
        let mismatch = echip_ds2490::Error::LengthMismatch { new: 1, old: 2 };
        assert!(!ChipError::Adapter(mismatch).is_retryable());
        assert!(!ChipError::PayloadTooLong { len: 9, max: 8 }.is_retryable());
    }
}
