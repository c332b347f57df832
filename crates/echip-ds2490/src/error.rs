//! Error types for the DS2490 bus engine

use std::fmt;

use echip_core::transport::TransportError;
use thiserror::Error;

/// Result type for bus engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of an operation a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Claiming the interface and first handshake
    Claim,
    /// ROM search
    Search,
    /// Memory read
    Read,
    /// Scratchpad write or copy
    Write,
    /// Scratchpad read-back
    Verify,
    /// Bus or device reset
    Reset,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Claim => "claim",
            Phase::Search => "search",
            Phase::Read => "read",
            Phase::Write => "write",
            Phase::Verify => "verify",
            Phase::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Bus engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The adapter's interface could not be claimed
    #[error("Failed to claim 1-Wire adapter: {0}")]
    Claim(#[source] TransportError),

    /// A USB transfer failed
    #[error("USB transfer failed during {phase}: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: TransportError,
    },

    /// A transfer or an operation attempt ran out of time
    #[error("Timeout during {phase}")]
    Timeout { phase: Phase },

    /// The adapter's command buffer did not drain
    #[error("1-Wire command buffer did not clear during {phase}")]
    BusBusy { phase: Phase },

    /// The adapter reported a short on the bus
    #[error("1-Wire short detected during {phase}")]
    BusShort { phase: Phase },

    /// No chip answered the reset pulse
    #[error("No presence pulse on the 1-Wire bus during {phase}")]
    NoPresence { phase: Phase },

    /// Scratchpad read-back kept disagreeing with the data sent
    #[error("Scratchpad verification failed at address {address:#06x}")]
    WriteVerificationFailed { address: u16 },

    /// Old and new images differ in page count
    #[error("Page count mismatch: new image has {new} pages, old image has {old}")]
    LengthMismatch { new: usize, old: usize },

    /// The adapter returned data that makes no sense
    #[error("Invalid response during {phase}: {message}")]
    InvalidResponse { phase: Phase, message: String },

    /// Bus access before `claim()`
    #[error("1-Wire adapter not claimed")]
    NotClaimed,

    /// Bus access after `close()`
    #[error("1-Wire adapter closed")]
    Closed,

    /// Invalid configuration or argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    /// Stage the failure happened in, for bus failures
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Claim(_) => Some(Phase::Claim),
            Error::Transport { phase, .. }
            | Error::Timeout { phase }
            | Error::BusBusy { phase }
            | Error::BusShort { phase }
            | Error::NoPresence { phase }
            | Error::InvalidResponse { phase, .. } => Some(*phase),
            Error::WriteVerificationFailed { .. } => Some(Phase::Verify),
            Error::LengthMismatch { .. } => Some(Phase::Write),
            Error::NotClaimed | Error::Closed | Error::InvalidParameter(_) => None,
        }
    }

    /// Whether repeating the operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::Timeout { .. }
                | Error::BusBusy { .. }
                | Error::BusShort { .. }
                | Error::NoPresence { .. }
                | Error::WriteVerificationFailed { .. }
                | Error::InvalidResponse { .. }
        )
    }

    /// Report a failed claim handshake as a claim error.
    pub(crate) fn into_claim(self) -> Error {
        match self {
            Error::Claim(source) | Error::Transport { source, .. } => Error::Claim(source),
            other => Error::Claim(TransportError::Transfer(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors_are_not_retried() {
        assert!(!Error::LengthMismatch { new: 256, old: 255 }.is_retryable());
        assert!(!Error::Claim(TransportError::NotFound).is_retryable());
        assert!(!Error::Closed.is_retryable());
    }

    #[test]
    fn test_bus_errors_carry_phase() {
        let err = Error::Transport {
            phase: Phase::Read,
            source: TransportError::Stall(0x83),
        };
        assert!(err.is_retryable());
        assert_eq!(err.phase(), Some(Phase::Read));
        assert_eq!(
            err.to_string(),
            "USB transfer failed during read: Endpoint 0x83 stalled"
        );
        assert_eq!(
            Error::WriteVerificationFailed { address: 0x20 }.phase(),
            Some(Phase::Verify)
        );
    }

    #[test]
    fn test_handshake_failure_becomes_claim_error() {
        let err = Error::Transport {
            phase: Phase::Claim,
            source: TransportError::Disconnected,
        };
        assert_eq!(err.into_claim(), Error::Claim(TransportError::Disconnected));

        let err = Error::BusBusy { phase: Phase::Claim }.into_claim();
        assert_eq!(err.phase(), Some(Phase::Claim));
        assert!(!err.is_retryable());
    }
}
