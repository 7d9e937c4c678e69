// Error taxonomy shared by every stage of a run.

use thiserror::Error;

use crate::gateway::{ChatError, LedgerError};

#[derive(Debug, Error)]
pub enum LunchError {
    /// The catalog holds no venue at all.
    #[error("no eligible venue in the catalog")]
    NoEligibleVenue,

    #[error("a poll session is already open for channel {channel}")]
    SessionAlreadyOpen { channel: String },

    #[error("poll session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("poll session {session_id} is {status}, not confirmed")]
    SessionNotConfirmed { session_id: String, status: String },

    #[error("invalid poll: {message}")]
    InvalidPoll { message: String },

    #[error("invalid settlement: {message}")]
    InvalidSettlement { message: String },

    /// Transient ledger failure; settlement may be retried.
    #[error("ledger unavailable: {message}")]
    LedgerUnavailable { message: String },

    /// Permanent ledger failure; retrying will not help.
    #[error("ledger rejected the expense: {message}")]
    LedgerRejected { message: String },

    #[error("chat gateway error: {0}")]
    Chat(#[from] ChatError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl LunchError {
    /// Only an unavailable ledger is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LunchError::LedgerUnavailable { .. })
    }

    /// Whether the error happened after the meal was decided, i.e. the run is
    /// partially complete rather than failed.
    pub fn is_settlement_error(&self) -> bool {
        matches!(
            self,
            LunchError::LedgerUnavailable { .. }
                | LunchError::LedgerRejected { .. }
                | LunchError::InvalidSettlement { .. }
        )
    }
}

impl From<LedgerError> for LunchError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(message) => LunchError::LedgerUnavailable { message },
            LedgerError::Rejected(message) => LunchError::LedgerRejected { message },
        }
    }
}

pub type Result<T> = std::result::Result<T, LunchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ledger_unavailable_is_retryable() {
        assert!(LunchError::LedgerUnavailable {
            message: "timeout".into()
        }
        .is_retryable());
        assert!(!LunchError::LedgerRejected {
            message: "bad member".into()
        }
        .is_retryable());
        assert!(!LunchError::NoEligibleVenue.is_retryable());
        assert!(!LunchError::SessionAlreadyOpen {
            channel: "#food".into()
        }
        .is_retryable());
    }

    #[test]
    fn ledger_errors_map_to_distinct_variants() {
        let unavailable: LunchError = LedgerError::Unavailable("503".into()).into();
        assert!(matches!(unavailable, LunchError::LedgerUnavailable { .. }));

        let rejected: LunchError = LedgerError::Rejected("422".into()).into();
        assert!(matches!(rejected, LunchError::LedgerRejected { .. }));
        assert!(rejected.is_settlement_error());
    }
}
