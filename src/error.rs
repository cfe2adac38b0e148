/// Error taxonomy for the step tree, the phase aggregator and the coordinator
///
/// Every library operation returns [`Result`]. Storage failures are classified
/// as transient or not when they are converted from `sqlx::Error`, so retry
/// loops can decide whether another attempt makes sense.

use uuid::Uuid;

/// Result type used throughout scanflow
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by scanflow operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown run token, step or phase
    #[error("not found: {resource}")]
    NotFound {
        /// Human-readable description of what was looked up
        resource: String,
    },

    /// A step tree already exists for this token
    #[error("run already exists for token {token}")]
    DuplicateRun { token: Uuid },

    /// A scan record already exists for this token and has not been reaped
    #[error("phase already exists for token {token}")]
    DuplicatePhase { token: Uuid },

    /// The step state machine does not allow this transition
    #[error("invalid transition for step {step} of run {token}: {from} -> {to}")]
    InvalidTransition {
        token: Uuid,
        step: String,
        from: String,
        to: String,
    },

    /// Caller supplied an argument outside the accepted domain
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// The storage layer failed
    #[error("persistence error: {message}")]
    Persistence {
        message: String,
        /// Whether retrying the same operation may succeed
        transient: bool,
        #[source]
        source: Option<sqlx::Error>,
    },
}

impl Error {
    pub(crate) fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Storage failure that no retry can fix (undecodable row, unusable path)
    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            transient: false,
            source: None,
        }
    }

    /// True when the failure is expected to clear on its own (lock contention, pool exhaustion)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence { transient: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    pub fn is_duplicate_phase(&self) -> bool {
        matches!(self, Self::DuplicatePhase { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let transient = is_transient_sqlx(&err);
        Self::Persistence {
            message: err.to_string(),
            transient,
            source: Some(err),
        }
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}
