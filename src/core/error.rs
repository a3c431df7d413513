use std::fmt;
use thiserror::Error;

/// Result codes reported by a storage engine.
///
/// `Busy` and `Locked` are the transient contention codes: the resource is
/// held by someone else right now and the same statement may succeed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Busy,
    Locked,
    Constraint,
    NotFound,
    Interrupted,
    Unsupported,
    Misuse,
    Internal,
}

impl ErrorCode {
    pub fn is_lock_contention(self) -> bool {
        matches!(self, Self::Busy | Self::Locked)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Busy => "busy",
            Self::Locked => "locked",
            Self::Constraint => "constraint",
            Self::NotFound => "not_found",
            Self::Interrupted => "interrupted",
            Self::Unsupported => "unsupported",
            Self::Misuse => "misuse",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

/// Error raised at the engine boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code: {code})")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Busy, message)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Locked, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Constraint, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorCode::Interrupted, "interrupted: context cancelled")
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Misuse, message)
    }

    pub fn is_lock_contention(&self) -> bool {
        self.code.is_lock_contention()
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::new(ErrorCode::Internal, format!("lock poisoned: {err}"))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Lock contention outlived every allowed attempt.
    #[error("maximum retries reached: retry {attempt}: {source}")]
    MaxRetriesReached {
        attempt: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("failed to acquire session: {0}")]
    Acquisition(#[source] EngineError),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Returns `true` for the transient "database locked" / "database busy"
    /// failures the retry executor is allowed to retry.
    ///
    /// The engine error may sit below exhausted retries or anyhow context
    /// added by a callback. Acquisition failures are never retried.
    pub fn is_lock_contention(&self) -> bool {
        self.lock_contention_code().is_some()
    }

    /// The `Busy`/`Locked` code found along this error's chain.
    pub fn lock_contention_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Engine(err) => err.is_lock_contention().then_some(err.code),
            Self::MaxRetriesReached { source, .. } => source.lock_contention_code(),
            Self::Other(err) => err.chain().find_map(|cause| {
                if let Some(engine_err) = cause.downcast_ref::<EngineError>() {
                    return engine_err.is_lock_contention().then_some(engine_err.code);
                }
                cause
                    .downcast_ref::<StoreError>()
                    .and_then(StoreError::lock_contention_code)
            }),
            _ => None,
        }
    }

    /// The engine code behind this error, if it came from the engine.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Engine(err) | Self::Acquisition(err) => Some(err.code),
            Self::MaxRetriesReached { source, .. } => source.code(),
            Self::Other(err) => err.chain().find_map(|cause| {
                if let Some(engine_err) = cause.downcast_ref::<EngineError>() {
                    return Some(engine_err.code);
                }
                cause.downcast_ref::<StoreError>().and_then(StoreError::code)
            }),
            _ => None,
        }
    }

    pub fn is_max_retries_reached(&self) -> bool {
        matches!(self, Self::MaxRetriesReached { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_classification() {
        assert!(StoreError::from(EngineError::busy("db busy")).is_lock_contention());
        assert!(StoreError::from(EngineError::locked("table locked")).is_lock_contention());
        assert!(!StoreError::from(EngineError::constraint("dup")).is_lock_contention());
        assert!(!StoreError::Acquisition(EngineError::busy("begin")).is_lock_contention());
        assert!(!StoreError::Cancelled.is_lock_contention());
    }

    #[test]
    fn test_max_retries_message_and_code() {
        let err = StoreError::MaxRetriesReached {
            attempt: 5,
            source: Box::new(EngineError::locked("database table is locked").into()),
        };
        assert_eq!(err.code(), Some(ErrorCode::Locked));
        let message = err.to_string();
        assert!(message.contains("retry 5"));
        assert!(message.contains("database table is locked"));
    }

    #[test]
    fn test_lock_contention_found_through_wrapping() {
        let with_context: StoreError = anyhow::Error::new(EngineError::busy("database is locked"))
            .context("saving dashboard")
            .into();
        assert!(with_context.is_lock_contention());
        assert_eq!(with_context.lock_contention_code(), Some(ErrorCode::Busy));
        assert_eq!(with_context.code(), Some(ErrorCode::Busy));

        let exhausted = StoreError::MaxRetriesReached {
            attempt: 3,
            source: Box::new(EngineError::locked("database table is locked").into()),
        };
        assert_eq!(exhausted.lock_contention_code(), Some(ErrorCode::Locked));

        let store_in_anyhow: StoreError = anyhow::Error::new(exhausted)
            .context("importing dashboards")
            .into();
        assert_eq!(store_in_anyhow.lock_contention_code(), Some(ErrorCode::Locked));

        let constraint: StoreError = anyhow::Error::new(EngineError::constraint("dup"))
            .context("saving dashboard")
            .into();
        assert!(!constraint.is_lock_contention());
        assert_eq!(constraint.code(), Some(ErrorCode::Constraint));

        let plain: StoreError = anyhow::anyhow!("dashboard title is empty").into();
        assert!(!plain.is_lock_contention());
        assert_eq!(plain.code(), None);
    }
}
