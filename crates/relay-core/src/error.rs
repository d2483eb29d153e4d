//! Error kinds.
//!
//! Two error surfaces exist: [`Error`] for store operations and producer
//! APIs, and [`HandlerError`] for handler outcomes, which drives the
//! dispatcher's retry decision.

use thiserror::Error;

use crate::ids::JoinId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by store operations and producer APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller violated a parameter constraint. Raised synchronously and
    /// never changes state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced entity (routing key, join) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lease guard was consulted after the lease expired or was released.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Underlying storage failure. Transient from the dispatcher's view.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(anyhow::Error::from(err))
    }
}

/// Outcome kinds a handler can surface.
///
/// The dispatcher maps these onto the claim state machine: `Permanent` fails
/// the message immediately, everything else is rescheduled with backoff
/// until the attempt budget runs out.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The message can never succeed. Failed without retry.
    #[error("permanent failure: {0}")]
    Permanent(#[source] anyhow::Error),

    /// A join the handler is waiting on has not collected all of its steps
    /// yet. Retryable.
    #[error("join {0} not ready")]
    JoinNotReady(JoinId),

    /// Anything else, including honored cancellation. Retried with backoff.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(anyhow::anyhow!(msg.into()))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(anyhow::anyhow!(msg.into()))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        match err {
            // Constraint violations and dangling references will not heal
            // with time.
            Error::InvalidArgument(_) | Error::NotFound(_) => {
                Self::Permanent(anyhow::Error::new(err))
            }
            Error::LeaseLost(_) | Error::Storage(_) => Self::Transient(anyhow::Error::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_classify_for_dispatch() {
        assert!(HandlerError::from(Error::invalid("x")).is_permanent());
        assert!(HandlerError::from(Error::not_found("x")).is_permanent());
        assert!(!HandlerError::from(Error::Storage(anyhow::anyhow!("db down"))).is_permanent());
    }

    #[test]
    fn permanent_carries_detail() {
        let err = HandlerError::permanent("bad data");
        assert!(err.to_string().contains("bad data"));
    }
}
