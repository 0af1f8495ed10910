//! Crate-wide error taxonomy (spec §7).
//!
//! Two layers: [`EngineError`] wraps whatever the engine client's transport
//! throws, [`DriverError`] is what the Driver Core's public operations
//! return. Both carry a [`Classification`] so callers (and the orchestrator,
//! at the RPC boundary this crate does not implement) can decide whether to
//! retry.

use thiserror::Error;

/// How a failure should be treated by a caller deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Policy violation caught before any engine call; retrying with the
    /// same spec will fail the same way.
    Config,
    /// Engine-transient (network blip, engine mid-restart); safe to retry.
    Recoverable,
    /// Engine-permanent (bad image name, unknown runtime); retrying is
    /// pointless without changing the spec.
    Fatal,
    /// The target wasn't there; most operations treat this as success.
    NotFound,
}

/// Error surfaced by the Engine Client (C1).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("engine call timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// HTTP status the engine daemon returned, if this was a well-formed
    /// API error response.
    fn status_code(&self) -> Option<u16> {
        match self {
            EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => Some(*status_code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// "already started" / "not modified" class of response.
    pub fn is_not_modified(&self) -> bool {
        self.status_code() == Some(304)
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    /// Transient network/rate-limit conditions the engine (or its registry
    /// upstream) reports; distinct from a permanently-bad request.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Timeout | EngineError::Cancelled => true,
            EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => matches!(status_code, 429 | 500 | 502 | 503 | 504),
            EngineError::Docker(bollard::errors::Error::RequestTimeoutError) => true,
            EngineError::Docker(bollard::errors::Error::HyperResponseError { .. }) => true,
            _ => false,
        }
    }

    pub fn classify(&self) -> Classification {
        if self.is_not_found() {
            Classification::NotFound
        } else if self.is_transient() {
            Classification::Recoverable
        } else {
            Classification::Fatal
        }
    }
}

/// Error surfaced by the Driver Core's public contract (§4.1).
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {0} is still running")]
    StillRunning(String),

    #[error("{0}")]
    Other(String),

    /// An error that crossed an `Arc` boundary (a deduplicated pull future
    /// shared by several callers, per I1) and so can't be recovered as the
    /// original `DriverError` variant. Carries the source's own
    /// classification along rather than losing it behind `Other`, which
    /// would otherwise turn a transient engine failure permanently fatal
    /// for every caller sharing the in-flight pull.
    #[error("{message}")]
    Shared {
        message: String,
        classification: Classification,
    },
}

impl DriverError {
    pub fn classify(&self) -> Classification {
        match self {
            DriverError::Config(_) => Classification::Config,
            DriverError::Engine(e) => e.classify(),
            DriverError::NotFound(_) => Classification::NotFound,
            DriverError::StillRunning(_) => Classification::Fatal,
            DriverError::Other(_) => Classification::Fatal,
            DriverError::Shared { classification, .. } => *classification,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.classify() == Classification::Recoverable
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DriverError::Config(msg.into())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classifies_as_not_found() {
        let e = EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        });
        assert_eq!(e.classify(), Classification::NotFound);
        assert!(e.is_not_found());
    }

    #[test]
    fn server_error_is_recoverable() {
        let e = EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 503,
            message: "overloaded".into(),
        });
        assert_eq!(e.classify(), Classification::Recoverable);
    }

    #[test]
    fn bad_request_is_fatal() {
        let e = EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 400,
            message: "bad image name".into(),
        });
        assert_eq!(e.classify(), Classification::Fatal);
    }

    #[test]
    fn driver_error_propagates_classification() {
        let e: DriverError = EngineError::Timeout.into();
        assert!(e.is_recoverable());
    }

    #[test]
    fn shared_preserves_the_classification_it_was_built_with() {
        let e = DriverError::Shared {
            message: "registry overloaded".to_string(),
            classification: Classification::Recoverable,
        };
        assert!(e.is_recoverable());
    }
}
