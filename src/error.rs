//! Error types shared by every subsystem.
//!
//! Each operation reports one of a fixed set of error kinds to its
//! immediate caller; no layer retries on its own. Composite
//! initialization (multi-pin contexts, mux chains, bus setup) is all or
//! nothing: on failure everything claimed so far is torn down and the
//! first error is reported verbatim.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The operation is recognized but no code path (generic or
    /// platform override) exists for it.
    #[error("feature not implemented: {0}")]
    FeatureNotImplemented(&'static str),

    /// The hardware genuinely lacks the capability.
    #[error("feature not supported by hardware: {0}")]
    FeatureNotSupported(String),

    /// A caller-supplied argument is out of range or inconsistent with
    /// the context's state.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation was invoked on a closed or otherwise unusable
    /// context.
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// A required resource (interrupt thread slot, mmap region, file
    /// descriptor) is already held or could not be acquired.
    #[error("no resources: {0}")]
    NoResources(String),

    /// The resolved physical resource could not be opened or claimed.
    #[error("invalid resource: {path}")]
    InvalidResource {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation was attempted against a platform segment that has
    /// no board.
    #[error("platform not initialised")]
    PlatformNotInitialised,

    /// A mux step failed; the pin is left in an indeterminate mux state
    /// and re-running the whole sequence is the only supported recovery.
    #[error("mux step {step} failed")]
    Mux {
        step: usize,
        #[source]
        source: Box<Error>,
    },

    /// A mux `SetValue` step targeted a line that is not configured as
    /// an output.
    #[error("mux step {step}: auxiliary pin {pin} is not an output")]
    MuxNotOutput { step: usize, pin: u32 },

    /// Catch-all for conditions not otherwise classified.
    #[error("{0}")]
    Unspecified(String),
}

impl Error {
    pub(crate) fn invalid_resource(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::InvalidResource {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_error_carries_step_and_cause() {
        let err = Error::Mux {
            step: 3,
            source: Box::new(Error::InvalidHandle("gpio context closed")),
        };
        assert_eq!(err.to_string(), "mux step 3 failed");
        let source = std::error::Error::source(&err).expect("cause");
        assert!(source.to_string().contains("invalid handle"));
    }
}
