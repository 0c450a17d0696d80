//! Error taxonomy for the particle filter and its smoothers.
//!
//! Configuration problems are detected before a run starts. Model contract
//! violations abort the run at the step where they are observed; no partial
//! estimate is returned. Weight degeneracy is *not* an error and is reported
//! through the effective sample size instead.

use std::io;

/// Errors produced by the SMC engine.
#[derive(Debug, thiserror::Error)]
pub enum SmcError {
    /// Invalid run configuration (particle count, horizon, strategy names, ...).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The model returned a value the engine cannot work with.
    #[error("model contract violated at step {step}: {message}")]
    ModelContract { step: usize, message: String },
    /// Reading or writing a configuration or result file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SmcError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        SmcError::Configuration(message.into())
    }

    pub(crate) fn contract(step: usize, message: impl Into<String>) -> Self {
        SmcError::ModelContract {
            step,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SmcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_step_for_contract_errors() {
        let err = SmcError::contract(7, "log-likelihood is NaN");
        assert_eq!(
            err.to_string(),
            "model contract violated at step 7: log-likelihood is NaN"
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: SmcError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, SmcError::Io(_)));
    }
}
