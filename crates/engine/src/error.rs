//! Fatal run-configuration errors.
//!
//! Everything else (provider failures, thin data, degenerate statistics) is
//! absorbed into sentinel values and logged so batch runs keep going.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("no symbols configured for the run")]
    NoSymbols,

    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("invalid bounds for {name}: {min} > {max}")]
    InvalidBounds { name: &'static str, min: f64, max: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
