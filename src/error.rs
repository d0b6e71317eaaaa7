//! Error types for proportion testing.
//!
//! Public operations return `anyhow::Result`; the failures they raise are
//! [`PropellerError`] values, so callers can recover the kind with
//! `err.downcast_ref::<PropellerError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropellerError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Invalid transform '{0}', expected 'logit' or 'arcsin'")]
    InvalidTransform(String),

    #[error("Singular design matrix: rank {rank} is less than {columns} columns{context}")]
    SingularDesign {
        rank: usize,
        columns: usize,
        context: String,
    },

    #[error("Sample '{sample}' has no design entry")]
    SampleMismatch { sample: String },

    #[error("Invalid contrast: {0}")]
    InvalidContrast(String),

    #[error("Root finding failed: {0}")]
    RootFinding(String),

    #[error("Simulation exhausted: run {run} failed {attempts} times, last error: {reason}")]
    SimulationExhausted {
        run: usize,
        attempts: usize,
        reason: String,
    },
}

impl PropellerError {
    /// Whether a bootstrap run failing with this error may be re-drawn.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PropellerError::RootFinding(_))
    }
}

/// Check whether an `anyhow` error wraps a recoverable [`PropellerError`].
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PropellerError>()
        .is_some_and(PropellerError::is_recoverable)
}
