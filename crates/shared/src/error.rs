//! Error types for HuertoRentable shared types

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Unknown trust level: {0}")]
    UnknownTrustLevel(String),

    #[error("Unknown provenance marker: {0}")]
    UnknownProvenance(String),
}
