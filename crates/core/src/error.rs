use crate::store::StoreError;
use fhir::{FhirError, ResourceType};

/// Errors surfaced by the engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} has no business identifier with both system and value")]
    MissingIdentifier(ResourceType),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("store call failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: StoreError,
    },
    #[error("reference nesting exceeds the maximum depth of {max}")]
    ReferenceDepthExceeded { max: usize },
    #[error(
        "graph submission stopped at entry {failed_entry} after {written} entries were written: {source}"
    )]
    PartialGraph {
        written: usize,
        failed_entry: usize,
        #[source]
        source: Box<EngineError>,
    },
    #[error("FHIR error: {0}")]
    Fhir(#[from] FhirError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// True for failures caused by the inbound data rather than the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_) | EngineError::MissingIdentifier(_) | EngineError::Fhir(_)
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
