//! FHIR wire/boundary support for the integration engine.
//!
//! This crate provides **wire models** and **translation helpers** for clinical entities as
//! they arrive from intake channels and as they are written to the canonical store:
//! - [`ResourceType`] and the per-type [`EntityDescriptor`] table (which fields are references,
//!   and what they may point at)
//! - [`BusinessIdentifier`], [`Reference`] and [`Entity`] domain types
//! - [`Bundle`] for message, transaction and document packages
//! - the identifier-system table in [`systems`]
//!
//! Entities are parsed from JSON or YAML with `serde_path_to_error`, so schema mismatches
//! report the failing path. Attributes the engine does not model are carried through verbatim.

pub mod bundle;
pub mod descriptor;
pub mod entity;
pub mod identifier;
mod pointer;
pub mod reference;
pub mod resource_type;
pub mod systems;

// Re-export public domain-level types
pub use bundle::{Bundle, BundleEntry, BundleRequest, BundleResponse, BundleType, HttpVerb};
pub use descriptor::{EntityDescriptor, ReferenceField};
pub use entity::{Entity, ReferenceSlot};
pub use identifier::BusinessIdentifier;
pub use reference::{CanonicalRef, Reference, ReferenceTarget};
pub use resource_type::ResourceType;

pub use tie_types::{LogicalId, NonEmptyText};

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("invalid logical id: {0}")]
    InvalidId(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

/// Formats a `serde_path_to_error` failure the same way for every wire type.
pub(crate) fn schema_mismatch<E: std::fmt::Display>(
    what: &str,
    err: serde_path_to_error::Error<E>,
) -> FhirError {
    let path = err.path().to_string();
    let source = err.into_inner();
    let path = if path.is_empty() || path == "." {
        "<root>"
    } else {
        path.as_str()
    };
    FhirError::Translation(format!("{what} schema mismatch at {path}: {source}"))
}
