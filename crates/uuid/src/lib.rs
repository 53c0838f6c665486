//! UUID utilities for the integration engine.
//!
//! Two identifier shapes are used:
//!
//! - [`ShardableUuid`]: the *canonical* storage form, **32 lowercase hexadecimal characters**
//!   (no hyphens). The file-backed store names records with it and derives a sharded
//!   directory from its first four characters:
//!   `parent_dir/<u[0..2]>/<u[2..4]>/<u>.json`.
//! - [`SurrogateId`]: the hyphenated RFC 4122 form used for document-local identities. A
//!   canonicalized document addresses its members as `urn:uuid:<surrogate>`.
//!
//! Generators are plain closures (`FnMut() -> T`) so callers can inject deterministic
//! sources in tests; [`SequentialSurrogates`] is such a source.
//!
//! ## Sharding
//!
//! For a canonical UUID `550e8400e29b41d4a716446655440000` under `store/Patient` the record
//! lives at `store/Patient/55/0e/550e8400e29b41d4a716446655440000.json`. This keeps any single
//! directory from growing without bound.

mod service;

pub use service::{SequentialSurrogates, ShardableUuid, SurrogateId, Uuid, URN_UUID_PREFIX};

/// Error type for UUID operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for UUID operations.
pub type UuidResult<T> = Result<T, UuidError>;
