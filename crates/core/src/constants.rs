//! Constants used throughout the engine crate.

/// Default directory for the file-backed canonical store.
pub const DEFAULT_STORE_DIR: &str = "canonical_store";

/// Attempts per store call when no retry policy is configured.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Per-request timeout for the HTTP store, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on nested reference resolution.
pub const DEFAULT_MAX_REFERENCE_DEPTH: usize = 16;

/// Attempts to allocate an unused storage UUID before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 5;

/// Tracing target for emitted audit events.
pub const AUDIT_TARGET: &str = "tie::audit";

/// Media type for FHIR JSON payloads.
pub const FHIR_JSON: &str = "application/fhir+json";

/// Display name used for the engine in generated audit events.
pub const ENGINE_NAME: &str = "tie-core";
