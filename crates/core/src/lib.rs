//! # TIE Core
//!
//! Reference resolution and idempotent upsert engine for clinical entity graphs.
//!
//! This crate contains the engine and its collaborators:
//! - [`Engine`]: upsert keyed by business identifier, recursive reference resolution,
//!   bundle intake and transaction preparation
//! - [`StoreClient`] and its HTTP, file and in-memory implementations
//! - the retry executor ([`RetryPolicy`], [`CallContext`])
//! - audit records and emitters
//! - [`DocumentCanonicalizer`] for self-contained document bundles
//!
//! **No process concerns**: environment variables, `.env` files and logging subscribers belong
//! in the binaries. Core receives a resolved [`CoreConfig`].

pub mod audit;
pub mod canonicalize;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod intake;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod upsert;

#[cfg(test)]
pub(crate) mod test_support;

pub use audit::{
    AuditAction, AuditEmitter, AuditError, AuditRecord, MemoryAuditEmitter, TracingAuditEmitter,
};
pub use canonicalize::{CanonicalDocument, DocumentCanonicalizer, DocumentMember, ReferenceMap};
pub use config::{CoreConfig, StoreTarget};
pub use error::{EngineError, EngineResult};
pub use intake::EntryOutcome;
pub use retry::{Backoff, CallContext, CancelHandle, RetryPolicy};
pub use store::{
    CanonicalRecord, FileStore, HttpStore, InMemoryStore, StoreClient, StoreError,
    StoreOperation, StoreResult,
};
pub use upsert::{Engine, UpsertOutcome};
