//! Canonical store clients.
//!
//! The canonical record store is a remote service reached through the narrow
//! [`StoreClient`] interface. Failures are classified here, at the boundary, so the retry
//! executor never has to guess whether an error is worth retrying.
//!
//! Three clients are provided:
//! - [`HttpStore`] speaks FHIR REST to a remote server.
//! - [`FileStore`] keeps records as sharded JSON files under a directory.
//! - [`InMemoryStore`] is process-local, with fault injection for tests.

mod file;
mod http;
mod memory;

pub use file::FileStore;
pub use http::HttpStore;
pub use memory::InMemoryStore;

use crate::retry::CallContext;
use fhir::{
    Bundle, BundleEntry, BundleResponse, BundleType, Entity, HttpVerb, LogicalId, Reference,
    ResourceType,
};
use fhir::reference::CanonicalRef;

/// A record as held by the canonical store.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalRecord {
    pub resource_type: ResourceType,
    pub id: LogicalId,
    pub version: Option<String>,
    pub entity: Entity,
}

impl CanonicalRecord {
    /// Wraps a stored entity. The entity must carry the logical id the store assigned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Permanent`] if the entity has no id.
    pub fn from_entity(entity: Entity) -> StoreResult<Self> {
        let id = entity.id().cloned().ok_or_else(|| StoreError::Permanent {
            status: None,
            diagnostics: format!("stored {} has no logical id", entity.resource_type()),
        })?;
        Ok(Self {
            resource_type: entity.resource_type(),
            version: entity.version_id().map(str::to_owned),
            id,
            entity,
        })
    }

    /// `Type/id` reference to this record.
    pub fn reference(&self) -> Reference {
        Reference::canonical(self.resource_type, self.id.clone())
    }
}

/// Store operations, used to count calls and target injected faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Search,
    Read,
    Create,
    Update,
    Delete,
    Transaction,
}

/// Failures reported by a store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Timeouts, throttling, 5xx responses and connection failures.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The store rejected the request; repeating it will not help.
    #[error("store rejected request{}: {diagnostics}", status_suffix(.status))]
    Permanent {
        status: Option<u16>,
        diagnostics: String,
    },
    #[error("{resource_type}/{id} not found")]
    NotFound {
        resource_type: ResourceType,
        id: String,
    },
    #[error("call cancelled")]
    Cancelled,
    #[error("call deadline exceeded")]
    DeadlineExceeded,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub(crate) fn permanent(diagnostics: impl Into<String>) -> Self {
        StoreError::Permanent {
            status: None,
            diagnostics: diagnostics.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::permanent(err.to_string()),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Interface to the canonical record store.
///
/// Implementations must be safe for concurrent use; the engine holds no per-request state
/// of its own.
pub trait StoreClient: Send + Sync {
    /// Every record of `resource_type` carrying the identifier `(system, value)`, in store
    /// order. An empty list is not an error.
    fn search_by_identifier(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        system: &str,
        value: &str,
    ) -> StoreResult<Vec<CanonicalRecord>>;

    fn read(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord>;

    /// Creates a record; the store assigns the logical id.
    fn create(&self, ctx: &CallContext, entity: &Entity) -> StoreResult<CanonicalRecord>;

    /// Replaces the body of record `id`.
    fn update(
        &self,
        ctx: &CallContext,
        entity: &Entity,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord>;

    fn delete(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<()>;

    /// Submits a `transaction` bundle and returns the `transaction-response`.
    fn transaction(&self, ctx: &CallContext, bundle: &Bundle) -> StoreResult<Bundle>;
}

/// Applies a transaction entry by entry through `store`'s own operations.
///
/// Used by the local stores. Entries are applied in order; a failing entry stops the
/// transaction and earlier entries stay applied.
pub(crate) fn apply_transaction<S: StoreClient + ?Sized>(
    store: &S,
    ctx: &CallContext,
    bundle: &Bundle,
) -> StoreResult<Bundle> {
    if bundle.bundle_type != BundleType::Transaction {
        return Err(StoreError::permanent("bundle type must be transaction"));
    }

    let mut response = Bundle::new(BundleType::TransactionResponse);
    for (index, entry) in bundle.entries.iter().enumerate() {
        let request = entry
            .request
            .as_ref()
            .ok_or_else(|| StoreError::permanent(format!("entry {index} has no request")))?;

        let (status, record) = match request.method {
            HttpVerb::Post => {
                let resource = entry_resource(entry, index)?;
                ("201 Created", Some(store.create(ctx, resource)?))
            }
            HttpVerb::Put => {
                let resource = entry_resource(entry, index)?;
                let target = request_target(&request.url, index)?;
                let existed = match store.read(ctx, target.resource_type, &target.id) {
                    Ok(_) => true,
                    Err(StoreError::NotFound { .. }) => false,
                    Err(e) => return Err(e),
                };
                let record = store.update(ctx, resource, &target.id)?;
                (if existed { "200 OK" } else { "201 Created" }, Some(record))
            }
            HttpVerb::Delete => {
                let target = request_target(&request.url, index)?;
                store.delete(ctx, target.resource_type, &target.id)?;
                ("204 No Content", None)
            }
            other => {
                return Err(StoreError::permanent(format!(
                    "entry {index}: {other:?} is not supported in a transaction"
                )))
            }
        };

        let location = record.as_ref().map(|r| match &r.version {
            Some(v) => format!("{}/{}/_history/{v}", r.resource_type, r.id),
            None => format!("{}/{}", r.resource_type, r.id),
        });
        response.entries.push(BundleEntry {
            full_url: None,
            resource: record.map(|r| r.entity),
            request: None,
            response: Some(BundleResponse {
                status: status.into(),
                location,
                etag: None,
                last_modified: None,
                outcome: None,
            }),
        });
    }
    Ok(response)
}

fn entry_resource(entry: &BundleEntry, index: usize) -> StoreResult<&Entity> {
    entry
        .resource
        .as_ref()
        .ok_or_else(|| StoreError::permanent(format!("entry {index} has no resource")))
}

fn request_target(url: &str, index: usize) -> StoreResult<CanonicalRef> {
    CanonicalRef::parse(url)
        .map_err(|e| StoreError::permanent(format!("entry {index}: bad request url '{url}': {e}")))
}

/// Whether `entity` carries the identifier `(system, value)`.
pub(crate) fn has_identifier(entity: &Entity, system: &str, value: &str) -> bool {
    entity
        .complete_identifiers()
        .filter_map(|i| i.key())
        .any(|key| key == (system, value))
}
