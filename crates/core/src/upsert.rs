//! Idempotent upsert coordinator.
//!
//! [`Engine::upsert`] turns an inbound entity into exactly one canonical record:
//!
//! 1. validate that the entity carries a complete business identifier;
//! 2. look up an existing record by that identifier;
//! 3. resolve the entity's reference fields (see [`crate::resolver`]);
//! 4. strip contained resources;
//! 5. update the existing record, or create a new one;
//! 6. emit one audit record.
//!
//! Re-submitting the same entity updates the record it created the first time, so replaying
//! a message never duplicates data.

use crate::audit::{AuditAction, AuditEmitter, AuditRecord};
use crate::config::{CoreConfig, StoreTarget};
use crate::constants::DEFAULT_MAX_REFERENCE_DEPTH;
use crate::identity::IdentityResolver;
use crate::resolver::{LocalScope, Scope};
use crate::retry::{with_retry, CallContext, RetryPolicy};
use crate::store::{CanonicalRecord, FileStore, HttpStore, StoreClient};
use crate::{EngineError, EngineResult};
use fhir::{BusinessIdentifier, Entity, LogicalId, ResourceType};
use std::sync::Arc;

/// Result of one upsert.
#[derive(Clone, Debug, PartialEq)]
pub struct UpsertOutcome {
    pub record: CanonicalRecord,
    pub action: AuditAction,
}

/// The integration engine.
///
/// Holds no per-request state; one engine can serve concurrent callers as long as its store
/// and audit sink can.
pub struct Engine {
    store: Arc<dyn StoreClient>,
    audit: Arc<dyn AuditEmitter>,
    retry: RetryPolicy,
    max_reference_depth: usize,
}

impl Engine {
    /// Engine with the default retry policy and reference depth.
    pub fn new(store: Arc<dyn StoreClient>, audit: Arc<dyn AuditEmitter>) -> Self {
        Self {
            store,
            audit,
            retry: RetryPolicy::default(),
            max_reference_depth: DEFAULT_MAX_REFERENCE_DEPTH,
        }
    }

    /// Builds the store named by `config` and an engine over it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the HTTP client cannot be constructed.
    pub fn from_config(config: &CoreConfig, audit: Arc<dyn AuditEmitter>) -> EngineResult<Self> {
        let store: Arc<dyn StoreClient> = match config.store() {
            StoreTarget::Directory(root) => Arc::new(FileStore::new(root.clone())),
            StoreTarget::Http(base) => {
                Arc::new(HttpStore::new(base.clone(), config.request_timeout())?)
            }
        };
        Ok(Self::new(store, audit)
            .with_retry_policy(*config.retry())
            .with_max_reference_depth(config.max_reference_depth()))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_reference_depth(mut self, max: usize) -> Self {
        self.max_reference_depth = max;
        self
    }

    pub fn store(&self) -> &dyn StoreClient {
        self.store.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn max_reference_depth(&self) -> usize {
        self.max_reference_depth
    }

    pub(crate) fn identity(&self) -> IdentityResolver<'_> {
        IdentityResolver::new(self.store.as_ref(), &self.retry)
    }

    /// Finds the canonical record of `resource_type` carrying `identifier`.
    ///
    /// # Errors
    ///
    /// Store failures, after retries.
    pub fn lookup(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        identifier: &BusinessIdentifier,
    ) -> EngineResult<Option<CanonicalRecord>> {
        self.identity().lookup(ctx, resource_type, identifier)
    }

    /// Creates or updates the canonical record for `entity`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::MissingIdentifier`] before any store call when the entity (or an
    ///   embedded body) has no complete business identifier.
    /// - [`EngineError::ReferenceDepthExceeded`] for bodies nested too deeply.
    /// - [`EngineError::Store`] / [`EngineError::RetriesExhausted`] for store failures.
    pub fn upsert(&self, ctx: &CallContext, entity: Entity) -> EngineResult<UpsertOutcome> {
        let mut scope = Scope::new(None);
        self.upsert_in_scope(ctx, &mut scope, entity, LocalScope::Own)
    }

    pub(crate) fn upsert_in_scope(
        &self,
        ctx: &CallContext,
        scope: &mut Scope<'_>,
        mut entity: Entity,
        local: LocalScope,
    ) -> EngineResult<UpsertOutcome> {
        let resource_type = entity.resource_type();
        if entity.first_complete_identifier().is_none() {
            return Err(EngineError::MissingIdentifier(resource_type));
        }
        self.check_depth(scope)?;

        let existing = self.identity().find_existing(ctx, &entity)?;
        self.resolve_within(ctx, scope, &mut entity, local)?;

        let (record, action) = match existing {
            Some(found) => {
                entity.set_id(Some(found.id.clone()));
                let what = format!("update {resource_type}");
                let record = with_retry(&self.retry, ctx, &what, || {
                    self.store.update(ctx, &entity, &found.id)
                })?;
                (record, AuditAction::Update)
            }
            None => {
                entity.set_id(None);
                let what = format!("create {resource_type}");
                let record =
                    with_retry(&self.retry, ctx, &what, || self.store.create(ctx, &entity))?;
                (record, AuditAction::Create)
            }
        };

        tracing::info!(
            %resource_type,
            id = %record.id,
            version = record.version.as_deref(),
            %action,
            "upserted canonical record"
        );
        self.emit_audit(record.clone(), action);
        Ok(UpsertOutcome { record, action })
    }

    /// Deletes record `id` and audits the last stored body.
    ///
    /// # Errors
    ///
    /// [`EngineError::Store`] with [`crate::StoreError::NotFound`] when there is no such
    /// record, or any other store failure after retries.
    pub fn delete(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> EngineResult<CanonicalRecord> {
        let snapshot = with_retry(&self.retry, ctx, &format!("read {resource_type}"), || {
            self.store.read(ctx, resource_type, id)
        })?;
        with_retry(&self.retry, ctx, &format!("delete {resource_type}"), || {
            self.store.delete(ctx, resource_type, id)
        })?;
        tracing::info!(%resource_type, %id, "deleted canonical record");
        self.emit_audit(snapshot.clone(), AuditAction::Delete);
        Ok(snapshot)
    }

    /// Emits an audit record. Sink failures are logged and swallowed.
    pub(crate) fn emit_audit(&self, snapshot: CanonicalRecord, action: AuditAction) {
        let record = AuditRecord::new(snapshot, action);
        if let Err(e) = self.audit.record(&record) {
            tracing::error!(
                resource_type = %record.snapshot.resource_type,
                id = %record.snapshot.id,
                %action,
                error = %e,
                "failed to emit audit record"
            );
        }
    }
}
