//! Identity resolver: business identifier to canonical record.

use crate::retry::{with_retry, CallContext, RetryPolicy};
use crate::store::{CanonicalRecord, StoreClient};
use crate::EngineResult;
use fhir::{BusinessIdentifier, Entity, ResourceType};

/// Read-only lookups against the canonical store.
pub struct IdentityResolver<'a> {
    store: &'a dyn StoreClient,
    policy: &'a RetryPolicy,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn StoreClient, policy: &'a RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Finds the canonical record of `resource_type` carrying `identifier`.
    ///
    /// A partial identifier (missing system or value) is "not found" and never reaches the
    /// store. When the store holds several matches the first is used and the anomaly is
    /// logged.
    ///
    /// # Errors
    ///
    /// Store failures, after the retry policy has been applied.
    pub fn lookup(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        identifier: &BusinessIdentifier,
    ) -> EngineResult<Option<CanonicalRecord>> {
        let Some((system, value)) = identifier.key() else {
            tracing::debug!(%resource_type, "partial identifier; skipping lookup");
            return Ok(None);
        };

        let what = format!("search {resource_type}");
        let matches = with_retry(self.policy, ctx, &what, || {
            self.store
                .search_by_identifier(ctx, resource_type, system, value)
        })?;

        if matches.len() > 1 {
            let ids: Vec<String> = matches.iter().map(|r| r.id.to_string()).collect();
            tracing::warn!(
                %resource_type,
                system,
                matches = matches.len(),
                ids = ?ids,
                "duplicate canonical records for one business identifier; using the first"
            );
        }
        Ok(matches.into_iter().next())
    }

    /// Finds the canonical record for `entity`, trying its complete identifiers in order.
    ///
    /// # Errors
    ///
    /// Store failures, after the retry policy has been applied.
    pub fn find_existing(
        &self,
        ctx: &CallContext,
        entity: &Entity,
    ) -> EngineResult<Option<CanonicalRecord>> {
        for identifier in entity.complete_identifiers() {
            if let Some(record) = self.lookup(ctx, entity.resource_type(), identifier)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}
