//! Bundle intake.
//!
//! Two ways in for a graph of entities:
//!
//! - [`Engine::process_bundle`] upserts every entry of a message or collection bundle one by
//!   one. Pointers between entries (`urn:uuid:` full URLs) are followed, so an entry
//!   referenced by an earlier one is written first and written once.
//! - [`Engine::submit_transaction`] resolves a transaction bundle's references, turns `POST`
//!   entries that already exist into `PUT`s, and hands the whole bundle to the store in one
//!   call.
//!
//! Message headers are routing metadata and are never stored. Binary payloads are skipped in
//! transactions.

use crate::audit::AuditAction;
use crate::resolver::{LocalScope, Scope};
use crate::retry::{with_retry, CallContext};
use crate::store::CanonicalRecord;
use crate::upsert::{Engine, UpsertOutcome};
use crate::{EngineError, EngineResult};
use fhir::reference::CanonicalRef;
use fhir::{Bundle, BundleEntry, BundleRequest, BundleType, Entity, HttpVerb, ResourceType};

/// Outcome of one bundle entry.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryOutcome {
    /// Position of the entry in the submitted bundle.
    pub entry: usize,
    pub outcome: UpsertOutcome,
}

/// Entries stored so far, including those written while resolving another entry's references.
fn entries_written(bundle: &Bundle, outcomes: &[EntryOutcome], scope: &Scope<'_>) -> usize {
    bundle
        .entries
        .iter()
        .enumerate()
        .filter(|(index, entry)| {
            outcomes.iter().any(|o| o.entry == *index)
                || entry
                    .full_url
                    .as_ref()
                    .is_some_and(|url| scope.written.contains_key(url))
        })
        .count()
}

fn skipped_in_intake(resource_type: ResourceType) -> bool {
    resource_type == ResourceType::MessageHeader
}

fn skipped_in_transaction(resource_type: ResourceType) -> bool {
    matches!(
        resource_type,
        ResourceType::MessageHeader | ResourceType::Binary
    )
}

impl Engine {
    /// Upserts every resource of a message, collection, document or batch bundle, in entry
    /// order.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] for transaction, response, history and searchset bundles.
    /// - [`EngineError::PartialGraph`] when an entry fails. Entries before it stay written;
    ///   `written` says how many.
    pub fn process_bundle(
        &self,
        ctx: &CallContext,
        bundle: &Bundle,
    ) -> EngineResult<Vec<EntryOutcome>> {
        match bundle.bundle_type {
            BundleType::Message | BundleType::Collection | BundleType::Document | BundleType::Batch => {}
            other => {
                return Err(EngineError::Validation(format!(
                    "cannot process a {other:?} bundle entry by entry"
                )))
            }
        }

        let mut scope = Scope::new(Some(bundle));
        let mut outcomes = Vec::new();
        for (index, entry) in bundle.entries.iter().enumerate() {
            let Some(resource) = &entry.resource else {
                tracing::debug!(entry = index, "bundle entry has no resource; skipping");
                continue;
            };
            if skipped_in_intake(resource.resource_type()) {
                tracing::debug!(entry = index, resource_type = %resource.resource_type(), "skipping routing entry");
                continue;
            }

            if let Some(done) = entry.full_url.as_ref().and_then(|url| scope.written.get(url)) {
                tracing::debug!(entry = index, id = %done.record.id, "entry already written while resolving references");
                outcomes.push(EntryOutcome {
                    entry: index,
                    outcome: done.clone(),
                });
                continue;
            }

            match self.upsert_in_scope(ctx, &mut scope, resource.clone(), LocalScope::Own) {
                Ok(outcome) => {
                    if let Some(url) = &entry.full_url {
                        scope.written.insert(url.clone(), outcome.clone());
                    }
                    outcomes.push(EntryOutcome {
                        entry: index,
                        outcome,
                    });
                }
                Err(source) => {
                    let written = entries_written(bundle, &outcomes, &scope);
                    tracing::warn!(
                        entry = index,
                        written,
                        error = %source,
                        "bundle processing stopped"
                    );
                    return Err(EngineError::PartialGraph {
                        written,
                        failed_entry: index,
                        source: Box::new(source),
                    });
                }
            }
        }

        tracing::info!(
            bundle_type = ?bundle.bundle_type,
            entries = outcomes.len(),
            "bundle processed"
        );
        Ok(outcomes)
    }

    /// Resolves a transaction bundle ready for submission.
    ///
    /// Message headers and binaries are dropped. Every remaining resource has its references
    /// resolved against the store and the bundle itself, and a `POST` whose business
    /// identifier matches an existing record becomes a `PUT Type/id`.
    ///
    /// Resolution can write referenced entities (embedded bodies, contained resources,
    /// entries pointed at by `urn:uuid:`) before the transaction itself is submitted.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] if the bundle is not a transaction or an entry has no
    ///   request.
    /// - Any resolution or store failure.
    pub fn prepare_transaction(&self, ctx: &CallContext, bundle: &Bundle) -> EngineResult<Bundle> {
        if bundle.bundle_type != BundleType::Transaction {
            return Err(EngineError::Validation(format!(
                "expected a transaction bundle, got {:?}",
                bundle.bundle_type
            )));
        }

        let mut scope = Scope::new(Some(bundle));
        let mut prepared = Bundle::new(BundleType::Transaction);
        prepared.id = bundle.id.clone();
        prepared.identifier = bundle.identifier.clone();
        prepared.timestamp = bundle.timestamp.clone();

        for (index, source) in bundle.entries.iter().enumerate() {
            let mut entry = source.clone();
            if entry
                .resource
                .as_ref()
                .is_some_and(|r| skipped_in_transaction(r.resource_type()))
            {
                tracing::debug!(entry = index, "skipping message header or binary entry");
                continue;
            }
            let request = entry.request.as_mut().ok_or_else(|| {
                EngineError::Validation(format!("transaction entry {index} has no request"))
            })?;

            if let Some(resource) = entry.resource.as_mut() {
                self.resolve_within(ctx, &mut scope, resource, LocalScope::Own)?;

                if request.method == HttpVerb::Post {
                    if let Some(existing) = self.identity().find_existing(ctx, resource)? {
                        tracing::info!(
                            entry = index,
                            resource_type = %existing.resource_type,
                            id = %existing.id,
                            "resource already exists; submitting as update"
                        );
                        *request = BundleRequest::new(
                            HttpVerb::Put,
                            format!("{}/{}", existing.resource_type, existing.id),
                        );
                        resource.set_id(Some(existing.id));
                    }
                }
            }
            prepared.entries.push(entry);
        }
        Ok(prepared)
    }

    /// Prepares and submits a transaction bundle, then audits each entry of the response.
    ///
    /// # Errors
    ///
    /// As [`Engine::prepare_transaction`], plus store failures of the submission itself.
    pub fn submit_transaction(&self, ctx: &CallContext, bundle: &Bundle) -> EngineResult<Bundle> {
        let prepared = self.prepare_transaction(ctx, bundle)?;
        let response = with_retry(self.retry_policy(), ctx, "transaction", || {
            self.store().transaction(ctx, &prepared)
        })?;

        if response.entries.len() != prepared.entries.len() {
            tracing::warn!(
                submitted = prepared.entries.len(),
                returned = response.entries.len(),
                "transaction response entry count differs from the request"
            );
        }
        for (index, (entry, reply)) in prepared.entries.iter().zip(&response.entries).enumerate() {
            let Some(request) = &entry.request else {
                continue;
            };
            match transaction_snapshot(entry, request, reply) {
                Some(snapshot) => self.emit_audit(snapshot, transaction_action(request, reply)),
                None => tracing::warn!(entry = index, "transaction entry cannot be identified; not audited"),
            }
        }

        tracing::info!(entries = response.entries.len(), "transaction submitted");
        Ok(response)
    }
}

fn transaction_action(request: &BundleRequest, reply: &BundleEntry) -> AuditAction {
    let created = reply
        .response
        .as_ref()
        .is_some_and(|r| r.status.starts_with("201"));
    match request.method {
        HttpVerb::Delete => AuditAction::Delete,
        _ if created => AuditAction::Create,
        HttpVerb::Post => AuditAction::Create,
        _ => AuditAction::Update,
    }
}

/// The record a transaction entry wrote, from the response body, its location or the
/// request url, in that order.
fn transaction_snapshot(
    entry: &BundleEntry,
    request: &BundleRequest,
    reply: &BundleEntry,
) -> Option<CanonicalRecord> {
    if let Some(stored) = &reply.resource {
        if let Ok(record) = CanonicalRecord::from_entity(stored.clone()) {
            return Some(record);
        }
    }

    let target = reply
        .response
        .as_ref()
        .and_then(|r| r.location_ref())
        .or_else(|| CanonicalRef::parse(&request.url).ok())?;
    let mut body = entry
        .resource
        .clone()
        .unwrap_or_else(|| Entity::new(target.resource_type));
    body.set_id(Some(target.id.clone()));
    let mut record = CanonicalRecord::from_entity(body).ok()?;
    if target.version.is_some() {
        record.version = target.version;
    }
    Some(record)
}
