//! Fixtures shared by the engine's unit tests.

use crate::audit::{AuditEmitter, AuditError, AuditRecord, AuditResult, MemoryAuditEmitter};
use crate::store::InMemoryStore;
use crate::upsert::Engine;
use fhir::systems::{NHS_NUMBER, ODS_ORGANIZATION_CODE};
use fhir::{BusinessIdentifier, Entity};
use serde_json::json;
use std::sync::Arc;

pub(crate) fn with_identifier(system: &str, value: &str) -> BusinessIdentifier {
    BusinessIdentifier::from_parts(Some(system), Some(value))
}

pub(crate) fn organization(ods: &str) -> Entity {
    Entity::from_value(json!({
        "resourceType": "Organization",
        "identifier": [{"system": ODS_ORGANIZATION_CODE, "value": ods}],
        "name": format!("Organisation {ods}")
    }))
    .expect("valid organization")
}

/// A patient whose GP is referenced by ODS code.
pub(crate) fn patient(nhs: &str, gp_ods: &str) -> Entity {
    Entity::from_value(json!({
        "resourceType": "Patient",
        "identifier": [{"system": NHS_NUMBER, "value": nhs}],
        "name": [{"family": "Smith", "given": ["Jo"]}],
        "generalPractitioner": [{
            "type": "Organization",
            "identifier": {"system": ODS_ORGANIZATION_CODE, "value": gp_ods}
        }]
    }))
    .expect("valid patient")
}

/// Engine over an in-memory store with an in-memory audit sink.
pub(crate) fn engine() -> (Engine, Arc<InMemoryStore>, Arc<MemoryAuditEmitter>) {
    let store = Arc::new(InMemoryStore::new());
    let audit = Arc::new(MemoryAuditEmitter::new());
    let engine = Engine::new(store.clone(), audit.clone());
    (engine, store, audit)
}

/// Audit sink that is always down.
pub(crate) struct FailingAuditEmitter;

impl AuditEmitter for FailingAuditEmitter {
    fn record(&self, _record: &AuditRecord) -> AuditResult<()> {
        Err(AuditError::Sink("connection refused".into()))
    }
}
