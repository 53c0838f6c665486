//! Audit records and emitters.
//!
//! Every create, update and delete made by the engine produces an [`AuditRecord`]. Emitting
//! is best-effort: the engine logs emitter failures at error level and carries on.
//!
//! The FHIR-shaped event built by [`AuditRecord::to_audit_event`] references the record and
//! carries a SHA-256 digest of the snapshot, never the clinical body itself.

use crate::constants::{AUDIT_TARGET, ENGINE_NAME};
use crate::store::CanonicalRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    /// FHIR `AuditEvent.action` code.
    pub fn code(self) -> &'static str {
        match self {
            AuditAction::Create => "C",
            AuditAction::Update => "U",
            AuditAction::Delete => "D",
        }
    }

    /// FHIR restful-interaction code.
    pub fn interaction(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.interaction())
    }
}

/// One audited write.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditRecord {
    pub snapshot: CanonicalRecord,
    pub action: AuditAction,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(snapshot: CanonicalRecord, action: AuditAction) -> Self {
        Self {
            snapshot,
            action,
            recorded_at: Utc::now(),
        }
    }

    /// Hex SHA-256 of the snapshot's JSON rendering.
    pub fn snapshot_digest(&self) -> String {
        let rendered = self.snapshot.entity.to_value().to_string();
        hex::encode(Sha256::digest(rendered.as_bytes()))
    }

    /// Builds a FHIR `AuditEvent` describing this record.
    pub fn to_audit_event(&self) -> Value {
        let what = match &self.snapshot.version {
            Some(v) => format!(
                "{}/{}/_history/{v}",
                self.snapshot.resource_type, self.snapshot.id
            ),
            None => format!("{}/{}", self.snapshot.resource_type, self.snapshot.id),
        };
        json!({
            "resourceType": "AuditEvent",
            "type": {
                "system": "http://terminology.hl7.org/CodeSystem/audit-event-type",
                "code": "rest",
                "display": "RESTful Operation"
            },
            "subtype": [{
                "system": "http://hl7.org/fhir/restful-interaction",
                "code": self.action.interaction()
            }],
            "action": self.action.code(),
            "recorded": self.recorded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "outcome": "0",
            "agent": [{"requestor": false, "who": {"display": ENGINE_NAME}}],
            "source": {"observer": {"display": ENGINE_NAME}},
            "entity": [{
                "what": {"reference": what},
                "detail": [{"type": "sha256", "valueString": self.snapshot_digest()}]
            }]
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Sink(String),
    #[error("failed to serialize audit event: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AuditResult<T> = std::result::Result<T, AuditError>;

/// Destination for audit records.
pub trait AuditEmitter: Send + Sync {
    fn record(&self, record: &AuditRecord) -> AuditResult<()>;
}

/// Writes each audit event as JSON to the `tie::audit` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditEmitter;

impl AuditEmitter for TracingAuditEmitter {
    fn record(&self, record: &AuditRecord) -> AuditResult<()> {
        let event = serde_json::to_string(&record.to_audit_event())?;
        tracing::info!(
            target: AUDIT_TARGET,
            action = %record.action,
            resource_type = %record.snapshot.resource_type,
            id = %record.snapshot.id,
            event = %event,
            "audit"
        );
        Ok(())
    }
}

/// Keeps audit records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditEmitter {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditEmitter for MemoryAuditEmitter {
    fn record(&self, record: &AuditRecord) -> AuditResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::Entity;
    use serde_json::json;

    fn record(action: AuditAction) -> AuditRecord {
        let entity = Entity::from_value(json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"versionId": "2"},
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}]
        }))
        .expect("valid patient");
        AuditRecord::new(
            CanonicalRecord::from_entity(entity).expect("record"),
            action,
        )
    }

    #[test]
    fn audit_event_references_record_without_clinical_body() {
        let event = record(AuditAction::Update).to_audit_event();
        assert_eq!(event["action"], "U");
        assert_eq!(event["type"]["code"], "rest");
        assert_eq!(event["subtype"][0]["code"], "update");
        assert_eq!(event["entity"][0]["what"]["reference"], "Patient/p1/_history/2");
        let digest = event["entity"][0]["detail"][0]["valueString"]
            .as_str()
            .expect("digest");
        assert_eq!(digest.len(), 64);
        assert!(!event.to_string().contains("9999999999"));
    }

    #[test]
    fn digest_is_stable_for_same_snapshot() {
        let a = record(AuditAction::Create);
        let b = record(AuditAction::Delete);
        assert_eq!(a.snapshot_digest(), b.snapshot_digest());
    }

    #[test]
    fn memory_emitter_collects() {
        let emitter = MemoryAuditEmitter::new();
        emitter.record(&record(AuditAction::Create)).expect("record");
        TracingAuditEmitter
            .record(&record(AuditAction::Create))
            .expect("tracing emitter never fails on valid records");
        assert_eq!(emitter.records().len(), 1);
        assert_eq!(emitter.records()[0].action, AuditAction::Create);
    }
}
