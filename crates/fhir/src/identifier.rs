//! Business identifiers.
//!
//! A business identifier is the `(system, value)` pair used to recognise the same real-world
//! entity across submissions. On the wire it is a FHIR `Identifier`; elements the engine does
//! not use (`use`, `type`, `period`, `assigner`, ...) are carried through unchanged.

use crate::{schema_mismatch, FhirResult, NonEmptyText};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A `(system, value)` identifier with any extra wire elements preserved.
///
/// Blank `system` or `value` strings are treated as absent. Only a *complete* identifier
/// (both parts present) can be used to look up or validate an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "IdentifierWire", into = "IdentifierWire")]
pub struct BusinessIdentifier {
    pub system: Option<NonEmptyText>,
    pub value: Option<NonEmptyText>,
    extra: Map<String, Value>,
}

impl BusinessIdentifier {
    /// Builds a complete identifier.
    pub fn new(system: NonEmptyText, value: NonEmptyText) -> Self {
        Self {
            system: Some(system),
            value: Some(value),
            extra: Map::new(),
        }
    }

    /// Builds an identifier from raw strings, mapping blanks to absent parts.
    pub fn from_parts(system: Option<&str>, value: Option<&str>) -> Self {
        Self {
            system: NonEmptyText::from_optional(system),
            value: NonEmptyText::from_optional(value),
            extra: Map::new(),
        }
    }

    /// True when both system and value are present.
    pub fn is_complete(&self) -> bool {
        self.system.is_some() && self.value.is_some()
    }

    /// Returns `(system, value)` for a complete identifier.
    pub fn key(&self) -> Option<(&str, &str)> {
        match (&self.system, &self.value) {
            (Some(system), Some(value)) => Some((system.as_str(), value.as_str())),
            _ => None,
        }
    }

    pub fn system_str(&self) -> Option<&str> {
        self.system.as_ref().map(NonEmptyText::as_str)
    }

    /// Parses a single FHIR `Identifier` JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FhirError::Translation`] naming the failing path if the value is not an
    /// identifier object.
    pub fn from_json(value: &Value) -> FhirResult<Self> {
        let wire: IdentifierWire = serde_path_to_error::deserialize(value)
            .map_err(|e| schema_mismatch("Identifier", e))?;
        Ok(wire.into())
    }

    pub fn to_json(&self) -> Value {
        let wire = IdentifierWire::from(self.clone());
        let mut map = Map::new();
        if let Some(system) = wire.system {
            map.insert("system".into(), Value::String(system));
        }
        if let Some(value) = wire.value {
            map.insert("value".into(), Value::String(value));
        }
        map.extend(wire.extra);
        Value::Object(map)
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct IdentifierWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<IdentifierWire> for BusinessIdentifier {
    fn from(wire: IdentifierWire) -> Self {
        Self {
            system: NonEmptyText::from_optional(wire.system.as_deref()),
            value: NonEmptyText::from_optional(wire.value.as_deref()),
            extra: wire.extra,
        }
    }
}

impl From<BusinessIdentifier> for IdentifierWire {
    fn from(identifier: BusinessIdentifier) -> Self {
        Self {
            system: identifier.system.map(|s| s.as_str().to_owned()),
            value: identifier.value.map(|v| v.as_str().to_owned()),
            extra: identifier.extra,
        }
    }
}
