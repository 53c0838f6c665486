//! References between entities.
//!
//! A FHIR `Reference` on the wire can mean several different things. [`ReferenceTarget`]
//! makes the resolution mode explicit:
//!
//! | wire shape                             | mode                          |
//! |----------------------------------------|-------------------------------|
//! | `resource: {...}`                      | [`ReferenceTarget::Embedded`] |
//! | `reference: "#x"` / `"urn:uuid:..."`   | [`ReferenceTarget::Local`]    |
//! | `reference: "Type/id"` (or absolute)   | [`ReferenceTarget::Canonical`]|
//! | `identifier: {...}` only               | [`ReferenceTarget::ByIdentifier`] |
//! | anything else (display only, ...)      | [`ReferenceTarget::Opaque`]   |
//!
//! `type`, `identifier` and `display` are kept on the [`Reference`] itself so they survive
//! when the target is rewritten.

use crate::{schema_mismatch, BusinessIdentifier, Entity, FhirError, FhirResult, LogicalId, ResourceType};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

/// A resolved reference to a canonical record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalRef {
    pub resource_type: ResourceType,
    pub id: LogicalId,
    /// `_history` version, if the reference pinned one.
    pub version: Option<String>,
    /// Server base for absolute references, without a trailing slash.
    pub base: Option<String>,
}

impl CanonicalRef {
    pub fn new(resource_type: ResourceType, id: LogicalId) -> Self {
        Self {
            resource_type,
            id,
            version: None,
            base: None,
        }
    }

    /// Parses `Type/id`, `Type/id/_history/v`, or an absolute URL ending in either.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if the string has no `Type/id` tail, or
    /// [`FhirError::UnknownResourceType`] if the type is not supported.
    pub fn parse(literal: &str) -> FhirResult<Self> {
        let trimmed = literal.trim_end_matches('/');
        let mut segments: Vec<&str> = trimmed.split('/').collect();
        let mut version = None;
        if segments.len() >= 4 && segments[segments.len() - 2] == "_history" {
            version = segments.pop().map(str::to_owned);
            segments.pop();
        }
        if segments.len() < 2 {
            return Err(FhirError::InvalidInput(format!(
                "reference '{literal}' is not of the form Type/id"
            )));
        }
        let id_segment = segments[segments.len() - 1];
        let type_segment = segments[segments.len() - 2];
        let resource_type = ResourceType::parse(type_segment)?;
        let id = LogicalId::new(id_segment)
            .map_err(|e| FhirError::InvalidId(format!("{literal}: {e}")))?;
        let base = if segments.len() > 2 {
            Some(segments[..segments.len() - 2].join("/"))
        } else {
            None
        };
        Ok(Self {
            resource_type,
            id,
            version,
            base,
        })
    }
}

impl fmt::Display for CanonicalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(base) = &self.base {
            write!(f, "{base}/")?;
        }
        write!(f, "{}/{}", self.resource_type, self.id)?;
        if let Some(version) = &self.version {
            write!(f, "/_history/{version}")?;
        }
        Ok(())
    }
}

/// How a reference points at its target.
#[derive(Clone, Debug, PartialEq)]
pub enum ReferenceTarget {
    /// Already points at a canonical record.
    Canonical(CanonicalRef),
    /// Only the reference's business identifier is known.
    ByIdentifier,
    /// The target's full body is inlined.
    Embedded(Box<Entity>),
    /// `#contained-id` or a `urn:uuid:` pointer into the enclosing bundle.
    Local(String),
    /// Nothing resolvable; passed through untouched.
    Opaque,
}

/// A reference field value.
#[derive(Clone, Debug, PartialEq)]
pub struct Reference {
    pub target: ReferenceTarget,
    /// The wire `type` element.
    pub type_hint: Option<ResourceType>,
    pub identifier: Option<BusinessIdentifier>,
    pub display: Option<String>,
    extension: Option<Value>,
}

impl Reference {
    fn with_target(target: ReferenceTarget) -> Self {
        Self {
            target,
            type_hint: None,
            identifier: None,
            display: None,
            extension: None,
        }
    }

    /// A plain `Type/id` reference.
    pub fn canonical(resource_type: ResourceType, id: LogicalId) -> Self {
        Self::with_target(ReferenceTarget::Canonical(CanonicalRef::new(resource_type, id)))
    }

    pub fn by_identifier(resource_type: Option<ResourceType>, identifier: BusinessIdentifier) -> Self {
        Self {
            type_hint: resource_type,
            identifier: Some(identifier),
            ..Self::with_target(ReferenceTarget::ByIdentifier)
        }
    }

    pub fn embedded(entity: Entity) -> Self {
        Self::with_target(ReferenceTarget::Embedded(Box::new(entity)))
    }

    pub fn local(pointer: impl Into<String>) -> Self {
        Self::with_target(ReferenceTarget::Local(pointer.into()))
    }

    /// The type this reference is known to point at, if any.
    pub fn target_type(&self) -> Option<ResourceType> {
        match &self.target {
            ReferenceTarget::Canonical(c) => Some(c.resource_type),
            ReferenceTarget::Embedded(entity) => Some(entity.resource_type()),
            _ => self.type_hint,
        }
    }

    pub fn is_canonical(&self) -> bool {
        matches!(self.target, ReferenceTarget::Canonical(_))
    }

    /// Rewrites the target to `Type/id`, dropping any inlined body.
    ///
    /// `type`, `identifier` and `display` are kept.
    pub fn resolve_to(&mut self, resource_type: ResourceType, id: LogicalId) {
        self.target = ReferenceTarget::Canonical(CanonicalRef::new(resource_type, id));
    }

    /// Rewrites the target to a local pointer, dropping any inlined body.
    pub fn point_to(&mut self, pointer: impl Into<String>) {
        self.target = ReferenceTarget::Local(pointer.into());
    }

    /// Parses a FHIR `Reference` JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] on a schema mismatch (including unknown elements),
    /// and the canonical-reference errors of [`CanonicalRef::parse`] for malformed literals.
    /// A `type` that contradicts the literal or embedded body is rejected.
    pub fn from_json(value: &Value) -> FhirResult<Self> {
        let wire: ReferenceWire = serde_path_to_error::deserialize(value)
            .map_err(|e| schema_mismatch("Reference", e))?;

        let type_hint = wire
            .resource_type
            .as_deref()
            .map(ResourceType::parse)
            .transpose()?;

        let target = if let Some(resource) = wire.resource {
            let entity = Entity::from_value(resource)?;
            check_type(type_hint, entity.resource_type())?;
            ReferenceTarget::Embedded(Box::new(entity))
        } else if let Some(literal) = wire.reference.filter(|r| !r.trim().is_empty()) {
            if literal.starts_with('#') || literal.starts_with("urn:") {
                ReferenceTarget::Local(literal)
            } else {
                let canonical = CanonicalRef::parse(&literal)?;
                check_type(type_hint, canonical.resource_type)?;
                ReferenceTarget::Canonical(canonical)
            }
        } else if wire.identifier.is_some() {
            ReferenceTarget::ByIdentifier
        } else {
            ReferenceTarget::Opaque
        };

        Ok(Self {
            target,
            type_hint,
            identifier: wire.identifier,
            display: wire.display,
            extension: wire.extension,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        match &self.target {
            ReferenceTarget::Canonical(c) => {
                map.insert("reference".into(), Value::String(c.to_string()));
            }
            ReferenceTarget::Local(pointer) => {
                map.insert("reference".into(), Value::String(pointer.clone()));
            }
            ReferenceTarget::ByIdentifier
            | ReferenceTarget::Embedded(_)
            | ReferenceTarget::Opaque => {}
        }
        if let Some(ty) = self.type_hint {
            map.insert("type".into(), Value::String(ty.as_str().into()));
        }
        if let Some(identifier) = &self.identifier {
            map.insert("identifier".into(), identifier.to_json());
        }
        if let Some(display) = &self.display {
            map.insert("display".into(), Value::String(display.clone()));
        }
        if let Some(extension) = &self.extension {
            map.insert("extension".into(), extension.clone());
        }
        if let ReferenceTarget::Embedded(entity) = &self.target {
            map.insert("resource".into(), entity.to_value());
        }
        Value::Object(map)
    }
}

fn check_type(hint: Option<ResourceType>, actual: ResourceType) -> FhirResult<()> {
    match hint {
        Some(hint) if hint != actual => Err(FhirError::InvalidInput(format!(
            "reference type {hint} does not match target type {actual}"
        ))),
        _ => Ok(()),
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReferenceWire {
    #[serde(default)]
    reference: Option<String>,
    #[serde(default, rename = "type")]
    resource_type: Option<String>,
    #[serde(default)]
    identifier: Option<BusinessIdentifier>,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    resource: Option<Value>,
    #[serde(default)]
    extension: Option<Value>,
    #[serde(default, rename = "id")]
    _id: Option<String>,
}
