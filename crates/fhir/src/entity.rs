//! Typed clinical entities.
//!
//! An [`Entity`] is a FHIR resource split into the parts the engine works with (type, logical
//! id, business identifiers, reference slots, contained resources) and an untyped body that
//! holds everything else verbatim.
//!
//! Reference slots remember the JSON pointer they were read from. Rendering writes each slot
//! back at its pointer and removes the pointers of dropped slots, so attributes around a
//! reference (for example the `role` next to `participant.individual`) are preserved.

use crate::{
    descriptor::{ReferenceField, UNDECLARED},
    pointer, schema_mismatch, BusinessIdentifier, FhirError,
    FhirResult, LogicalId, Reference, ResourceType,
};
use serde::Deserialize;
use serde_json::{Map, Value};

/// One reference-valued position inside an entity.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceSlot {
    pub field: &'static ReferenceField,
    /// JSON pointer relative to the resource root.
    pub pointer: String,
    pub reference: Reference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IdentifierShape {
    List,
    Single,
}

/// A parsed resource.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    resource_type: ResourceType,
    id: Option<LogicalId>,
    identifiers: Vec<BusinessIdentifier>,
    identifier_shape: IdentifierShape,
    references: Vec<ReferenceSlot>,
    removed: Vec<String>,
    contained: Vec<Entity>,
    body: Map<String, Value>,
}

#[derive(Deserialize)]
struct ResourceWire {
    #[serde(rename = "resourceType")]
    resource_type: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    identifier: Option<Value>,
    #[serde(default)]
    contained: Option<Vec<Value>>,
    #[serde(flatten)]
    body: Map<String, Value>,
}

impl Entity {
    /// Creates an empty entity of the given type.
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            id: None,
            identifiers: Vec::new(),
            identifier_shape: IdentifierShape::List,
            references: Vec::new(),
            removed: Vec::new(),
            contained: Vec::new(),
            body: Map::new(),
        }
    }

    // ========================================================================
    // PARSING AND RENDERING
    // ========================================================================

    /// Parses a resource from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidJson`] for malformed JSON, and the errors of
    /// [`Entity::from_value`] otherwise.
    pub fn parse_json(input: &str) -> FhirResult<Self> {
        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    /// Parses a resource from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidYaml`] for malformed YAML, and the errors of
    /// [`Entity::from_value`] otherwise.
    pub fn parse_yaml(input: &str) -> FhirResult<Self> {
        let value: Value = serde_yaml::from_str(input)?;
        Self::from_value(value)
    }

    /// Builds an entity from a JSON value.
    ///
    /// Every reference field declared for the type is parsed into a [`ReferenceSlot`].
    ///
    /// # Errors
    ///
    /// - [`FhirError::Translation`] if the value is not a resource object, or a reference or
    ///   identifier does not match its schema.
    /// - [`FhirError::UnknownResourceType`] for an unsupported `resourceType`.
    /// - [`FhirError::InvalidId`] for a malformed logical id.
    pub fn from_value(value: Value) -> FhirResult<Self> {
        let wire: ResourceWire =
            serde_path_to_error::deserialize(value).map_err(|e| schema_mismatch("Resource", e))?;
        let resource_type = ResourceType::parse(&wire.resource_type)?;

        let id = match wire.id {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(
                LogicalId::new(&s)
                    .map_err(|e| FhirError::InvalidId(format!("{resource_type}.id '{s}': {e}")))?,
            ),
            Some(other) => {
                return Err(FhirError::InvalidId(format!(
                    "{resource_type}.id must be a string, got {other}"
                )))
            }
        };

        let (identifiers, identifier_shape) = match wire.identifier {
            None | Some(Value::Null) => (Vec::new(), IdentifierShape::List),
            Some(Value::Array(items)) => (
                items
                    .iter()
                    .map(BusinessIdentifier::from_json)
                    .collect::<FhirResult<Vec<_>>>()?,
                IdentifierShape::List,
            ),
            Some(single) => (
                vec![BusinessIdentifier::from_json(&single)?],
                IdentifierShape::Single,
            ),
        };

        let contained = wire
            .contained
            .unwrap_or_default()
            .into_iter()
            .map(Entity::from_value)
            .collect::<FhirResult<Vec<_>>>()?;

        let mut references = Vec::new();
        for field in resource_type.descriptor().reference_fields {
            for slot_pointer in pointer::expand(&wire.body, field.path) {
                let Some(raw) = pointer_get(&wire.body, &slot_pointer) else {
                    continue;
                };
                let reference = Reference::from_json(raw).map_err(|e| {
                    FhirError::Translation(format!(
                        "{resource_type}.{} at {slot_pointer}: {e}",
                        field.path
                    ))
                })?;
                references.push(ReferenceSlot {
                    field,
                    pointer: slot_pointer,
                    reference,
                });
            }
        }

        Ok(Self {
            resource_type,
            id,
            identifiers,
            identifier_shape,
            references,
            removed: Vec::new(),
            contained,
            body: wire.body,
        })
    }

    /// Renders the entity back to a FHIR JSON value.
    pub fn to_value(&self) -> Value {
        let mut body = self.body.clone();
        for slot in &self.references {
            pointer::set(&mut body, &slot.pointer, slot.reference.to_value());
        }
        pointer::remove_all(&mut body, &self.removed);

        let mut out = Map::new();
        out.insert(
            "resourceType".into(),
            Value::String(self.resource_type.as_str().into()),
        );
        if let Some(id) = &self.id {
            out.insert("id".into(), Value::String(id.as_str().into()));
        }
        if !self.contained.is_empty() {
            out.insert(
                "contained".into(),
                Value::Array(self.contained.iter().map(Entity::to_value).collect()),
            );
        }
        match (self.identifier_shape, self.identifiers.as_slice()) {
            (_, []) => {}
            (IdentifierShape::Single, [only]) => {
                out.insert("identifier".into(), only.to_json());
            }
            (_, all) => {
                out.insert(
                    "identifier".into(),
                    Value::Array(all.iter().map(BusinessIdentifier::to_json).collect()),
                );
            }
        }
        out.extend(body);
        Value::Object(out)
    }

    /// Renders pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidJson`] if serialisation fails.
    pub fn render_json(&self) -> FhirResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }

    /// Renders YAML.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidYaml`] if serialisation fails.
    pub fn render_yaml(&self) -> FhirResult<String> {
        Ok(serde_yaml::to_string(&self.to_value())?)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn id(&self) -> Option<&LogicalId> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: Option<LogicalId>) {
        self.id = id;
    }

    pub fn identifiers(&self) -> &[BusinessIdentifier] {
        &self.identifiers
    }

    pub fn push_identifier(&mut self, identifier: BusinessIdentifier) {
        if !self.identifiers.is_empty() {
            self.identifier_shape = IdentifierShape::List;
        }
        self.identifiers.push(identifier);
    }

    /// Iterates the identifiers carrying both system and value, in wire order.
    pub fn complete_identifiers(&self) -> impl Iterator<Item = &BusinessIdentifier> {
        self.identifiers.iter().filter(|i| i.is_complete())
    }

    pub fn first_complete_identifier(&self) -> Option<&BusinessIdentifier> {
        self.complete_identifiers().next()
    }

    /// Reference to this entity by logical id, if it has one.
    pub fn canonical_reference(&self) -> Option<Reference> {
        self.id
            .as_ref()
            .map(|id| Reference::canonical(self.resource_type, id.clone()))
    }

    /// Returns a body attribute that is not one of the modelled parts.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// `meta.versionId`, if present.
    pub fn version_id(&self) -> Option<&str> {
        self.body
            .get("meta")
            .and_then(|meta| meta.get("versionId"))
            .and_then(Value::as_str)
    }

    /// Sets `meta.versionId` and `meta.lastUpdated`, keeping any other `meta` elements.
    pub fn stamp_meta(&mut self, version_id: &str, last_updated: &str) {
        let meta = self
            .body
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Value::Object(meta) = meta {
            meta.insert("versionId".into(), Value::String(version_id.into()));
            meta.insert("lastUpdated".into(), Value::String(last_updated.into()));
        }
    }

    // ========================================================================
    // REFERENCES
    // ========================================================================

    pub fn references(&self) -> &[ReferenceSlot] {
        &self.references
    }

    pub fn references_mut(&mut self) -> &mut [ReferenceSlot] {
        &mut self.references
    }

    /// Removes a reference slot; its position is deleted from the rendered body.
    ///
    /// Returns `None` if `index` is out of range.
    pub fn drop_reference(&mut self, index: usize) -> Option<ReferenceSlot> {
        if index >= self.references.len() {
            return None;
        }
        let slot = self.references.remove(index);
        self.removed.push(slot.pointer.clone());
        Some(slot)
    }

    /// Turns reference objects found outside the declared fields into slots.
    ///
    /// Any body object with a string `reference` member counts; the new slots carry
    /// [`UNDECLARED`]. Objects that do not parse as a reference are left in the body and their
    /// pointers returned.
    pub fn adopt_undeclared_references(&mut self) -> Vec<String> {
        let found = {
            let covered: Vec<&str> = self
                .references
                .iter()
                .map(|s| s.pointer.as_str())
                .chain(self.removed.iter().map(String::as_str))
                .collect();
            pointer::find_references(&self.body, &|p| {
                covered.iter().any(|c| pointer::is_within(p, c))
            })
        };

        let mut unreadable = Vec::new();
        for slot_pointer in found {
            let parsed = pointer_get(&self.body, &slot_pointer).map(Reference::from_json);
            match parsed {
                Some(Ok(reference)) => self.references.push(ReferenceSlot {
                    field: &UNDECLARED,
                    pointer: slot_pointer,
                    reference,
                }),
                _ => unreadable.push(slot_pointer),
            }
        }
        unreadable
    }

    /// Removes whatever the body holds at `pointer` from the rendered entity.
    pub fn remove_at(&mut self, pointer: &str) {
        self.removed.push(pointer.to_owned());
    }

    /// Sets a single-valued top-level reference field, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if `path` is not a declared top-level single
    /// reference field of this entity's type.
    pub fn set_reference(&mut self, path: &str, reference: Reference) -> FhirResult<()> {
        let field = self
            .resource_type
            .descriptor()
            .field(path)
            .filter(|f| f.is_top_level() && !f.many)
            .ok_or_else(|| {
                FhirError::InvalidInput(format!(
                    "{} has no single-valued reference field '{path}'",
                    self.resource_type
                ))
            })?;
        let slot_pointer = format!("/{path}");
        self.removed.retain(|p| p != &slot_pointer);
        match self.references.iter_mut().find(|s| s.pointer == slot_pointer) {
            Some(slot) => slot.reference = reference,
            None => self.references.push(ReferenceSlot {
                field,
                pointer: slot_pointer,
                reference,
            }),
        }
        Ok(())
    }

    // ========================================================================
    // CONTAINED RESOURCES
    // ========================================================================

    pub fn contained(&self) -> &[Entity] {
        &self.contained
    }

    /// Finds a contained resource by local id (`#` prefix optional).
    pub fn find_contained(&self, local_id: &str) -> Option<&Entity> {
        let local_id = local_id.strip_prefix('#').unwrap_or(local_id);
        self.contained
            .iter()
            .find(|c| c.id.as_ref().is_some_and(|id| id.as_str() == local_id))
    }

    /// Removes and returns all contained resources.
    pub fn take_contained(&mut self) -> Vec<Entity> {
        std::mem::take(&mut self.contained)
    }
}

fn pointer_get<'a>(body: &'a Map<String, Value>, slot_pointer: &str) -> Option<&'a Value> {
    let (first, rest) = match slot_pointer[1..].split_once('/') {
        Some((first, rest)) => (first, format!("/{rest}")),
        None => (&slot_pointer[1..], String::new()),
    };
    body.get(first)?.pointer(&rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReferenceTarget;
    use serde_json::json;

    fn patient() -> Entity {
        Entity::from_value(json!({
            "resourceType": "Patient",
            "id": "p1",
            "identifier": [
                {"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}
            ],
            "active": true,
            "generalPractitioner": [
                {"identifier": {"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "RR8"}},
                {"reference": "#gp"}
            ],
            "contained": [
                {"resourceType": "Practitioner", "id": "gp", "name": [{"family": "Who"}]}
            ]
        }))
        .expect("valid patient")
    }

    #[test]
    fn parses_modelled_parts() {
        let entity = patient();
        assert_eq!(entity.resource_type(), ResourceType::Patient);
        assert_eq!(entity.id().map(LogicalId::as_str), Some("p1"));
        assert_eq!(entity.identifiers().len(), 1);
        assert!(entity.first_complete_identifier().is_some());
        assert_eq!(entity.references().len(), 2);
        assert_eq!(entity.references()[0].pointer, "/generalPractitioner/0");
        assert_eq!(entity.references()[1].reference.target, ReferenceTarget::Local("#gp".into()));
        assert!(entity.find_contained("#gp").is_some());
        assert_eq!(entity.attribute("active"), Some(&json!(true)));
    }

    #[test]
    fn rendering_writes_back_rewritten_and_dropped_slots() {
        let mut entity = patient();
        entity.references_mut()[0]
            .reference
            .resolve_to(ResourceType::Organization, LogicalId::new("org-1").expect("id"));
        entity.drop_reference(1).expect("slot");
        entity.take_contained();

        let rendered = entity.to_value();
        let gps = rendered["generalPractitioner"].as_array().expect("array");
        assert_eq!(gps.len(), 1);
        assert_eq!(gps[0]["reference"], "Organization/org-1");
        assert!(rendered.get("contained").is_none());
        assert_eq!(rendered["active"], true);
    }

    #[test]
    fn nested_reference_paths_keep_siblings() {
        let entity = Entity::from_value(json!({
            "resourceType": "Encounter",
            "participant": [
                {"type": [{"text": "attender"}], "individual": {"reference": "Practitioner/a"}}
            ]
        }))
        .expect("valid encounter");
        assert_eq!(entity.references()[0].field.path, "participant.individual");
        let rendered = entity.to_value();
        assert_eq!(rendered["participant"][0]["type"][0]["text"], "attender");
        assert_eq!(rendered["participant"][0]["individual"]["reference"], "Practitioner/a");
    }

    #[test]
    fn references_outside_declared_fields_are_adopted() {
        let mut obs = Entity::from_value(json!({
            "resourceType": "Observation",
            "performer": [{"reference": "Practitioner/a"}],
            "focus": [{"reference": "Condition/c1"}],
            "extension": [{"url": "https://example.org/ext", "valueReference": {"reference": "#dev"}}],
            "note": [{"authorReference": {"reference": "ValueSet/not-a-resource"}}]
        }))
        .expect("valid observation");
        assert_eq!(obs.references().len(), 1);

        let unreadable = obs.adopt_undeclared_references();
        assert_eq!(unreadable, vec!["/note/0/authorReference".to_owned()]);
        let pointers: Vec<&str> = obs.references().iter().map(|s| s.pointer.as_str()).collect();
        assert_eq!(
            pointers,
            vec!["/performer/0", "/focus/0", "/extension/0/valueReference"]
        );
        assert!(std::ptr::eq(obs.references()[1].field, &UNDECLARED));
        assert!(obs.adopt_undeclared_references().len() == 1);
        assert_eq!(obs.references().len(), 3);

        obs.drop_reference(1).expect("slot");
        obs.remove_at("/note/0/authorReference");
        let rendered = obs.to_value();
        assert!(rendered.get("focus").is_none());
        assert!(rendered["note"][0].get("authorReference").is_none());
        assert_eq!(rendered["extension"][0]["valueReference"]["reference"], "#dev");
    }

    #[test]
    fn set_reference_only_for_single_top_level_fields() {
        let mut obs = Entity::from_value(json!({"resourceType": "Observation", "status": "final"}))
            .expect("valid observation");
        obs.set_reference("subject", Reference::local("urn:uuid:1"))
            .expect("subject is single");
        assert_eq!(obs.to_value()["subject"]["reference"], "urn:uuid:1");
        assert!(obs.set_reference("performer", Reference::local("x")).is_err());
        assert!(obs.set_reference("status", Reference::local("x")).is_err());
    }

    #[test]
    fn single_identifier_shape_is_preserved() {
        let composition = Entity::from_value(json!({
            "resourceType": "Composition",
            "identifier": {"system": "https://tools.ietf.org/html/rfc4122", "value": "abc"}
        }))
        .expect("valid composition");
        assert!(composition.to_value()["identifier"].is_object());
    }

    #[test]
    fn parse_errors_name_the_failure() {
        let unknown = Entity::parse_json(r#"{"resourceType": "Widget"}"#);
        assert!(matches!(unknown, Err(FhirError::UnknownResourceType(_))));

        let bad_ref = Entity::from_value(json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/1", "bogus": 1}
        }))
        .unwrap_err();
        assert!(bad_ref.to_string().contains("Observation.subject at /subject"));

        let bad_id = Entity::from_value(json!({"resourceType": "Patient", "id": "a/b"}));
        assert!(matches!(bad_id, Err(FhirError::InvalidId(_))));
    }

    #[test]
    fn yaml_input_is_accepted() {
        let yaml = "resourceType: Organization\nidentifier:\n  - system: https://fhir.nhs.uk/Id/ods-organization-code\n    value: RR8\nname: Leeds\n";
        let org = Entity::parse_yaml(yaml).expect("valid yaml");
        assert_eq!(org.resource_type(), ResourceType::Organization);
        assert!(org.render_yaml().expect("render").contains("Leeds"));
    }
}
