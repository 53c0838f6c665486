//! Reference resolver.
//!
//! Turns the reference fields of an entity into canonical `Type/id` references:
//!
//! - *canonical* and *opaque* references pass through untouched;
//! - *by-identifier* references are looked up and rewritten when a record exists; a missing
//!   target is never fabricated, the reference is left as it was;
//! - *embedded* bodies, and *local* pointers into the entity's contained list or the enclosing
//!   bundle, are upserted recursively and replaced by a reference to the result.
//!
//! A contained resource resolves its own `#id` pointers against the list it was taken from,
//! so siblings can point at each other. Each local target is written once per call tree.
//! References outside the descriptor's fields are adopted and resolved like declared ones.
//!
//! Recursion is bounded twice over. An entity already being upserted on the current path is
//! not re-entered (it is resolved by identity lookup only), and nesting deeper than the
//! configured maximum fails with [`EngineError::ReferenceDepthExceeded`].

use crate::retry::CallContext;
use crate::upsert::{Engine, UpsertOutcome};
use crate::{EngineError, EngineResult};
use fhir::systems::resource_type_for_system;
use fhir::{Bundle, Entity, Reference, ReferenceField, ReferenceTarget, ResourceType};
use std::collections::HashMap;

type IdentityKey = (ResourceType, String, String);

/// Complete identifiers of `entity`, as `(type, system, value)` keys.
fn identity_keys(entity: &Entity) -> Vec<IdentityKey> {
    entity
        .complete_identifiers()
        .filter_map(|i| i.key())
        .map(|(system, value)| (entity.resource_type(), system.to_owned(), value.to_owned()))
        .collect()
}

/// Where an entity's `#id` pointers are looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalScope {
    /// The entity's own contained list.
    Own,
    /// A contained list already taken from the entity's container, by index into
    /// [`Scope::containers`].
    Container(usize),
}

/// State of one resolution call tree.
pub(crate) struct Scope<'g> {
    graph: Option<&'g Bundle>,
    path: Vec<Vec<IdentityKey>>,
    /// Bundle pointers already upserted in this call, by `fullUrl`.
    pub(crate) written: HashMap<String, UpsertOutcome>,
    /// Contained lists stripped so far.
    containers: Vec<Vec<Entity>>,
    /// Contained targets already upserted, by container and `#id` pointer.
    contained_written: HashMap<(usize, String), UpsertOutcome>,
}

impl<'g> Scope<'g> {
    pub(crate) fn new(graph: Option<&'g Bundle>) -> Self {
        Self {
            graph,
            path: Vec::new(),
            written: HashMap::new(),
            containers: Vec::new(),
            contained_written: HashMap::new(),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.path.len()
    }

    fn in_progress(&self, entity: &Entity) -> bool {
        let keys = identity_keys(entity);
        self.path
            .iter()
            .any(|frame| frame.iter().any(|k| keys.contains(k)))
    }
}

impl Engine {
    /// Resolves every reference field of `entity` in place, without writing `entity` itself.
    ///
    /// Embedded and contained bodies are upserted as standalone records, and the contained
    /// list is stripped afterwards.
    ///
    /// # Errors
    ///
    /// Store failures and validation failures of embedded bodies.
    pub fn resolve_references(&self, ctx: &CallContext, entity: &mut Entity) -> EngineResult<()> {
        let mut scope = Scope::new(None);
        self.resolve_within(ctx, &mut scope, entity, LocalScope::Own)
    }

    /// Resolves a single reference that is not attached to a field.
    ///
    /// # Errors
    ///
    /// As [`Engine::resolve_references`].
    pub fn resolve(&self, ctx: &CallContext, reference: &Reference) -> EngineResult<Reference> {
        let mut scope = Scope::new(None);
        let mut resolved = reference.clone();
        self.resolve_reference(ctx, &mut scope, None, None, &mut resolved)?;
        Ok(resolved)
    }

    /// Resolves `entity`'s references with `entity` marked as in progress.
    pub(crate) fn resolve_within(
        &self,
        ctx: &CallContext,
        scope: &mut Scope<'_>,
        entity: &mut Entity,
        local: LocalScope,
    ) -> EngineResult<()> {
        scope.path.push(identity_keys(entity));
        let result = self.resolve_fields(ctx, scope, entity, local);
        scope.path.pop();
        result
    }

    fn resolve_fields(
        &self,
        ctx: &CallContext,
        scope: &mut Scope<'_>,
        entity: &mut Entity,
        local: LocalScope,
    ) -> EngineResult<()> {
        let resource_type = entity.resource_type();
        for pointer in entity.adopt_undeclared_references() {
            tracing::debug!(%resource_type, %pointer, "unreadable reference left as it was");
        }

        let contained = entity.take_contained();
        let container = if contained.is_empty() {
            match local {
                LocalScope::Container(index) => Some(index),
                LocalScope::Own => None,
            }
        } else {
            tracing::debug!(
                %resource_type,
                count = contained.len(),
                "stripped contained resources"
            );
            scope.containers.push(contained);
            Some(scope.containers.len() - 1)
        };

        for slot in entity.references_mut() {
            self.resolve_reference(ctx, scope, container, Some(slot.field), &mut slot.reference)?;
        }
        Ok(())
    }

    fn resolve_reference(
        &self,
        ctx: &CallContext,
        scope: &mut Scope<'_>,
        container: Option<usize>,
        field: Option<&ReferenceField>,
        reference: &mut Reference,
    ) -> EngineResult<()> {
        match &reference.target {
            ReferenceTarget::Canonical(_) | ReferenceTarget::Opaque => Ok(()),
            ReferenceTarget::ByIdentifier => self.resolve_by_identifier(ctx, field, reference),
            ReferenceTarget::Embedded(body) => {
                let body = (**body).clone();
                self.resolve_body(ctx, scope, LocalScope::Own, body, reference)?;
                Ok(())
            }
            ReferenceTarget::Local(pointer) => {
                let pointer = pointer.clone();
                let contained_key = pointer
                    .starts_with('#')
                    .then_some(container)
                    .flatten()
                    .map(|index| (index, pointer.clone()));
                let done = match &contained_key {
                    Some(key) => scope.contained_written.get(key),
                    None => scope.written.get(&pointer),
                };
                if let Some(done) = done {
                    reference.resolve_to(done.record.resource_type, done.record.id.clone());
                    return Ok(());
                }

                let target = match (pointer.strip_prefix('#'), container) {
                    (Some(local), Some(index)) => scope.containers[index]
                        .iter()
                        .find(|c| c.id().is_some_and(|id| id.as_str() == local))
                        .cloned()
                        .map(|body| (body, LocalScope::Container(index))),
                    (Some(_), None) => None,
                    (None, _) => scope
                        .graph
                        .and_then(|bundle| bundle.find_resource(None, &pointer))
                        .cloned()
                        .map(|body| (body, LocalScope::Own)),
                };
                match target {
                    Some((body, local)) => {
                        let Some(outcome) = self.resolve_body(ctx, scope, local, body, reference)?
                        else {
                            return Ok(());
                        };
                        match contained_key {
                            Some(key) => scope.contained_written.insert(key, outcome),
                            None => scope.written.insert(pointer, outcome),
                        };
                        Ok(())
                    }
                    None => {
                        tracing::warn!(
                            field = field.map(|f| f.path),
                            pointer = %pointer,
                            "local reference has no target; leaving it unchanged"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    fn resolve_by_identifier(
        &self,
        ctx: &CallContext,
        field: Option<&ReferenceField>,
        reference: &mut Reference,
    ) -> EngineResult<()> {
        let Some(identifier) = reference.identifier.clone() else {
            return Ok(());
        };
        if !identifier.is_complete() {
            tracing::debug!("partial identifier on reference; leaving it unresolved");
            return Ok(());
        }

        let target_type = reference
            .type_hint
            .or_else(|| identifier.system_str().and_then(resource_type_for_system))
            .or_else(|| field.and_then(ReferenceField::sole_target));
        let Some(target_type) = target_type else {
            tracing::warn!(
                field = field.map(|f| f.path),
                system = identifier.system_str(),
                "cannot determine target type of identifier reference; leaving it unresolved"
            );
            return Ok(());
        };
        if let Some(field) = field.filter(|f| !f.accepts(target_type)) {
            tracing::warn!(
                field = field.path,
                %target_type,
                "identifier reference targets a type the field does not allow; leaving it unresolved"
            );
            return Ok(());
        }

        match self.identity().lookup(ctx, target_type, &identifier)? {
            Some(record) => {
                tracing::debug!(%target_type, id = %record.id, "resolved identifier reference");
                reference.resolve_to(record.resource_type, record.id);
            }
            None => {
                tracing::debug!(%target_type, "no canonical record for identifier reference; passing it through");
            }
        }
        Ok(())
    }

    /// Upserts an inlined or pointed-to body and points `reference` at the result.
    ///
    /// Returns `None` when `body` is already in progress and was resolved by identity only.
    fn resolve_body(
        &self,
        ctx: &CallContext,
        scope: &mut Scope<'_>,
        local: LocalScope,
        body: Entity,
        reference: &mut Reference,
    ) -> EngineResult<Option<UpsertOutcome>> {
        if scope.in_progress(&body) {
            tracing::warn!(
                resource_type = %body.resource_type(),
                "reference cycle detected; resolving by identity only"
            );
            match self.identity().find_existing(ctx, &body)? {
                Some(record) => reference.resolve_to(record.resource_type, record.id),
                None => {
                    reference.type_hint = Some(body.resource_type());
                    reference.identifier = body.first_complete_identifier().cloned();
                    reference.target = ReferenceTarget::ByIdentifier;
                }
            }
            return Ok(None);
        }

        let outcome = self.upsert_in_scope(ctx, scope, body, local)?;
        reference.resolve_to(outcome.record.resource_type, outcome.record.id.clone());
        Ok(Some(outcome))
    }

    pub(crate) fn check_depth(&self, scope: &Scope<'_>) -> EngineResult<()> {
        if scope.depth() >= self.max_reference_depth() {
            return Err(EngineError::ReferenceDepthExceeded {
                max: self.max_reference_depth(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::AuditAction;
    use crate::retry::CallContext;
    use crate::store::{StoreClient, StoreOperation};
    use crate::test_support::{engine, organization, with_identifier};
    use crate::EngineError;
    use fhir::{Bundle, Entity, Reference, ReferenceTarget, ResourceType};
    use serde_json::json;

    #[test]
    fn identifier_reference_resolves_to_existing_record() {
        let (engine, store, _) = engine();
        let ctx = CallContext::new();
        let org = store.create(&ctx, &organization("RR8")).expect("seed");

        let mut patient = Entity::from_value(json!({
            "resourceType": "Patient",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}],
            "managingOrganization": {
                "identifier": {"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "RR8"}
            }
        }))
        .expect("valid patient");
        engine.resolve_references(&ctx, &mut patient).expect("resolve");
        assert_eq!(
            patient.to_value()["managingOrganization"]["reference"],
            format!("Organization/{}", org.id)
        );
    }

    #[test]
    fn missing_identifier_target_is_not_fabricated() {
        let (engine, store, audit) = engine();
        let reference = Reference::by_identifier(
            Some(ResourceType::Organization),
            with_identifier("https://fhir.nhs.uk/Id/ods-organization-code", "RTH"),
        );
        let resolved = engine.resolve(&CallContext::new(), &reference).expect("resolve");
        assert_eq!(resolved, reference);
        assert_eq!(store.calls(StoreOperation::Create), 0);
        assert!(audit.records().is_empty());
    }

    #[test]
    fn resolving_twice_gives_the_same_reference() {
        let (engine, store, _) = engine();
        let ctx = CallContext::new();
        store.create(&ctx, &organization("RR8")).expect("seed");
        let reference = Reference::by_identifier(
            None,
            with_identifier("https://fhir.nhs.uk/Id/ods-organization-code", "RR8"),
        );
        let first = engine.resolve(&ctx, &reference).expect("first");
        let second = engine.resolve(&ctx, &reference).expect("second");
        assert!(first.is_canonical());
        assert_eq!(first, second);
    }

    #[test]
    fn canonical_reference_makes_no_store_call() {
        let (engine, store, _) = engine();
        let reference = Reference::from_json(&json!({"reference": "Organization/1"})).expect("ref");
        let resolved = engine.resolve(&CallContext::new(), &reference).expect("resolve");
        assert_eq!(resolved, reference);
        assert_eq!(store.total_calls(), 0);
    }

    #[test]
    fn contained_body_is_promoted_and_stripped() {
        let (engine, store, audit) = engine();
        let mut patient = Entity::from_value(json!({
            "resourceType": "Patient",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}],
            "generalPractitioner": [{"reference": "#gp"}],
            "contained": [{
                "resourceType": "Practitioner",
                "id": "gp",
                "identifier": [{"system": "https://fhir.hl7.org.uk/Id/gmc-number", "value": "C1234567"}]
            }]
        }))
        .expect("valid patient");
        engine
            .resolve_references(&CallContext::new(), &mut patient)
            .expect("resolve");

        let practitioners = store.records(ResourceType::Practitioner);
        assert_eq!(practitioners.len(), 1);
        let rendered = patient.to_value();
        assert!(rendered.get("contained").is_none());
        assert_eq!(
            rendered["generalPractitioner"][0]["reference"],
            format!("Practitioner/{}", practitioners[0].id)
        );
        assert_eq!(audit.records().len(), 1);
        assert_eq!(audit.records()[0].action, AuditAction::Create);
    }

    #[test]
    fn contained_resources_resolve_pointers_to_their_siblings() {
        let (engine, store, _) = engine();
        let mut patient = Entity::from_value(json!({
            "resourceType": "Patient",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}],
            "generalPractitioner": [{"reference": "#role"}],
            "contained": [
                {
                    "resourceType": "PractitionerRole",
                    "id": "role",
                    "identifier": [{"system": "https://fhir.nhs.uk/Id/sds-role-profile-id", "value": "100200300"}],
                    "organization": {"reference": "#org"}
                },
                {
                    "resourceType": "Organization",
                    "id": "org",
                    "identifier": [{"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "RR8"}]
                }
            ]
        }))
        .expect("valid patient");
        engine
            .resolve_references(&CallContext::new(), &mut patient)
            .expect("resolve");

        let organizations = store.records(ResourceType::Organization);
        assert_eq!(organizations.len(), 1);
        let roles = store.records(ResourceType::PractitionerRole);
        assert_eq!(roles.len(), 1);
        assert_eq!(
            roles[0].entity.to_value()["organization"]["reference"],
            format!("Organization/{}", organizations[0].id)
        );
        assert_eq!(
            patient.to_value()["generalPractitioner"][0]["reference"],
            format!("PractitionerRole/{}", roles[0].id)
        );
    }

    #[test]
    fn contained_target_referenced_twice_is_written_once() {
        let (engine, store, audit) = engine();
        let mut patient = Entity::from_value(json!({
            "resourceType": "Patient",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}],
            "generalPractitioner": [{"reference": "#gp"}, {"reference": "#gp"}],
            "contained": [{
                "resourceType": "Practitioner",
                "id": "gp",
                "identifier": [{"system": "https://fhir.hl7.org.uk/Id/gmc-number", "value": "C1234567"}]
            }]
        }))
        .expect("valid patient");
        engine
            .resolve_references(&CallContext::new(), &mut patient)
            .expect("resolve");

        assert_eq!(store.calls(StoreOperation::Create), 1);
        assert_eq!(store.calls(StoreOperation::Update), 0);
        assert_eq!(audit.records().len(), 1);
        let rendered = patient.to_value();
        assert_eq!(
            rendered["generalPractitioner"][0],
            rendered["generalPractitioner"][1]
        );
    }

    #[test]
    fn reference_outside_declared_fields_is_resolved() {
        let (engine, store, _) = engine();
        let mut obs = Entity::from_value(json!({
            "resourceType": "Observation",
            "identifier": [{"system": "https://example.org/obs", "value": "1"}],
            "focus": [{"reference": "#dev"}],
            "contained": [{
                "resourceType": "Device",
                "id": "dev",
                "identifier": [{"system": "https://example.org/device", "value": "D1"}]
            }]
        }))
        .expect("valid observation");
        engine
            .resolve_references(&CallContext::new(), &mut obs)
            .expect("resolve");

        let devices = store.records(ResourceType::Device);
        assert_eq!(devices.len(), 1);
        assert_eq!(
            obs.to_value()["focus"][0]["reference"],
            format!("Device/{}", devices[0].id)
        );
    }

    #[test]
    fn bundle_pointer_cycle_terminates() {
        let (engine, store, _) = engine();
        let bundle = Bundle::from_value(json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                {"fullUrl": "urn:uuid:00000000-0000-0000-0000-00000000000a",
                 "resource": {"resourceType": "Organization",
                   "identifier": [{"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "A"}],
                   "partOf": {"reference": "urn:uuid:00000000-0000-0000-0000-00000000000b"}}},
                {"fullUrl": "urn:uuid:00000000-0000-0000-0000-00000000000b",
                 "resource": {"resourceType": "Organization",
                   "identifier": [{"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "B"}],
                   "partOf": {"reference": "urn:uuid:00000000-0000-0000-0000-00000000000a"}}}
            ]
        }))
        .expect("valid bundle");

        let outcomes = engine
            .process_bundle(&CallContext::new(), &bundle)
            .expect("cycle terminates");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(store.records(ResourceType::Organization).len(), 2);
    }

    #[test]
    fn nesting_beyond_max_depth_fails() {
        let (engine, _, _) = engine();
        let engine = engine.with_max_reference_depth(1);
        let mut patient = Entity::from_value(json!({
            "resourceType": "Patient",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}],
            "managingOrganization": {"resource": {
                "resourceType": "Organization",
                "identifier": [{"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "RR8"}]
            }}
        }))
        .expect("valid patient");
        let err = engine
            .resolve_references(&CallContext::new(), &mut patient)
            .unwrap_err();
        assert!(matches!(err, EngineError::ReferenceDepthExceeded { max: 1 }));
    }

    #[test]
    fn embedded_body_without_identifier_fails_validation() {
        let (engine, store, _) = engine();
        let mut obs = Entity::from_value(json!({
            "resourceType": "Observation",
            "identifier": [{"system": "https://example.org/obs", "value": "1"}],
            "performer": [{"resource": {"resourceType": "Practitioner", "name": [{"family": "Who"}]}}]
        }))
        .expect("valid observation");
        let err = engine
            .resolve_references(&CallContext::new(), &mut obs)
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingIdentifier(ResourceType::Practitioner)));
        assert_eq!(store.calls(StoreOperation::Create), 0);
        assert!(matches!(
            obs.references()[0].reference.target,
            ReferenceTarget::Embedded(_)
        ));
    }
}
