//! Document canonicalizer.
//!
//! Packages a closed working set of entities as a self-contained document whose members
//! address each other by fresh `urn:uuid:` surrogates instead of store ids.
//!
//! Pass 1 assigns surrogates. Every member is keyed by what other members might call it
//! (`Type/id`, `Type?identifier=system|value`, a bundle `fullUrl`, a contained `#id`); a
//! member whose key is already mapped is folded into the existing surrogate, which is how the
//! same practitioner referenced from two places ends up in the document once. Contained and
//! embedded bodies are promoted to members of their own.
//!
//! References held outside the descriptor's fields (extensions, deeper backbone elements) are
//! adopted as slots on admission and go through the same rewrite; an unreadable one is removed.
//!
//! Pass 2 rewrites references through the [`ReferenceMap`]. Fields listed in
//! [`DOCUMENT_SUBJECT_PINS`] are re-pointed at the document subject unconditionally. A
//! reference whose target is not a member is dropped with a warning, so the output never
//! points outside itself.
//!
//! No store is involved; this is a pure in-memory transform.

use crate::{EngineError, EngineResult};
use chrono::{SecondsFormat, Utc};
use fhir::systems::{resource_type_for_system, RFC_4122};
use fhir::{
    Bundle, BundleEntry, BundleType, BusinessIdentifier, Entity, LogicalId, Reference,
    ReferenceField, ReferenceSlot, ReferenceTarget, ResourceType,
};
use std::collections::BTreeMap;
use tie_uuid::SurrogateId;

/// Reference fields that always point at the document subject.
pub const DOCUMENT_SUBJECT_PINS: &[(ResourceType, &str)] = &[
    (ResourceType::Observation, "subject"),
    (ResourceType::Encounter, "subject"),
    (ResourceType::MedicationRequest, "subject"),
    (ResourceType::MedicationStatement, "subject"),
    (ResourceType::Procedure, "subject"),
];

fn canonical_key(resource_type: ResourceType, id: &str) -> String {
    format!("{resource_type}/{id}")
}

fn identifier_key(resource_type: ResourceType, system: &str, value: &str) -> String {
    format!("{resource_type}?identifier={system}|{value}")
}

/// `fragment` includes the leading `#`.
fn local_key(scope: SurrogateId, fragment: &str) -> String {
    format!("{}{fragment}", scope.urn())
}

/// Old identity key to surrogate, for one canonicalization.
///
/// Every assigned surrogate also maps its own `urn:uuid:` form to itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    entries: BTreeMap<String, SurrogateId>,
}

impl ReferenceMap {
    pub fn get(&self, key: &str) -> Option<SurrogateId> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SurrogateId)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// First mapping wins.
    fn alias(&mut self, key: String, surrogate: SurrogateId) {
        self.entries.entry(key).or_insert(surrogate);
    }
}

/// One entity of a canonicalized document.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentMember {
    pub surrogate: SurrogateId,
    pub entity: Entity,
    /// Surrogate that `#id` references are relative to: the container for promoted contained
    /// resources, the member itself otherwise.
    scope: SurrogateId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalDocument {
    pub document_id: SurrogateId,
    pub subject: SurrogateId,
    /// Members in admission order; the subject is first.
    pub members: Vec<DocumentMember>,
    pub reference_map: ReferenceMap,
}

impl CanonicalDocument {
    pub fn member(&self, surrogate: SurrogateId) -> Option<&Entity> {
        self.members
            .iter()
            .find(|m| m.surrogate == surrogate)
            .map(|m| &m.entity)
    }

    pub fn subject_entity(&self) -> Option<&Entity> {
        self.member(self.subject)
    }

    /// Renders the document as a FHIR `document` bundle.
    ///
    /// Compositions lead, then the remaining members in admission order. Each entry's
    /// `fullUrl` is the member's `urn:uuid:` surrogate.
    pub fn to_bundle(&self) -> Bundle {
        let mut bundle = Bundle::new(BundleType::Document);
        bundle.identifier = Some(BusinessIdentifier::from_parts(
            Some(RFC_4122),
            Some(&self.document_id.to_string()),
        ));
        bundle.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

        let (compositions, rest): (Vec<_>, Vec<_>) = self
            .members
            .iter()
            .partition(|m| m.entity.resource_type() == ResourceType::Composition);
        bundle.entries = compositions
            .into_iter()
            .chain(rest)
            .map(|member| BundleEntry {
                full_url: Some(member.surrogate.urn()),
                resource: Some(member.entity.clone()),
                ..BundleEntry::default()
            })
            .collect();
        bundle
    }
}

/// Builds canonical documents.
///
/// The surrogate source is injectable so output can be made deterministic.
pub struct DocumentCanonicalizer<F = fn() -> SurrogateId> {
    next_surrogate: F,
}

impl DocumentCanonicalizer {
    /// Canonicalizer drawing random v4 surrogates.
    pub fn random() -> Self {
        Self {
            next_surrogate: SurrogateId::new,
        }
    }
}

impl<F: FnMut() -> SurrogateId> DocumentCanonicalizer<F> {
    pub fn new(next_surrogate: F) -> Self {
        Self { next_surrogate }
    }

    /// Canonicalizes `working_set` around `subject`.
    ///
    /// The subject may also appear in the working set; it is folded into one member.
    ///
    /// # Errors
    ///
    /// [`EngineError::Fhir`] if a pinned field cannot be set on a member.
    pub fn canonicalize(
        &mut self,
        working_set: Vec<Entity>,
        subject: Entity,
    ) -> EngineResult<CanonicalDocument> {
        let working = working_set.into_iter().map(|e| (e, Vec::new())).collect();
        self.run((subject, Vec::new()), working)
    }

    /// Canonicalizes the resources of `bundle` around the entry addressed by `subject`
    /// (a `fullUrl` or `Type/id`).
    ///
    /// Entry `fullUrl`s become keys of the reference map, so `urn:uuid:` pointers between
    /// entries are rewritten like any other reference. Message headers are left out.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] if `subject` is not in the bundle, and the errors of
    /// [`DocumentCanonicalizer::canonicalize`].
    pub fn canonicalize_bundle(
        &mut self,
        bundle: &Bundle,
        subject: &str,
    ) -> EngineResult<CanonicalDocument> {
        let subject_entity = bundle.find_resource(None, subject).cloned().ok_or_else(|| {
            EngineError::Validation(format!("document subject '{subject}' is not in the bundle"))
        })?;
        let working = bundle
            .entries
            .iter()
            .filter_map(|entry| {
                let resource = entry.resource.clone()?;
                (resource.resource_type() != ResourceType::MessageHeader)
                    .then(|| (resource, entry.full_url.clone().into_iter().collect()))
            })
            .collect();
        self.run((subject_entity, vec![subject.to_owned()]), working)
    }

    fn run(
        &mut self,
        subject: (Entity, Vec<String>),
        working: Vec<(Entity, Vec<String>)>,
    ) -> EngineResult<CanonicalDocument> {
        let subject_type = subject.0.resource_type();
        let mut admission = Admission {
            next_surrogate: &mut self.next_surrogate,
            map: ReferenceMap::default(),
            members: Vec::new(),
        };
        let subject_id = admission.admit(subject.0, subject.1, None)?;
        for (entity, aliases) in working {
            admission.admit(entity, aliases, None)?;
        }
        let Admission {
            map, mut members, ..
        } = admission;

        for member in &mut members {
            rewrite(member, &map, subject_id, subject_type)?;
        }

        let document_id = (self.next_surrogate)();
        tracing::info!(
            members = members.len(),
            %subject_type,
            "canonicalized document"
        );
        Ok(CanonicalDocument {
            document_id,
            subject: subject_id,
            members,
            reference_map: map,
        })
    }
}

// ============================================================================
// PASS 1: SURROGATE ASSIGNMENT
// ============================================================================

struct Admission<'a, F> {
    next_surrogate: &'a mut F,
    map: ReferenceMap,
    members: Vec<DocumentMember>,
}

impl<F: FnMut() -> SurrogateId> Admission<'_, F> {
    /// Admits `entity` under `aliases` plus its own identity keys; returns its surrogate.
    ///
    /// `container` is set for promoted contained resources, whose ids are local to it.
    fn admit(
        &mut self,
        mut entity: Entity,
        aliases: Vec<String>,
        container: Option<SurrogateId>,
    ) -> EngineResult<SurrogateId> {
        let resource_type = entity.resource_type();
        let mut keys = aliases;
        if container.is_none() {
            if let Some(id) = entity.id() {
                keys.push(canonical_key(resource_type, id.as_str()));
            }
        }
        keys.extend(
            entity
                .complete_identifiers()
                .filter_map(|i| i.key())
                .map(|(system, value)| identifier_key(resource_type, system, value)),
        );

        if let Some(existing) = keys.iter().find_map(|k| self.map.get(k)) {
            tracing::debug!(%resource_type, surrogate = %existing, "entity already in document");
            for key in keys {
                self.map.alias(key, existing);
            }
            return Ok(existing);
        }

        let surrogate = (self.next_surrogate)();
        self.map.alias(surrogate.urn(), surrogate);
        self.map.alias(local_key(surrogate, "#"), surrogate);
        for key in keys {
            self.map.alias(key, surrogate);
        }

        for pointer in entity.adopt_undeclared_references() {
            tracing::warn!(%resource_type, %pointer, "unreadable reference; dropping it");
            entity.remove_at(&pointer);
        }
        let contained = entity.take_contained();
        let embedded: Vec<(usize, Entity)> = entity
            .references()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.reference.target {
                ReferenceTarget::Embedded(body) => Some((index, (**body).clone())),
                _ => None,
            })
            .collect();
        let id = LogicalId::new(surrogate.to_string())
            .map_err(|e| EngineError::Validation(format!("surrogate id: {e}")))?;
        entity.set_id(Some(id));

        let position = self.members.len();
        self.members.push(DocumentMember {
            surrogate,
            entity,
            scope: container.unwrap_or(surrogate),
        });

        for child in contained {
            let aliases = child
                .id()
                .map(|id| local_key(surrogate, &format!("#{id}")))
                .into_iter()
                .collect();
            self.admit(child, aliases, Some(surrogate))?;
        }
        for (slot, body) in embedded {
            let target = self.admit(body, Vec::new(), None)?;
            self.members[position].entity.references_mut()[slot]
                .reference
                .point_to(target.urn());
        }
        Ok(surrogate)
    }
}

// ============================================================================
// PASS 2: REFERENCE REWRITE
// ============================================================================

fn rewrite(
    member: &mut DocumentMember,
    map: &ReferenceMap,
    subject: SurrogateId,
    subject_type: ResourceType,
) -> EngineResult<()> {
    let resource_type = member.entity.resource_type();
    if member.surrogate != subject {
        if let Some((_, path)) = DOCUMENT_SUBJECT_PINS
            .iter()
            .find(|(pinned, _)| *pinned == resource_type)
        {
            let mut pinned = Reference::local(subject.urn());
            pinned.type_hint = Some(subject_type);
            member.entity.set_reference(path, pinned)?;
        }
    }

    let scope = member.scope;
    let mut dangling = Vec::new();
    for (index, slot) in member.entity.references_mut().iter_mut().enumerate() {
        if matches!(slot.reference.target, ReferenceTarget::Opaque) {
            continue;
        }
        match target_surrogate(map, scope, slot) {
            Some(target) => slot.reference.point_to(target.urn()),
            None => dangling.push(index),
        }
    }
    for index in dangling.into_iter().rev() {
        if let Some(slot) = member.entity.drop_reference(index) {
            tracing::warn!(
                %resource_type,
                field = slot.field.path,
                pointer = %slot.pointer,
                "reference target is not part of the document; dropping it"
            );
        }
    }
    Ok(())
}

fn target_surrogate(
    map: &ReferenceMap,
    scope: SurrogateId,
    slot: &ReferenceSlot,
) -> Option<SurrogateId> {
    let reference = &slot.reference;
    match &reference.target {
        ReferenceTarget::Canonical(target) => {
            map.get(&canonical_key(target.resource_type, target.id.as_str()))
        }
        ReferenceTarget::Local(pointer) if pointer.starts_with('#') => {
            map.get(&local_key(scope, pointer))
        }
        ReferenceTarget::Local(pointer) => map.get(pointer),
        ReferenceTarget::ByIdentifier => {
            let (system, value) = reference.identifier.as_ref()?.key()?;
            candidate_types(reference, slot.field, system)
                .iter()
                .find_map(|ty| map.get(&identifier_key(*ty, system, value)))
        }
        ReferenceTarget::Embedded(_) | ReferenceTarget::Opaque => None,
    }
}

fn candidate_types(
    reference: &Reference,
    field: &ReferenceField,
    system: &str,
) -> Vec<ResourceType> {
    match reference.type_hint.or_else(|| resource_type_for_system(system)) {
        Some(ty) => vec![ty],
        None if field.targets.is_empty() => ResourceType::ALL.to_vec(),
        None => field.targets.to_vec(),
    }
}
