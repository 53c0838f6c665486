//! Entity-type descriptor table.
//!
//! One static [`EntityDescriptor`] per [`ResourceType`] lists the reference fields the engine
//! resolves, in declaration order. Paths are dotted JSON paths relative to the resource root;
//! arrays met along the way are walked element by element, so `participant.individual`
//! addresses the `individual` of every `participant`.
//!
//! An empty `targets` list means the field may point at any resource type.

use crate::ResourceType::{self, *};

/// A reference-valued field of a resource type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceField {
    /// Dotted path from the resource root.
    pub path: &'static str,
    /// Resource types the field may point at (empty: any).
    pub targets: &'static [ResourceType],
    /// Whether the leaf of the path is a list of references.
    pub many: bool,
}

impl ReferenceField {
    const fn one(path: &'static str, targets: &'static [ResourceType]) -> Self {
        Self {
            path,
            targets,
            many: false,
        }
    }

    const fn many(path: &'static str, targets: &'static [ResourceType]) -> Self {
        Self {
            path,
            targets,
            many: true,
        }
    }

    /// True when the path addresses a field directly under the resource root.
    pub fn is_top_level(&self) -> bool {
        !self.path.contains('.')
    }

    /// Returns the only permitted target type, if the field admits exactly one.
    pub fn sole_target(&self) -> Option<ResourceType> {
        match self.targets {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Whether `resource_type` is an acceptable target for this field.
    pub fn accepts(&self, resource_type: ResourceType) -> bool {
        self.targets.is_empty() || self.targets.contains(&resource_type)
    }
}

/// Field of reference objects met outside the declared paths of their type.
pub static UNDECLARED: ReferenceField = ReferenceField {
    path: "*",
    targets: ANY,
    many: false,
};

/// Static description of how the engine treats one resource type.
#[derive(Clone, Copy, Debug)]
pub struct EntityDescriptor {
    pub resource_type: ResourceType,
    /// Reference fields in resolution order.
    pub reference_fields: &'static [ReferenceField],
}

impl EntityDescriptor {
    /// Looks up a declared reference field by path.
    pub fn field(&self, path: &str) -> Option<&'static ReferenceField> {
        self.reference_fields.iter().find(|f| f.path == path)
    }
}

const CLINICIANS: &[ResourceType] = &[Practitioner, PractitionerRole];
const PARTICIPANTS: &[ResourceType] = &[Practitioner, PractitionerRole, RelatedPerson];
const ACTORS: &[ResourceType] = &[
    Practitioner,
    PractitionerRole,
    Organization,
    Patient,
    RelatedPerson,
    Device,
];
const PERFORMERS: &[ResourceType] = &[
    Practitioner,
    PractitionerRole,
    Organization,
    CareTeam,
    Patient,
    RelatedPerson,
];
const RECORDERS: &[ResourceType] = &[Practitioner, PractitionerRole, Patient, RelatedPerson];
const SUBJECTS: &[ResourceType] = &[Patient, Location, Device];
const CONTEXTS: &[ResourceType] = &[Encounter, EpisodeOfCare];
const ANY: &[ResourceType] = &[];

type F = ReferenceField;

const PATIENT: &[F] = &[
    F::many("generalPractitioner", &[Organization, Practitioner, PractitionerRole]),
    F::one("managingOrganization", &[Organization]),
    F::one("link.other", &[Patient, RelatedPerson]),
];
const PRACTITIONER: &[F] = &[F::one("qualification.issuer", &[Organization])];
const PRACTITIONER_ROLE: &[F] = &[
    F::one("practitioner", &[Practitioner]),
    F::one("organization", &[Organization]),
    F::many("location", &[Location]),
];
const ORGANIZATION: &[F] = &[F::one("partOf", &[Organization])];
const LOCATION: &[F] = &[
    F::one("managingOrganization", &[Organization]),
    F::one("partOf", &[Location]),
];
const RELATED_PERSON: &[F] = &[F::one("patient", &[Patient])];
const ENCOUNTER: &[F] = &[
    F::one("subject", &[Patient]),
    F::many("episodeOfCare", &[EpisodeOfCare]),
    F::many("basedOn", &[ServiceRequest]),
    F::one("participant.individual", PARTICIPANTS),
    F::many("appointment", &[Appointment]),
    F::many("reasonReference", &[Condition, Procedure, Observation]),
    F::one("location.location", &[Location]),
    F::one("diagnosis.condition", &[Condition, Procedure]),
    F::one("hospitalization.origin", &[Location, Organization]),
    F::one("hospitalization.destination", &[Location, Organization]),
    F::one("serviceProvider", &[Organization]),
    F::one("partOf", &[Encounter]),
];
const EPISODE_OF_CARE: &[F] = &[
    F::one("patient", &[Patient]),
    F::one("managingOrganization", &[Organization]),
    F::one("careManager", CLINICIANS),
    F::many("team", &[CareTeam]),
    F::one("diagnosis.condition", &[Condition]),
];
const OBSERVATION: &[F] = &[
    F::many("basedOn", &[ServiceRequest, CarePlan, MedicationRequest]),
    F::one("subject", SUBJECTS),
    F::one("encounter", &[Encounter]),
    F::many("performer", PERFORMERS),
    F::one("specimen", &[Specimen]),
    F::one("device", &[Device]),
    F::many("hasMember", &[Observation, QuestionnaireResponse]),
    F::many(
        "derivedFrom",
        &[Observation, DocumentReference, QuestionnaireResponse],
    ),
];
const DIAGNOSTIC_REPORT: &[F] = &[
    F::many("basedOn", &[ServiceRequest, CarePlan]),
    F::one("subject", SUBJECTS),
    F::one("encounter", &[Encounter]),
    F::many("performer", PERFORMERS),
    F::many("resultsInterpreter", PERFORMERS),
    F::many("specimen", &[Specimen]),
    F::many("result", &[Observation]),
];
const SPECIMEN: &[F] = &[
    F::one("subject", SUBJECTS),
    F::many("parent", &[Specimen]),
    F::many("request", &[ServiceRequest]),
    F::one("collection.collector", CLINICIANS),
];
const SERVICE_REQUEST: &[F] = &[
    F::many("basedOn", &[CarePlan, ServiceRequest, MedicationRequest]),
    F::one("subject", SUBJECTS),
    F::one("encounter", &[Encounter]),
    F::one("requester", ACTORS),
    F::many("performer", PERFORMERS),
    F::many(
        "reasonReference",
        &[Condition, Observation, DiagnosticReport, DocumentReference],
    ),
    F::many("specimen", &[Specimen]),
];
const CONDITION: &[F] = &[
    F::one("subject", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one("recorder", RECORDERS),
    F::one("asserter", RECORDERS),
    F::many("evidence.detail", ANY),
];
const ALLERGY_INTOLERANCE: &[F] = &[
    F::one("patient", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one("recorder", RECORDERS),
    F::one("asserter", RECORDERS),
];
const PROCEDURE: &[F] = &[
    F::one("subject", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one("recorder", RECORDERS),
    F::one("asserter", RECORDERS),
    F::one("performer.actor", ACTORS),
    F::one("location", &[Location]),
    F::many(
        "reasonReference",
        &[Condition, Observation, Procedure, DiagnosticReport, DocumentReference],
    ),
    F::many("report", &[DiagnosticReport, DocumentReference]),
];
const MEDICATION: &[F] = &[F::one("manufacturer", &[Organization])];
const MEDICATION_REQUEST: &[F] = &[
    F::one("medicationReference", &[Medication]),
    F::one("subject", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one("requester", ACTORS),
    F::one("performer", PERFORMERS),
    F::one("recorder", CLINICIANS),
    F::many("reasonReference", &[Condition, Observation]),
    F::many("basedOn", &[CarePlan, MedicationRequest, ServiceRequest]),
];
const MEDICATION_STATEMENT: &[F] = &[
    F::many("basedOn", &[MedicationRequest, CarePlan, ServiceRequest]),
    F::one("medicationReference", &[Medication]),
    F::one("subject", &[Patient]),
    F::one("context", CONTEXTS),
    F::one("informationSource", ACTORS),
];
const MEDICATION_DISPENSE: &[F] = &[
    F::one("medicationReference", &[Medication]),
    F::one("subject", &[Patient]),
    F::one("context", CONTEXTS),
    F::one("performer.actor", ACTORS),
    F::one("location", &[Location]),
    F::many("authorizingPrescription", &[MedicationRequest]),
];
const IMMUNIZATION: &[F] = &[
    F::one("patient", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one("location", &[Location]),
    F::one("manufacturer", &[Organization]),
    F::one("performer.actor", &[Practitioner, PractitionerRole, Organization]),
];
const CARE_PLAN: &[F] = &[
    F::many("basedOn", &[CarePlan]),
    F::one("subject", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one("author", ACTORS),
    F::many("careTeam", &[CareTeam]),
    F::many("addresses", &[Condition]),
    F::many("goal", &[Goal]),
];
const CARE_TEAM: &[F] = &[
    F::one("subject", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one(
        "participant.member",
        &[Practitioner, PractitionerRole, RelatedPerson, Patient, Organization, CareTeam],
    ),
    F::many("managingOrganization", &[Organization]),
];
const GOAL: &[F] = &[
    F::one("subject", &[Patient]),
    F::one("expressedBy", RECORDERS),
    F::many(
        "addresses",
        &[Condition, Observation, MedicationStatement, ServiceRequest],
    ),
];
const TASK: &[F] = &[
    F::many("partOf", &[Task]),
    F::one("focus", ANY),
    F::one("for", ANY),
    F::one("encounter", &[Encounter]),
    F::one("requester", ACTORS),
    F::one("owner", PERFORMERS),
];
const COMMUNICATION: &[F] = &[
    F::many("inResponseTo", &[Communication]),
    F::one("subject", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::many("recipient", ACTORS),
    F::one("sender", ACTORS),
];
const COMMUNICATION_REQUEST: &[F] = &[
    F::many("basedOn", ANY),
    F::one("subject", &[Patient]),
    F::one("encounter", &[Encounter]),
    F::one("requester", ACTORS),
    F::many("recipient", ACTORS),
    F::one("sender", ACTORS),
];
const CONSENT: &[F] = &[
    F::one("patient", &[Patient]),
    F::many(
        "performer",
        &[Organization, Patient, Practitioner, RelatedPerson, PractitionerRole],
    ),
    F::many("organization", &[Organization]),
];
const DOCUMENT_REFERENCE: &[F] = &[
    F::one("subject", &[Patient, Practitioner, Device]),
    F::many("author", ACTORS),
    F::one("authenticator", &[Practitioner, PractitionerRole, Organization]),
    F::one("custodian", &[Organization]),
    F::many("context.encounter", CONTEXTS),
    F::one("relatesTo.target", &[DocumentReference]),
];
const BINARY: &[F] = &[F::one("securityContext", ANY)];
const COMPOSITION: &[F] = &[
    F::one("subject", ANY),
    F::one("encounter", &[Encounter]),
    F::many("author", ACTORS),
    F::one(
        "attester.party",
        &[Patient, RelatedPerson, Practitioner, PractitionerRole, Organization],
    ),
    F::one("custodian", &[Organization]),
    F::one("relatesTo.targetReference", &[Composition]),
    F::many("section.author", ACTORS),
    F::one("section.focus", ANY),
    F::many("section.entry", ANY),
    F::many("section.section.entry", ANY),
];
const DEVICE: &[F] = &[
    F::one("patient", &[Patient]),
    F::one("owner", &[Organization]),
    F::one("location", &[Location]),
];
const APPOINTMENT: &[F] = &[
    F::many("basedOn", &[ServiceRequest]),
    F::many("reasonReference", &[Condition, Procedure, Observation]),
    F::one(
        "participant.actor",
        &[Patient, Practitioner, PractitionerRole, RelatedPerson, Device, Location],
    ),
];
const SCHEDULE: &[F] = &[F::many(
    "actor",
    &[Patient, Practitioner, PractitionerRole, RelatedPerson, Device, Location],
)];
const QUESTIONNAIRE_RESPONSE: &[F] = &[
    F::many("basedOn", &[CarePlan, ServiceRequest]),
    F::many("partOf", &[Observation, Procedure]),
    F::one("subject", ANY),
    F::one("encounter", &[Encounter]),
    F::one("author", ACTORS),
    F::one("source", RECORDERS),
];
const MESSAGE_HEADER: &[F] = &[
    F::one("sender", &[Practitioner, PractitionerRole, Organization]),
    F::one("author", CLINICIANS),
    F::many("focus", ANY),
];
const AUDIT_EVENT: &[F] = &[F::one("entity.what", ANY)];

impl ResourceType {
    /// Returns the static descriptor for this resource type.
    pub fn descriptor(self) -> EntityDescriptor {
        let reference_fields = match self {
            AllergyIntolerance => ALLERGY_INTOLERANCE,
            Appointment => APPOINTMENT,
            AuditEvent => AUDIT_EVENT,
            Binary => BINARY,
            CarePlan => CARE_PLAN,
            CareTeam => CARE_TEAM,
            Communication => COMMUNICATION,
            CommunicationRequest => COMMUNICATION_REQUEST,
            Composition => COMPOSITION,
            Condition => CONDITION,
            Consent => CONSENT,
            Device => DEVICE,
            DiagnosticReport => DIAGNOSTIC_REPORT,
            DocumentReference => DOCUMENT_REFERENCE,
            Encounter => ENCOUNTER,
            EpisodeOfCare => EPISODE_OF_CARE,
            Goal => GOAL,
            Immunization => IMMUNIZATION,
            Location => LOCATION,
            Medication => MEDICATION,
            MedicationDispense => MEDICATION_DISPENSE,
            MedicationRequest => MEDICATION_REQUEST,
            MedicationStatement => MEDICATION_STATEMENT,
            MessageHeader => MESSAGE_HEADER,
            Observation => OBSERVATION,
            Organization => ORGANIZATION,
            Patient => PATIENT,
            Practitioner => PRACTITIONER,
            PractitionerRole => PRACTITIONER_ROLE,
            Procedure => PROCEDURE,
            QuestionnaireResponse => QUESTIONNAIRE_RESPONSE,
            RelatedPerson => RELATED_PERSON,
            Schedule => SCHEDULE,
            ServiceRequest => SERVICE_REQUEST,
            Specimen => SPECIMEN,
            Task => TASK,
        };
        EntityDescriptor {
            resource_type: self,
            reference_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_fields_in_declaration_order() {
        let paths: Vec<_> = Patient
            .descriptor()
            .reference_fields
            .iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(
            paths,
            vec!["generalPractitioner", "managingOrganization", "link.other"]
        );
    }

    #[test]
    fn field_lookup_and_targets() {
        let observation = Observation.descriptor();
        let encounter = observation.field("encounter").expect("declared");
        assert_eq!(encounter.sole_target(), Some(Encounter));
        assert!(encounter.is_top_level());

        let performer = observation.field("performer").expect("declared");
        assert!(performer.many);
        assert!(performer.accepts(Organization));
        assert!(!performer.accepts(Medication));
        assert_eq!(performer.sole_target(), None);
    }

    #[test]
    fn any_target_accepts_everything() {
        let task = Task.descriptor();
        let focus = task.field("focus").expect("declared");
        assert!(focus.accepts(Patient));
        assert!(focus.accepts(Observation));
    }

    #[test]
    fn nested_paths_are_declared() {
        assert!(Encounter.descriptor().field("diagnosis.condition").is_some());
        assert!(Condition.descriptor().field("evidence.detail").is_some());
        assert!(Composition.descriptor().field("section.section.entry").is_some());
        assert!(DocumentReference.descriptor().field("relatesTo.target").is_some());
    }

    #[test]
    fn undeclared_field_accepts_any_target() {
        assert!(UNDECLARED.accepts(Patient));
        assert_eq!(UNDECLARED.sole_target(), None);
        assert!(Observation.descriptor().field(UNDECLARED.path).is_none());
    }

    #[test]
    fn no_duplicate_paths_within_a_type() {
        for ty in ResourceType::ALL {
            let fields = ty.descriptor().reference_fields;
            for (i, a) in fields.iter().enumerate() {
                for b in &fields[i + 1..] {
                    assert_ne!(a.path, b.path, "{ty} declares {} twice", a.path);
                }
            }
        }
    }
}
