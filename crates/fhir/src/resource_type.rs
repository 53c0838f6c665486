//! Closed set of resource types the engine knows how to process.

use crate::FhirError;
use std::fmt;
use std::str::FromStr;

macro_rules! resource_types {
    ($($variant:ident),+ $(,)?) => {
        /// FHIR R4 resource types handled by the engine.
        ///
        /// This enum is deliberately *closed*: an inbound resource of any other type is
        /// rejected at parse time rather than written with unknown reference semantics.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ResourceType {
            $($variant),+
        }

        impl ResourceType {
            /// Every supported type, in declaration order.
            pub const ALL: &'static [ResourceType] = &[$(ResourceType::$variant),+];

            /// Returns the FHIR wire name (`"Patient"`, `"Observation"`, ...).
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(ResourceType::$variant => stringify!($variant)),+
                }
            }

            /// Parses a FHIR wire name. Matching is case-sensitive, as on the wire.
            pub fn parse(s: &str) -> Result<Self, FhirError> {
                match s {
                    $(stringify!($variant) => Ok(ResourceType::$variant),)+
                    other => Err(FhirError::UnknownResourceType(other.to_string())),
                }
            }
        }
    };
}

resource_types! {
    AllergyIntolerance,
    Appointment,
    AuditEvent,
    Binary,
    CarePlan,
    CareTeam,
    Communication,
    CommunicationRequest,
    Composition,
    Condition,
    Consent,
    Device,
    DiagnosticReport,
    DocumentReference,
    Encounter,
    EpisodeOfCare,
    Goal,
    Immunization,
    Location,
    Medication,
    MedicationDispense,
    MedicationRequest,
    MedicationStatement,
    MessageHeader,
    Observation,
    Organization,
    Patient,
    Practitioner,
    PractitionerRole,
    Procedure,
    QuestionnaireResponse,
    RelatedPerson,
    Schedule,
    ServiceRequest,
    Specimen,
    Task,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = FhirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::parse(s)
    }
}
