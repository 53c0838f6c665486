//! Well-known identifier systems.
//!
//! A by-identifier reference without an explicit `type` can still be resolved when its
//! identifier system unambiguously names what it identifies.

use crate::ResourceType;

pub const NHS_NUMBER: &str = "https://fhir.nhs.uk/Id/nhs-number";
pub const ODS_ORGANIZATION_CODE: &str = "https://fhir.nhs.uk/Id/ods-organization-code";
pub const ODS_SITE_CODE: &str = "https://fhir.nhs.uk/Id/ods-site-code";
pub const GMC_NUMBER: &str = "https://fhir.hl7.org.uk/Id/gmc-number";
pub const GMP_NUMBER: &str = "https://fhir.hl7.org.uk/Id/gmp-number";
pub const NMC_NUMBER: &str = "https://fhir.hl7.org.uk/Id/nmc-number";
pub const SDS_USER_ID: &str = "https://fhir.nhs.uk/Id/sds-user-id";
pub const SDS_ROLE_PROFILE_ID: &str = "https://fhir.nhs.uk/Id/sds-role-profile-id";

/// System used for the identifier of a generated document bundle.
pub const RFC_4122: &str = "https://tools.ietf.org/html/rfc4122";

const SYSTEM_TYPES: &[(&str, ResourceType)] = &[
    (NHS_NUMBER, ResourceType::Patient),
    (ODS_ORGANIZATION_CODE, ResourceType::Organization),
    (ODS_SITE_CODE, ResourceType::Location),
    (GMC_NUMBER, ResourceType::Practitioner),
    (GMP_NUMBER, ResourceType::Practitioner),
    (NMC_NUMBER, ResourceType::Practitioner),
    (SDS_USER_ID, ResourceType::Practitioner),
    (SDS_ROLE_PROFILE_ID, ResourceType::PractitionerRole),
];

/// Returns the resource type identified by `system`, if the system is well known.
pub fn resource_type_for_system(system: &str) -> Option<ResourceType> {
    SYSTEM_TYPES
        .iter()
        .find(|(known, _)| *known == system)
        .map(|(_, ty)| *ty)
}
