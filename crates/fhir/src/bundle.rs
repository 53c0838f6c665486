//! Bundles: message, transaction and document packages.

use crate::{
    reference::CanonicalRef, schema_mismatch, BusinessIdentifier, Entity, FhirError, FhirResult,
    LogicalId, ResourceType,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Document,
    Message,
    Transaction,
    TransactionResponse,
    Batch,
    BatchResponse,
    History,
    Searchset,
    Collection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BundleRequest {
    pub method: HttpVerb,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
}

impl BundleRequest {
    pub fn new(method: HttpVerb, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            if_none_exist: None,
            if_match: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BundleResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
}

impl BundleResponse {
    /// Parses `location` as a canonical reference (`Type/id/_history/v`).
    pub fn location_ref(&self) -> Option<CanonicalRef> {
        self.location
            .as_deref()
            .and_then(|l| CanonicalRef::parse(l).ok())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BundleEntry {
    pub full_url: Option<String>,
    pub resource: Option<Entity>,
    pub request: Option<BundleRequest>,
    pub response: Option<BundleResponse>,
}

impl BundleEntry {
    pub fn new(resource: Entity) -> Self {
        Self {
            resource: Some(resource),
            ..Self::default()
        }
    }

    /// Whether this entry is addressed by `reference` (its `fullUrl`, or `Type/id` of its
    /// resource, optionally behind a server base).
    pub fn matches(&self, reference: &str) -> bool {
        if self.full_url.as_deref() == Some(reference) {
            return true;
        }
        let Some(resource) = &self.resource else {
            return false;
        };
        let Some(id) = resource.id() else {
            return false;
        };
        match CanonicalRef::parse(reference) {
            Ok(c) => c.resource_type == resource.resource_type() && &c.id == id,
            Err(_) => false,
        }
    }
}

/// A FHIR Bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    pub bundle_type: BundleType,
    pub id: Option<LogicalId>,
    pub identifier: Option<BusinessIdentifier>,
    pub timestamp: Option<String>,
    pub entries: Vec<BundleEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct BundleWire {
    resource_type: String,
    #[serde(default)]
    id: Option<LogicalId>,
    #[serde(default, rename = "meta")]
    _meta: Option<Value>,
    #[serde(default)]
    identifier: Option<BusinessIdentifier>,
    #[serde(rename = "type")]
    bundle_type: BundleType,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, rename = "total")]
    _total: Option<u64>,
    #[serde(default, rename = "link")]
    _link: Option<Value>,
    #[serde(default)]
    entry: Vec<EntryWire>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct EntryWire {
    #[serde(default)]
    full_url: Option<String>,
    #[serde(default)]
    resource: Option<Value>,
    #[serde(default)]
    request: Option<BundleRequest>,
    #[serde(default)]
    response: Option<BundleResponse>,
    #[serde(default, rename = "search")]
    _search: Option<Value>,
    #[serde(default, rename = "link")]
    _link: Option<Value>,
}

impl Bundle {
    pub fn new(bundle_type: BundleType) -> Self {
        Self {
            bundle_type,
            id: None,
            identifier: None,
            timestamp: None,
            entries: Vec::new(),
        }
    }

    /// Parses a bundle from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidJson`] for malformed JSON and the errors of
    /// [`Bundle::from_value`] otherwise.
    pub fn parse_json(input: &str) -> FhirResult<Self> {
        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    /// Parses a bundle from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidYaml`] for malformed YAML and the errors of
    /// [`Bundle::from_value`] otherwise.
    pub fn parse_yaml(input: &str) -> FhirResult<Self> {
        let value: Value = serde_yaml::from_str(input)?;
        Self::from_value(value)
    }

    /// Builds a bundle from a JSON value; entry resources are parsed as [`Entity`].
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] on a schema mismatch (the message names the failing
    /// path or entry index) and [`FhirError::InvalidInput`] if `resourceType` is not `Bundle`.
    pub fn from_value(value: Value) -> FhirResult<Self> {
        let wire: BundleWire =
            serde_path_to_error::deserialize(value).map_err(|e| schema_mismatch("Bundle", e))?;
        if wire.resource_type != "Bundle" {
            return Err(FhirError::InvalidInput(format!(
                "expected resourceType Bundle, got {}",
                wire.resource_type
            )));
        }

        let mut entries = Vec::with_capacity(wire.entry.len());
        for (index, entry) in wire.entry.into_iter().enumerate() {
            let resource = entry
                .resource
                .map(Entity::from_value)
                .transpose()
                .map_err(|e| FhirError::Translation(format!("Bundle.entry[{index}]: {e}")))?;
            entries.push(BundleEntry {
                full_url: entry.full_url,
                resource,
                request: entry.request,
                response: entry.response,
            });
        }

        Ok(Self {
            bundle_type: wire.bundle_type,
            id: wire.id,
            identifier: wire.identifier,
            timestamp: wire.timestamp,
            entries,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("resourceType".into(), Value::String("Bundle".into()));
        if let Some(id) = &self.id {
            out.insert("id".into(), Value::String(id.as_str().into()));
        }
        if let Some(identifier) = &self.identifier {
            out.insert("identifier".into(), identifier.to_json());
        }
        out.insert("type".into(), to_json_value(&self.bundle_type));
        if let Some(timestamp) = &self.timestamp {
            out.insert("timestamp".into(), Value::String(timestamp.clone()));
        }
        if !self.entries.is_empty() {
            let entries = self
                .entries
                .iter()
                .map(|entry| {
                    let mut e = Map::new();
                    if let Some(url) = &entry.full_url {
                        e.insert("fullUrl".into(), Value::String(url.clone()));
                    }
                    if let Some(resource) = &entry.resource {
                        e.insert("resource".into(), resource.to_value());
                    }
                    if let Some(request) = &entry.request {
                        e.insert("request".into(), to_json_value(request));
                    }
                    if let Some(response) = &entry.response {
                        e.insert("response".into(), to_json_value(response));
                    }
                    Value::Object(e)
                })
                .collect();
            out.insert("entry".into(), Value::Array(entries));
        }
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

    /// Finds the entry resource addressed by `reference`.
    ///
    /// Matches on `fullUrl`, on `Type/id` of the entry resource, or on the local id of a
    /// resource contained in any entry (`#id`). With `resource_type` set, only resources of
    /// that type match.
    pub fn find_resource(
        &self,
        resource_type: Option<ResourceType>,
        reference: &str,
    ) -> Option<&Entity> {
        let type_ok = |e: &Entity| resource_type.map_or(true, |t| t == e.resource_type());
        if reference.starts_with('#') {
            return self
                .entries
                .iter()
                .filter_map(|entry| entry.resource.as_ref())
                .filter_map(|r| r.find_contained(reference))
                .find(|e| type_ok(e));
        }
        self.entries
            .iter()
            .filter(|entry| entry.matches(reference))
            .filter_map(|entry| entry.resource.as_ref())
            .find(|e| type_ok(e))
    }

    /// Iterates entry resources of the given type, in entry order.
    pub fn filter_resources(&self, resource_type: ResourceType) -> impl Iterator<Item = &Entity> {
        self.entries
            .iter()
            .filter_map(|entry| entry.resource.as_ref())
            .filter(move |r| r.resource_type() == resource_type)
    }
}

fn to_json_value<T: Serialize>(value: &T) -> Value {
    // Plain derive types with string keys only; serialisation cannot fail.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> Bundle {
        Bundle::from_value(json!({
            "resourceType": "Bundle",
            "type": "message",
            "meta": {"lastUpdated": "2024-01-01T00:00:00Z"},
            "entry": [
                {"fullUrl": "urn:uuid:11111111-1111-1111-1111-111111111111",
                 "resource": {"resourceType": "MessageHeader", "eventCoding": {"code": "x"}}},
                {"fullUrl": "urn:uuid:22222222-2222-2222-2222-222222222222",
                 "resource": {"resourceType": "Patient", "id": "p1",
                   "contained": [{"resourceType": "Organization", "id": "o1"}]}},
                {"fullUrl": "https://store.example/fhir/Observation/obs1",
                 "resource": {"resourceType": "Observation", "id": "obs1", "status": "final"}}
            ]
        }))
        .expect("valid bundle")
    }

    #[test]
    fn find_resource_by_full_url_literal_and_contained() {
        let bundle = message();
        let by_url = bundle
            .find_resource(None, "urn:uuid:22222222-2222-2222-2222-222222222222")
            .expect("by fullUrl");
        assert_eq!(by_url.resource_type(), ResourceType::Patient);

        let by_literal = bundle
            .find_resource(Some(ResourceType::Observation), "Observation/obs1")
            .expect("by Type/id");
        assert_eq!(by_literal.id().map(LogicalId::as_str), Some("obs1"));

        let contained = bundle.find_resource(None, "#o1").expect("contained");
        assert_eq!(contained.resource_type(), ResourceType::Organization);

        assert!(bundle
            .find_resource(Some(ResourceType::Patient), "Observation/obs1")
            .is_none());
    }

    #[test]
    fn filter_resources_by_type() {
        let bundle = message();
        assert_eq!(bundle.filter_resources(ResourceType::Patient).count(), 1);
        assert_eq!(bundle.filter_resources(ResourceType::Encounter).count(), 0);
    }

    #[test]
    fn requests_render_with_wire_names() {
        let mut bundle = Bundle::new(BundleType::Transaction);
        let mut entry = BundleEntry::new(Entity::new(ResourceType::Patient));
        entry.request = Some(BundleRequest::new(HttpVerb::Put, "Patient/p1"));
        bundle.entries.push(entry);
        let rendered = bundle.to_value();
        assert_eq!(rendered["type"], "transaction");
        assert_eq!(rendered["entry"][0]["request"]["method"], "PUT");
        assert_eq!(rendered["entry"][0]["request"]["url"], "Patient/p1");
    }

    #[test]
    fn wrong_resource_type_and_bad_entries_are_rejected() {
        let not_bundle = Bundle::from_value(json!({"resourceType": "Patient", "type": "message"}));
        assert!(matches!(not_bundle, Err(FhirError::InvalidInput(_))));

        let bad_entry = Bundle::from_value(json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [{"resource": {"resourceType": "Widget"}}]
        }))
        .unwrap_err();
        assert!(bad_entry.to_string().contains("Bundle.entry[0]"));
    }

    #[test]
    fn response_location_parses() {
        let response = BundleResponse {
            status: "201 Created".into(),
            location: Some("Patient/abc/_history/1".into()),
            etag: None,
            last_modified: None,
            outcome: None,
        };
        let location = response.location_ref().expect("location");
        assert_eq!(location.id.as_str(), "abc");
        assert_eq!(location.version.as_deref(), Some("1"));
    }
}
