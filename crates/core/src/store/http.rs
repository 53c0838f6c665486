//! FHIR REST client for a remote canonical store.
//!
//! Creates and updates ask for the stored representation. A server that answers with an empty
//! body is followed up with a read of the `Location` it returned, or of `Type/id` for updates.

use super::{CanonicalRecord, StoreClient, StoreError, StoreResult};
use crate::constants::FHIR_JSON;
use crate::retry::CallContext;
use fhir::reference::CanonicalRef;
use fhir::{Bundle, Entity, LogicalId, ResourceType};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// A successful response: its JSON body (`Null` when empty) and any `Location` header.
struct Reply {
    body: Value,
    location: Option<String>,
}

/// Blocking FHIR REST client.
pub struct HttpStore {
    client: Client,
    base: Url,
    request_timeout: Duration,
}

impl HttpStore {
    /// Builds a client for the server at `base` (e.g. `https://store.example/fhir/`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Permanent`] if the HTTP client cannot be constructed.
    pub fn new(base: Url, request_timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: with_trailing_slash(base),
            request_timeout,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> StoreResult<Url> {
        self.base
            .join(path)
            .map_err(|e| StoreError::permanent(format!("invalid store url for '{path}': {e}")))
    }

    /// Sends a request, bounding its timeout by the context deadline.
    fn send(
        &self,
        ctx: &CallContext,
        request: RequestBuilder,
        not_found: Option<(ResourceType, &LogicalId)>,
    ) -> StoreResult<Reply> {
        ctx.check()?;
        let timeout = ctx
            .remaining()
            .map_or(self.request_timeout, |left| left.min(self.request_timeout));
        let response = request
            .header(ACCEPT, FHIR_JSON)
            .timeout(timeout)
            .send()
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().map_err(|e| classify_transport(&e))?;
        if status.is_success() {
            let body = if body.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&body).map_err(|e| {
                    StoreError::permanent(format!("store returned malformed JSON: {e}"))
                })?
            };
            return Ok(Reply { body, location });
        }
        if status == StatusCode::NOT_FOUND {
            if let Some((resource_type, id)) = not_found {
                return Err(StoreError::NotFound {
                    resource_type,
                    id: id.to_string(),
                });
            }
        }
        Err(classify_status(status.as_u16(), &body))
    }

    fn record(value: Value) -> StoreResult<CanonicalRecord> {
        let entity = Entity::from_value(value)
            .map_err(|e| StoreError::permanent(format!("store returned an invalid resource: {e}")))?;
        CanonicalRecord::from_entity(entity)
    }

    /// The record a create or update produced.
    ///
    /// `written` names the record to read back when the server sent neither a body nor a
    /// `Location`.
    fn written(
        &self,
        ctx: &CallContext,
        reply: Reply,
        written: Option<(ResourceType, &LogicalId)>,
    ) -> StoreResult<CanonicalRecord> {
        if !reply.body.is_null() {
            return Self::record(reply.body);
        }
        if let Some(location) = &reply.location {
            let (resource_type, id) = location_target(location)?;
            tracing::debug!(%resource_type, %id, "empty write response; reading Location");
            return self.read(ctx, resource_type, &id);
        }
        match written {
            Some((resource_type, id)) => self.read(ctx, resource_type, id),
            None => Err(StoreError::permanent(
                "store returned neither a body nor a Location for the write",
            )),
        }
    }

    fn body(entity: &Entity) -> StoreResult<String> {
        entity
            .render_json()
            .map_err(|e| StoreError::permanent(e.to_string()))
    }
}

impl StoreClient for HttpStore {
    fn search_by_identifier(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        system: &str,
        value: &str,
    ) -> StoreResult<Vec<CanonicalRecord>> {
        let mut url = self.url(resource_type.as_str())?;
        url.query_pairs_mut()
            .append_pair("identifier", &format!("{system}|{value}"));
        let reply = self.send(ctx, self.client.get(url), None)?;
        let bundle = Bundle::from_value(reply.body)
            .map_err(|e| StoreError::permanent(format!("invalid search response: {e}")))?;
        bundle
            .filter_resources(resource_type)
            .cloned()
            .map(CanonicalRecord::from_entity)
            .collect()
    }

    fn read(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord> {
        let url = self.url(&format!("{resource_type}/{id}"))?;
        let reply = self.send(ctx, self.client.get(url), Some((resource_type, id)))?;
        Self::record(reply.body)
    }

    fn create(&self, ctx: &CallContext, entity: &Entity) -> StoreResult<CanonicalRecord> {
        let url = self.url(entity.resource_type().as_str())?;
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, FHIR_JSON)
            .header("Prefer", "return=representation")
            .body(Self::body(entity)?);
        let reply = self.send(ctx, request, None)?;
        self.written(ctx, reply, None)
    }

    fn update(
        &self,
        ctx: &CallContext,
        entity: &Entity,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord> {
        // FHIR update requires the body id to match the URL id.
        let mut body = entity.clone();
        body.set_id(Some(id.clone()));
        let url = self.url(&format!("{}/{id}", entity.resource_type()))?;
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, FHIR_JSON)
            .header("Prefer", "return=representation")
            .body(Self::body(&body)?);
        let reply = self.send(ctx, request, None)?;
        self.written(ctx, reply, Some((entity.resource_type(), id)))
    }

    fn delete(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<()> {
        let url = self.url(&format!("{resource_type}/{id}"))?;
        self.send(ctx, self.client.delete(url), Some((resource_type, id)))?;
        Ok(())
    }

    fn transaction(&self, ctx: &CallContext, bundle: &Bundle) -> StoreResult<Bundle> {
        let body = bundle
            .render_json()
            .map_err(|e| StoreError::permanent(e.to_string()))?;
        let request = self
            .client
            .post(self.base.clone())
            .header(CONTENT_TYPE, FHIR_JSON)
            .body(body);
        let reply = self.send(ctx, request, None)?;
        Bundle::from_value(reply.body)
            .map_err(|e| StoreError::permanent(format!("invalid transaction response: {e}")))
    }
}

/// The record a `Location` header points at; any `_history` suffix is ignored.
fn location_target(location: &str) -> StoreResult<(ResourceType, LogicalId)> {
    let target = CanonicalRef::parse(location).map_err(|e| {
        StoreError::permanent(format!("store returned an unusable Location: {e}"))
    })?;
    Ok((target.resource_type, target.id))
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// Classifies a non-success HTTP status.
///
/// 408, 429 and 5xx are transient. Everything else is permanent, with the diagnostics of the
/// first `OperationOutcome` issue when the body carries one.
pub(crate) fn classify_status(status: u16, body: &str) -> StoreError {
    let diagnostics = outcome_diagnostics(body).unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            format!("HTTP {status}")
        } else {
            trimmed.chars().take(200).collect()
        }
    });
    match status {
        408 | 429 | 500..=599 => StoreError::Transient(format!("HTTP {status}: {diagnostics}")),
        _ => StoreError::Permanent {
            status: Some(status),
            diagnostics,
        },
    }
}

fn outcome_diagnostics(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    if value.get("resourceType")?.as_str()? != "OperationOutcome" {
        return None;
    }
    let issue = value.get("issue")?.as_array()?.first()?;
    issue
        .get("diagnostics")
        .or_else(|| issue.get("details").and_then(|d| d.get("text")))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn classify_transport(err: &reqwest::Error) -> StoreError {
    if err.is_timeout() || err.is_connect() {
        StoreError::Transient(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), "")
    } else {
        StoreError::permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    /// Reads one request from `stream` and returns its head.
    fn read_request(stream: &TcpStream) -> String {
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut head = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).expect("read request line");
            if line.is_empty() || line == "\r\n" {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().expect("content length");
            }
            head.push_str(&line);
        }
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).expect("read request body");
        head
    }

    /// Answers one connection per canned response, in order; yields the request heads.
    fn serve(listener: TcpListener, responses: Vec<String>) -> JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                requests.push(read_request(&stream));
                stream.write_all(response.as_bytes()).expect("respond");
            }
            requests
        })
    }

    #[test]
    fn empty_create_response_is_read_back_from_location() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}/fhir/", listener.local_addr().expect("addr"));
        let stored = json!({
            "resourceType": "Patient",
            "id": "abc",
            "meta": {"versionId": "1"},
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}]
        })
        .to_string();
        let server = serve(
            listener,
            vec![
                format!(
                    "HTTP/1.1 201 Created\r\nLocation: {base}Patient/abc/_history/1\r\n\
                     Content-Length: 0\r\nConnection: close\r\n\r\n"
                ),
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/fhir+json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{stored}",
                    stored.len()
                ),
            ],
        );

        let store = HttpStore::new(Url::parse(&base).expect("url"), Duration::from_secs(5))
            .expect("client");
        let patient = Entity::from_value(json!({
            "resourceType": "Patient",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}]
        }))
        .expect("valid patient");
        let record = store.create(&CallContext::new(), &patient).expect("create");
        assert_eq!(record.id.as_str(), "abc");
        assert_eq!(record.version.as_deref(), Some("1"));

        let requests = server.join().expect("server thread");
        assert!(requests[0].starts_with("POST /fhir/Patient "), "{}", requests[0]);
        assert!(requests[1].starts_with("GET /fhir/Patient/abc "), "{}", requests[1]);
    }

    #[test]
    fn location_target_accepts_absolute_and_versioned_urls() {
        let (resource_type, id) =
            location_target("https://store.example/fhir/Organization/o1/_history/3")
                .expect("location");
        assert_eq!(resource_type, ResourceType::Organization);
        assert_eq!(id.as_str(), "o1");
        assert!(location_target("not-a-location").is_err());
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(
                classify_status(status, "").is_transient(),
                "{status} should be transient"
            );
        }
    }

    #[test]
    fn client_errors_are_permanent_with_outcome_diagnostics() {
        let body = r#"{
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "invalid", "diagnostics": "Patient.birthDate: invalid date"}]
        }"#;
        match classify_status(422, body) {
            StoreError::Permanent {
                status,
                diagnostics,
            } => {
                assert_eq!(status, Some(422));
                assert_eq!(diagnostics, "Patient.birthDate: invalid date");
            }
            other => panic!("expected Permanent, got {other:?}"),
        }
    }

    #[test]
    fn plain_bodies_are_kept_as_diagnostics() {
        match classify_status(400, "bad request") {
            StoreError::Permanent { diagnostics, .. } => assert_eq!(diagnostics, "bad request"),
            other => panic!("expected Permanent, got {other:?}"),
        }
        match classify_status(409, "") {
            StoreError::Permanent { diagnostics, .. } => assert_eq!(diagnostics, "HTTP 409"),
            other => panic!("expected Permanent, got {other:?}"),
        }
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let store = HttpStore::new(
            Url::parse("https://store.example/fhir").expect("url"),
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(store.base().as_str(), "https://store.example/fhir/");
        assert_eq!(
            store.url("Patient/1").expect("join").as_str(),
            "https://store.example/fhir/Patient/1"
        );
    }

    #[test]
    fn cancelled_context_never_reaches_the_network() {
        let store = HttpStore::new(
            Url::parse("http://127.0.0.1:9/fhir/").expect("url"),
            Duration::from_secs(1),
        )
        .expect("client");
        let ctx = CallContext::new();
        ctx.cancel_handle().cancel();
        let err = store
            .read(&ctx, ResourceType::Patient, &LogicalId::new("1").expect("id"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}
