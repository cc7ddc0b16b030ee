//! In-process stand-in for the token endpoint and the JSON API.
//!
//! Serves just enough of the object, upload, ACL and rewrite resources for
//! provider tests, and records what the provider sent so tests can assert
//! on requests as well as on results.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use url::form_urlencoded;

use stowage_common::SecretString;

use super::auth::tests::{TEST_EMAIL, TEST_KEY};
use super::provider::{GcsOptions, GcsProvider, PublicAclMode};

pub(crate) const STUB_BUCKET: &str = "stub-bucket";
const ACCESS_TOKEN: &str = "stub-token";

#[derive(Debug, Clone, Default)]
pub(crate) struct StubObject {
    pub data: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub public: bool,
}

#[derive(Debug, Default)]
pub(crate) struct StubState {
    pub objects: BTreeMap<String, StubObject>,
    /// Status returned for every ACL insert, if set.
    pub acl_failure: Option<u16>,
    /// Incomplete responses a rewrite returns before finishing.
    pub rewrite_steps: usize,
    /// `rewriteToken` of every rewrite call, in order.
    pub rewrite_tokens: Vec<Option<String>>,
    /// `destinationPredefinedAcl` of every rewrite call, in order.
    pub rewrite_acls: Vec<Option<String>>,
    /// `predefinedAcl` of every upload, in order.
    pub upload_acls: Vec<Option<String>>,
    /// Bodies of every metadata patch, in order.
    pub patches: Vec<Value>,
    pub token_requests: usize,
}

pub(crate) struct StubServer {
    base: String,
    state: Arc<Mutex<StubState>>,
}

impl StubServer {
    pub(crate) async fn start() -> Self {
        let state = Arc::new(Mutex::new(StubState::default()));
        let app = Router::new().fallback(handle).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, state }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn options(&self, mode: PublicAclMode) -> GcsOptions {
        let mut options = GcsOptions::new(
            Some(TEST_EMAIL.to_string()),
            Some(SecretString::new(TEST_KEY)),
            STUB_BUCKET,
        )
        .with_public_acl_mode(mode);
        options.api_endpoint = format!("{}/storage/v1", self.base);
        options.upload_endpoint = format!("{}/upload/storage/v1", self.base);
        options.token_endpoint = format!("{}/token", self.base);
        options
    }

    pub(crate) fn provider(&self, mode: PublicAclMode) -> GcsProvider {
        GcsProvider::new(self.options(mode))
    }
}

type Shared = Arc<Mutex<StubState>>;

async fn handle(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query: HashMap<String, String> =
        form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
            .into_owned()
            .collect();
    let segments: Vec<String> = uri
        .path()
        .split('/')
        .skip(1)
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let mut state = state.lock().unwrap();

    if method == Method::POST && segments == ["token"] {
        state.token_requests += 1;
        let form = String::from_utf8_lossy(&body);
        if !form.contains("assertion=") {
            return StatusCode::BAD_REQUEST.into_response();
        }
        return Json(json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 })).into_response();
    }

    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(format!("Bearer {}", ACCESS_TOKEN).as_str());
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match (method.as_str(), segments.as_slice()) {
        ("POST", ["upload", "storage", "v1", "b", _, "o"]) => {
            upload(&mut state, &headers, &query, &body)
        }
        ("GET", ["storage", "v1", "b", _, "o"]) => list(&state, &query),
        ("GET", ["storage", "v1", "b", _, "o", name]) => match state.objects.get(*name) {
            Some(object) if query.get("alt").map(String::as_str) == Some("media") => {
                object.data.clone().into_response()
            }
            Some(object) => Json(object_json(name, object)).into_response(),
            None => not_found(),
        },
        ("DELETE", ["storage", "v1", "b", _, "o", name]) => match state.objects.remove(*name) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => not_found(),
        },
        ("PATCH", ["storage", "v1", "b", _, "o", name]) => patch(&mut state, name, &body),
        ("POST", ["storage", "v1", "b", _, "o", name, "acl"]) => insert_acl(&mut state, name),
        ("DELETE", ["storage", "v1", "b", _, "o", name, "acl", "allUsers"]) => {
            match state.objects.get_mut(*name) {
                Some(object) if object.public => {
                    object.public = false;
                    StatusCode::NO_CONTENT.into_response()
                }
                _ => not_found(),
            }
        }
        ("POST", ["storage", "v1", "b", _, "o", source, "rewriteTo", "b", _, "o", dest]) => {
            rewrite(&mut state, source, dest, &query)
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "No such object").into_response()
}

fn object_json(name: &str, object: &StubObject) -> Value {
    let mut acl = vec![json!({ "entity": "project-owners-1", "role": "OWNER" })];
    if object.public {
        acl.push(json!({ "entity": "allUsers", "role": "READER" }));
    }
    json!({
        "name": name,
        "size": object.data.len().to_string(),
        "contentType": object.content_type,
        "etag": format!("etag-{}", object.data.len()),
        "metadata": object.metadata,
        "acl": acl,
    })
}

fn list(state: &StubState, query: &HashMap<String, String>) -> Response {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let items: Vec<Value> = state
        .objects
        .iter()
        .filter(|(name, _)| name.starts_with(&prefix))
        .map(|(name, object)| object_json(name, object))
        .collect();
    Json(json!({ "items": items })).into_response()
}

fn upload(
    state: &mut StubState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Response {
    let boundary = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once("boundary="))
        .map(|(_, boundary)| boundary.to_string());
    let Some((metadata, data)) = boundary.and_then(|b| split_multipart(body, &b)) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(metadata) = serde_json::from_slice::<Value>(metadata) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(name) = metadata["name"].as_str() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let acl = query.get("predefinedAcl").cloned();
    let object = StubObject {
        data: data.to_vec(),
        content_type: metadata["contentType"].as_str().unwrap_or_default().to_string(),
        metadata: serde_json::from_value(metadata["metadata"].clone()).unwrap_or_default(),
        public: acl.as_deref() == Some("publicRead"),
    };
    state.upload_acls.push(acl);

    let response = object_json(name, &object);
    state.objects.insert(name.to_string(), object);
    Json(response).into_response()
}

/// Split a two-part `multipart/related` body into metadata and media.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Option<(&'a [u8], &'a [u8])> {
    let separator = format!("\r\n--{}\r\n", boundary);
    let closing = format!("\r\n--{}--", boundary);

    let metadata_start = find(body, b"\r\n\r\n")? + 4;
    let metadata_len = find(&body[metadata_start..], separator.as_bytes())?;
    let metadata = &body[metadata_start..metadata_start + metadata_len];

    let part = &body[metadata_start + metadata_len + separator.len()..];
    let data_start = find(part, b"\r\n\r\n")? + 4;
    if !part.ends_with(closing.as_bytes()) {
        return None;
    }
    let data = part.get(data_start..part.len() - closing.len())?;
    Some((metadata, data))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn patch(state: &mut StubState, name: &str, body: &[u8]) -> Response {
    let Ok(patch) = serde_json::from_slice::<Value>(body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(object) = state.objects.get_mut(name) else {
        return not_found();
    };

    if let Some(content_type) = patch["contentType"].as_str() {
        object.content_type = content_type.to_string();
    }
    if let Some(metadata) = patch["metadata"].as_object() {
        for (key, value) in metadata {
            match value.as_str() {
                Some(value) => {
                    object.metadata.insert(key.clone(), value.to_string());
                }
                None => {
                    object.metadata.remove(key);
                }
            }
        }
    }

    let response = object_json(name, object);
    state.patches.push(patch);
    Json(response).into_response()
}

fn insert_acl(state: &mut StubState, name: &str) -> Response {
    if let Some(status) = state.acl_failure {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "ACL update rejected").into_response();
    }
    match state.objects.get_mut(name) {
        Some(object) => {
            object.public = true;
            Json(json!({ "entity": "allUsers", "role": "READER" })).into_response()
        }
        None => not_found(),
    }
}

fn rewrite(
    state: &mut StubState,
    source: &str,
    dest: &str,
    query: &HashMap<String, String>,
) -> Response {
    let token = query.get("rewriteToken").cloned();
    let acl = query.get("destinationPredefinedAcl").cloned();
    state.rewrite_tokens.push(token.clone());
    state.rewrite_acls.push(acl.clone());

    let Some(object) = state.objects.get(source).cloned() else {
        return not_found();
    };

    // Each step must resume from the token handed out by the previous one.
    let step = state.rewrite_tokens.len();
    let expected = (step > 1).then(|| format!("resume-{}", step - 1));
    if token != expected {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if step <= state.rewrite_steps {
        return Json(json!({ "done": false, "rewriteToken": format!("resume-{}", step) }))
            .into_response();
    }

    let copied = StubObject {
        public: acl.as_deref() == Some("publicRead"),
        ..object
    };
    let resource = object_json(dest, &copied);
    state.objects.insert(dest.to_string(), copied);
    Json(json!({ "done": true, "resource": resource })).into_response()
}
