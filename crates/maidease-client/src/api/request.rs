//! Outbound request description and the decorator that prepares it for the wire.
//!
//! An `ApiRequest` is what callers build. Each time the pipeline sends it, the
//! request is wrapped in an `Attempt` and run through [`decorate`], which
//! attaches the bearer credential and negotiates the content type.

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use tracing::warn;

use crate::auth::CredentialPair;

use super::ApiError;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A single part of a multipart upload.
///
/// Parts own their bytes so the request can be replayed after a token refresh.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub mime: Option<String>,
    pub data: Bytes,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            mime: None,
            data: Bytes::from(value.into()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: Some(file_name.into()),
            mime: None,
            data: data.into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Multipart(Vec<MultipartPart>),
    Bytes {
        data: Bytes,
        content_type: Option<String>,
    },
}

impl RequestBody {
    /// Binary bodies carry their own content type and must never be labelled JSON.
    pub fn is_binary(&self) -> bool {
        matches!(self, RequestBody::Multipart(_) | RequestBody::Bytes { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Sent without a bearer credential and never refreshed (login, refresh).
    pub anonymous: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            anonymous: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| ApiError::Validation(e.to_string()))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn json_value(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn multipart(mut self, parts: Vec<MultipartPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    pub fn bytes(mut self, data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        self.body = RequestBody::Bytes {
            data: data.into(),
            content_type: content_type.map(str::to_string),
        };
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }
}

/// One logical attempt at delivering an `ApiRequest`.
///
/// `retried` is set once the attempt has been replayed after a refresh; a
/// retried attempt that fails authorization again is terminal.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub request: ApiRequest,
    pub retried: bool,
    /// Access token the attempt went out with, if any.
    pub(crate) sent_with: Option<String>,
}

impl Attempt {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retried: false,
            sent_with: None,
        }
    }

    pub fn into_retry(mut self) -> Self {
        self.retried = true;
        self
    }

    pub fn sent_with(&self) -> Option<&str> {
        self.sent_with.as_deref()
    }

    /// Whether a 401 on this attempt may start (or join) a refresh cycle.
    pub fn is_refreshable(&self) -> bool {
        !self.retried && !self.request.anonymous
    }
}

/// A decorated request, ready for a `Transport`.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    access_token: Option<String>,
}

impl PreparedRequest {
    /// Access token attached as the bearer credential.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Attach credentials and content type to `request`.
///
/// Reads nothing but its arguments. Multipart bodies get no content type at all
/// (the transport sets the boundary-aware one), raw bytes get their own, and
/// everything else is sent as JSON.
pub fn decorate(request: &ApiRequest, credentials: Option<&CredentialPair>) -> PreparedRequest {
    let mut headers = request.headers.clone();
    let mut access_token = None;

    if !request.anonymous {
        if let Some(pair) = credentials.filter(|p| !p.access_token.is_empty()) {
            match HeaderValue::from_str(&format!("Bearer {}", pair.access_token)) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(header::AUTHORIZATION, value);
                    access_token = Some(pair.access_token.clone());
                }
                Err(_) => warn!(
                    path = %request.path,
                    "Access token is not a valid header value, sending without it"
                ),
            }
        }
    }

    match &request.body {
        RequestBody::Multipart(_) => {
            headers.remove(header::CONTENT_TYPE);
        }
        RequestBody::Bytes { content_type, .. } => {
            headers.remove(header::CONTENT_TYPE);
            let value = content_type
                .as_deref()
                .and_then(|ct| HeaderValue::from_str(ct).ok());
            if let Some(value) = value {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        RequestBody::Json(_) | RequestBody::Empty => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        }
    }

    PreparedRequest {
        method: request.method.clone(),
        path: request.path.clone(),
        query: request.query.clone(),
        headers,
        body: request.body.clone(),
        access_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> CredentialPair {
        CredentialPair::new("access-1", "refresh-1")
    }

    fn bearer(prepared: &PreparedRequest) -> Option<&str> {
        prepared
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_decorate_attaches_bearer_token() {
        let request = ApiRequest::get("/bookings");
        let prepared = decorate(&request, Some(&pair()));
        assert_eq!(bearer(&prepared), Some("Bearer access-1"));
        assert_eq!(prepared.access_token(), Some("access-1"));
    }

    #[test]
    fn test_decorate_without_credentials() {
        let prepared = decorate(&ApiRequest::get("/maids"), None);
        assert_eq!(bearer(&prepared), None);
        assert_eq!(prepared.access_token(), None);
        assert_eq!(prepared.content_type(), Some(JSON_CONTENT_TYPE));
    }

    #[test]
    fn test_anonymous_request_skips_bearer() {
        let request = ApiRequest::post("/auth/login").anonymous();
        let prepared = decorate(&request, Some(&pair()));
        assert_eq!(bearer(&prepared), None);
    }

    #[test]
    fn test_json_body_gets_json_content_type() {
        let request = ApiRequest::post("/bookings")
            .json(&serde_json::json!({ "maid_id": 3, "notes": "two rooms" }))
            .unwrap();
        let prepared = decorate(&request, Some(&pair()));
        assert_eq!(prepared.content_type(), Some(JSON_CONTENT_TYPE));
    }

    #[test]
    fn test_multipart_body_has_no_forced_content_type() {
        let request = ApiRequest::post("/maids/me/photo")
            .header(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE))
            .multipart(vec![
                MultipartPart::file("photo", "me.png", vec![1u8, 2, 3]).with_mime("image/png")
            ]);
        let prepared = decorate(&request, Some(&pair()));
        assert_eq!(prepared.content_type(), None);
        assert_eq!(bearer(&prepared), Some("Bearer access-1"));
    }

    #[test]
    fn test_bytes_body_keeps_its_own_content_type() {
        let request = ApiRequest::put("/documents/1").bytes(vec![0u8; 4], Some("application/pdf"));
        let prepared = decorate(&request, None);
        assert_eq!(prepared.content_type(), Some("application/pdf"));
    }

    #[test]
    fn test_decorate_replaces_stale_authorization() {
        let request = ApiRequest::get("/users/me")
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer old"));
        let prepared = decorate(&request, Some(&pair()));
        assert_eq!(bearer(&prepared), Some("Bearer access-1"));
    }

    #[test]
    fn test_attempt_refreshable_once() {
        let attempt = Attempt::new(ApiRequest::get("/bookings"));
        assert!(attempt.is_refreshable());
        assert!(!attempt.into_retry().is_refreshable());
        assert!(!Attempt::new(ApiRequest::get("/x").anonymous()).is_refreshable());
    }

    #[test]
    fn test_json_serialization_failure_is_validation_error() {
        use std::collections::HashMap;
        // Non-string map keys cannot be represented in JSON
        let mut bad = HashMap::new();
        bad.insert((1, 2), "x");
        let err = ApiRequest::post("/bookings").json(&bad).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
