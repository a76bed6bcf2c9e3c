//! Request execution.
//!
//! The pipeline never talks to reqwest directly; it hands a `PreparedRequest`
//! to a [`Transport`]. `HttpTransport` is the production implementation and
//! tests plug in scripted ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{multipart, Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::request::{MultipartPart, PreparedRequest, RequestBody};
use super::ApiError;

/// Status, headers and body of a completed exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json_body(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON body: {}", e)))
    }

    /// Turn a non-success status into the matching `ApiError`.
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.text()))
        }
    }
}

/// Capability that executes a prepared request.
///
/// Failures to complete the exchange are `ApiError::NetworkError`; any status
/// the server answered with, 401 included, is an `Ok` response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, ApiError>;

    /// Name of this transport, for log fields.
    fn name(&self) -> &str {
        "unknown"
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, ApiError> {
        (**self).send(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// reqwest-backed transport against a base URL such as `http://localhost:8000/api/v1`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a request path against the base URL; absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Whether `url` is on the same scheme, host and port as the base URL.
    pub fn is_same_origin(&self, url: &str) -> bool {
        match (Url::parse(&self.base_url), Url::parse(url)) {
            (Ok(base), Ok(target)) => base.origin() == target.origin(),
            _ => false,
        }
    }

    fn multipart_form(parts: Vec<MultipartPart>) -> Result<multipart::Form, ApiError> {
        let mut form = multipart::Form::new();
        for part in parts {
            let mut field = multipart::Part::bytes(part.data.to_vec());
            if let Some(file_name) = part.file_name {
                field = field.file_name(file_name);
            }
            if let Some(mime) = part.mime.as_deref() {
                field = field.mime_str(mime).map_err(|e| {
                    ApiError::Validation(format!("Invalid MIME type {}: {}", mime, e))
                })?;
            }
            form = form.part(part.name, field);
        }
        Ok(form)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        // The bearer token only ever goes to the API host
        if request.headers.contains_key(AUTHORIZATION) && !self.is_same_origin(&url) {
            return Err(ApiError::Validation(format!(
                "Refusing to send credentials to {}",
                url
            )));
        }
        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = self
            .client
            .request(request.method, &url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => {
                let body =
                    serde_json::to_vec(&value).map_err(|e| ApiError::Validation(e.to_string()))?;
                builder.body(body)
            }
            RequestBody::Multipart(parts) => builder.multipart(Self::multipart_form(parts)?),
            RequestBody::Bytes { data, .. } => builder.body(data),
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        debug!(
            url = %url,
            status = status.as_u16(),
            bytes = body.len(),
            "Received response"
        );

        Ok(ApiResponse { status, headers, body })
    }

    fn name(&self) -> &str {
        "http"
    }
}
