//! REST API client module for the MaidEase booking service.
//!
//! This module provides the `ApiClient` pipeline for communicating with the
//! MaidEase API (`/api/v1`): listing maids, bookings, reviews and the
//! current user's profile.
//!
//! The API uses JWT bearer token authentication. Access tokens are short-lived;
//! the pipeline exchanges the refresh token for a new pair when a request is
//! rejected with 401 and replays the request once.

pub mod client;
pub mod error;
pub mod request;
pub mod transport;

pub use client::ApiClient;
pub use error::{ApiError, RefreshError};
pub use request::{decorate, ApiRequest, Attempt, MultipartPart, PreparedRequest, RequestBody};
pub use transport::{ApiResponse, HttpTransport, Transport};
