//! Error types for the controller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type alias used throughout the controller.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request body or unknown `serviceType` — no state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// The document store could not be reached or returned malformed data.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// A Kubernetes API call failed for reasons other than "not found".
    #[error("cluster error: {0}")]
    Cluster(#[from] kube::Error),

    /// An outgoing HTTP call (agent notification, node health probe) failed.
    #[error("http call failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A local I/O operation (binding the listener, reading a manifest) failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No computing node could host a new pod for a service type.
    #[error("no enough computing resource")]
    NoComputingResource,

    /// The allocator could not place the new agent even after scaling:
    /// the subscribing agent is turned away, existing state is untouched.
    #[error("reject the subscription")]
    SubscriptionRejected,

    /// A referenced entity (service, node, pod) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal invariant violated; indicates a controller bug rather than
    /// bad input.
    #[error("controller program bug: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) | Error::NoComputingResource | Error::SubscriptionRejected => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::StoreUnavailable(_)
            | Error::Cluster(_)
            | Error::Http(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
