//! Error-response middleware
//!
//! The single recovery point of a service: every failure that escapes a
//! handler, whether returned as an [`Error`] or raised as a panic, becomes a
//! JSON body of the form `{"status": <code>, "error": <message>}` with the same
//! HTTP status. Unclassified failures are reported with a generic message so
//! internals never reach the client. Error responses produced outside the
//! toolkit, such as axum's plain-text extractor rejections, are rewritten into
//! the same shape.
//!
//! # Example
//!
//! ```rust,ignore
//! use makeprojects_toolkit::middleware::RequestHandlingExt;
//!
//! let app = Router::new()
//!     .route("/projects/{id}", get(get_project))
//!     .with_request_handling();
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Router,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Message reported for every unclassified failure
pub const GENERIC_ERROR_MESSAGE: &str = "An unexpected error occurred.";

/// Upper bound on a foreign error body read back as a message
const FOREIGN_BODY_LIMIT: usize = 16 * 1024;

/// JSON body of an error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// HTTP status code, identical to the response status
    pub status: u16,
    /// Client-facing message
    pub error: String,
}

impl ErrorBody {
    /// Map an error to its client-facing body
    pub fn from_error(error: &Error) -> Self {
        let status = status_for(error.kind());
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            GENERIC_ERROR_MESSAGE.to_string()
        } else {
            error.to_string()
        };
        Self {
            status: status.as_u16(),
            error: message,
        }
    }

    /// Body for a failure that carries no usable error value
    pub fn unexpected() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            error: GENERIC_ERROR_MESSAGE.to_string(),
        }
    }

    /// Body for an error response that did not come from an [`Error`]
    ///
    /// Client errors keep the original text, falling back to the status
    /// reason; server errors only ever carry the generic message.
    pub fn for_status(status: StatusCode, text: &str) -> Self {
        let error = if status.is_server_error() {
            GENERIC_ERROR_MESSAGE.to_string()
        } else {
            match text.trim() {
                "" => status
                    .canonical_reason()
                    .unwrap_or(GENERIC_ERROR_MESSAGE)
                    .to_string(),
                text => text.to_string(),
            }
        };
        Self {
            status: status.as_u16(),
            error,
        }
    }

    /// Status code as an [`http::StatusCode`](StatusCode)
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ErrorBody {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument | ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidOperation
        | ErrorKind::Domain
        | ErrorKind::Validation
        | ErrorKind::Store
        | ErrorKind::Config
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render the canonical error response for `error`
pub fn render_error(error: &Error) -> Response {
    ErrorBody::from_error(error).into_response()
}

/// Response extension carrying the error a handler returned
///
/// Attached by `Error`'s `IntoResponse` impl so [`handle_requests`] can log the
/// original failure.
#[derive(Debug, Clone)]
pub struct EscapedError(pub Arc<Error>);

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn handled(body: ErrorBody) -> Response {
    if body.status_code().is_server_error() {
        tracing::error!(
            "Exception handled: StatusCode:{} - Message:{}",
            body.status,
            body.error
        );
    } else {
        tracing::warn!(
            "Exception handled: StatusCode:{} - Message:{}",
            body.status,
            body.error
        );
    }
    body.into_response()
}

/// Error status whose body is not already JSON
fn is_foreign_error(response: &Response) -> bool {
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    (status.is_client_error() || status.is_server_error()) && !is_json
}

async fn rewrite_foreign_error(response: Response) -> ErrorBody {
    let status = response.status();
    let text = to_bytes(response.into_body(), FOREIGN_BODY_LIMIT)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    ErrorBody::for_status(status, &text)
}

/// Request-handling middleware function
///
/// Logs every request before and after the inner chain runs and converts
/// escaped failures into JSON error responses. Install with
/// `axum::middleware::from_fn(handle_requests)` or
/// [`RequestHandlingExt::with_request_handling`].
pub async fn handle_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    tracing::info!("Handling request: {} {}", method, path);

    let mut response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            tracing::error!(
                method = %method,
                path = %path,
                panic = panic_message(panic.as_ref()),
                "An unhandled exception occurred while processing the request."
            );
            return handled(ErrorBody::unexpected());
        }
    };

    let escaped = response.extensions_mut().remove::<EscapedError>();
    match escaped {
        Some(EscapedError(error)) => {
            tracing::error!(
                method = %method,
                path = %path,
                kind = %error.kind(),
                error = %error,
                "An unhandled exception occurred while processing the request."
            );
            handled(ErrorBody::from_error(&error))
        }
        None if is_foreign_error(&response) => {
            let body = rewrite_foreign_error(response).await;
            tracing::warn!(
                method = %method,
                path = %path,
                status = body.status,
                "Request rejected before reaching a handler"
            );
            handled(body)
        }
        None => {
            tracing::info!("Request handled successfully: {} {}", method, path);
            response
        }
    }
}

/// Installs [`handle_requests`] on a router
pub trait RequestHandlingExt {
    /// Wrap every route with the error-response middleware
    fn with_request_handling(self) -> Self;
}

impl<S> RequestHandlingExt for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_request_handling(self) -> Self {
        self.layer(axum::middleware::from_fn(handle_requests))
    }
}
