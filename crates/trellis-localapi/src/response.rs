//! Response plumbing shared by the handlers

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use trellis_backend::BackendError;

/// Body type every handler produces.
pub type ApiBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> ApiBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ApiBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Plain-text response; a trailing newline is added if missing.
pub fn text(status: StatusCode, msg: impl Into<String>) -> Response<ApiBody> {
    let mut msg = msg.into();
    if !msg.ends_with('\n') {
        msg.push('\n');
    }
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(msg))
        .unwrap()
}

/// JSON response with an explicit content type.
pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(body))
            .unwrap(),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("JSON encoding error: {e}")),
    }
}

pub fn no_content() -> Response<ApiBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_body())
        .unwrap()
}

#[derive(Serialize)]
struct ErrorJson {
    error: String,
}

/// Handler failure, carrying how it should be rendered.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    /// 400 with a JSON `{error}` body, for clients that parse it.
    #[error("{0}")]
    BadRequestJson(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    MethodNotAllowed(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
    /// 500 with a JSON `{error}` body.
    #[error("{0}")]
    InternalJson(String),
}

impl ApiError {
    pub fn forbidden(msg: impl Into<String>) -> ApiError {
        ApiError::Forbidden(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> ApiError {
        ApiError::BadRequest(msg.into())
    }

    pub fn into_response(self) -> Response<ApiBody> {
        use ApiError::*;
        match self {
            Unauthorized(msg) => text(StatusCode::UNAUTHORIZED, msg),
            Forbidden(msg) => text(StatusCode::FORBIDDEN, msg),
            BadRequest(msg) => text(StatusCode::BAD_REQUEST, msg),
            BadRequestJson(msg) => json(StatusCode::BAD_REQUEST, &ErrorJson { error: msg }),
            NotFound(msg) => text(StatusCode::NOT_FOUND, msg),
            MethodNotAllowed(msg) => text(StatusCode::METHOD_NOT_ALLOWED, msg),
            BadGateway(msg) => text(StatusCode::BAD_GATEWAY, msg),
            Unavailable(msg) => text(StatusCode::SERVICE_UNAVAILABLE, msg),
            Internal(msg) => text(StatusCode::INTERNAL_SERVER_ERROR, msg),
            InternalJson(msg) => json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorJson { error: msg },
            ),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> ApiError {
        match &e {
            BackendError::NotReady | BackendError::NoNetMap => ApiError::Unavailable(e.to_string()),
            BackendError::InvalidPrefs(_) => ApiError::BadRequestJson(e.to_string()),
            BackendError::FileNotFound(_) | BackendError::UnknownPeer => {
                ApiError::NotFound(e.to_string())
            }
            BackendError::Unsupported => ApiError::Unavailable(e.to_string()),
            BackendError::Dial(_) => ApiError::BadGateway(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

/// Like `From<BackendError>`, but failures that would render as plain 500s
/// become JSON `{error}` bodies instead; used by handlers whose clients
/// parse errors.
pub fn backend_error_json(e: BackendError) -> ApiError {
    match ApiError::from(e) {
        ApiError::Internal(msg) => ApiError::InternalJson(msg),
        other => other,
    }
}
