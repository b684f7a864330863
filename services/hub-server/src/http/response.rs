use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hub_protocol::{error_codes, HttpErrorEnvelope};
use std::fmt::Display;

pub type HttpResponse = Response;
pub type HttpResult<T = ()> = Result<T, HttpResponse>;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

pub fn internal_error(err: impl Display) -> HttpResponse {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR, err.to_string())
}

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, error_codes::BAD_REQUEST, message)
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, message)
}

pub fn conflict(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::CONFLICT, error_codes::CONFLICT, message)
}

pub fn gateway_timeout(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::GATEWAY_TIMEOUT, error_codes::TIMEOUT, message)
}

pub fn auth_failed(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED, message)
}

pub fn expired(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::GONE, error_codes::EXPIRED, message)
}

pub fn direction_mismatch(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, error_codes::DIRECTION_MISMATCH, message)
}

pub fn device_offline(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::CONFLICT, error_codes::DEVICE_OFFLINE, message)
}

pub fn io_error(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, error_codes::IO_ERROR, message)
}

pub fn invalid_path(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, error_codes::INVALID_PATH, message)
}

impl From<hub_transfer::TransferError> for HttpResponse {
    fn from(e: hub_transfer::TransferError) -> Self {
        match e {
            hub_transfer::TransferError::NotFound => not_found(e.to_string()),
            hub_transfer::TransferError::Expired => expired(e.to_string()),
            hub_transfer::TransferError::DirectionMismatch => direction_mismatch(e.to_string()),
        }
    }
}

impl From<hub_dispatch::DispatchError> for HttpResponse {
    fn from(e: hub_dispatch::DispatchError) -> Self {
        match &e {
            hub_dispatch::DispatchError::DeviceOffline(_) => device_offline(e.to_string()),
            hub_dispatch::DispatchError::Packaging(_) => internal_error(e.to_string()),
        }
    }
}

impl From<hub_md5cache::Md5CacheError> for HttpResponse {
    fn from(e: hub_md5cache::Md5CacheError) -> Self {
        io_error(e.to_string())
    }
}
