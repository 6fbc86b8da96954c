//! HTTP response building helpers
//!
//! Every handler answers through these so success bodies and error bodies
//! keep one shape.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::error::{RedemptionError, StorageError};

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// Build a JSON response with 201 Created status
pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

fn failure(status: StatusCode, message: &str, code: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &serde_json::json!({ "success": false, "error": message, "code": code }),
    )
}

/// Build a 404 Not Found response with message
pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    failure(StatusCode::NOT_FOUND, message, "NOT_FOUND")
}

/// Status code for each error kind
pub fn status_for(error: &RedemptionError) -> StatusCode {
    match error {
        RedemptionError::RewardNotFound(_)
        | RedemptionError::CodeNotFound
        | RedemptionError::RedemptionNotFound(_) => StatusCode::NOT_FOUND,
        RedemptionError::BusinessMismatch => StatusCode::FORBIDDEN,
        RedemptionError::AlreadyFulfilled | RedemptionError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        RedemptionError::RedemptionExpired | RedemptionError::RedemptionCancelled => {
            StatusCode::GONE
        }
        RedemptionError::RewardInactive(_)
        | RedemptionError::PointsMismatch { .. }
        | RedemptionError::RewardSoldOut(_)
        | RedemptionError::InsufficientPoints { .. }
        | RedemptionError::BalanceOverflow { .. }
        | RedemptionError::NotAffiliateReward(_)
        | RedemptionError::MissingAffiliateLink(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RedemptionError::InvalidInput(_) | RedemptionError::InvalidAmount(_) => {
            StatusCode::BAD_REQUEST
        }
        RedemptionError::Storage(StorageError::Conflict(_)) => StatusCode::CONFLICT,
        RedemptionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a RedemptionError to an appropriate HTTP response
pub fn error_response(error: RedemptionError) -> Response<Full<Bytes>> {
    failure(status_for(&error), &error.to_string(), error.kind())
}

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, RedemptionError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap a create result into an HTTP response with 201 Created
pub fn from_create_result<T: Serialize>(
    result: Result<T, RedemptionError>,
) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap an optional lookup into an HTTP response; None becomes 404
pub fn from_option<T: Serialize>(
    result: Result<Option<T>, RedemptionError>,
    not_found_msg: &str,
) -> Response<Full<Bytes>> {
    match result {
        Ok(Some(value)) => ok(&value),
        Ok(None) => not_found(not_found_msg),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_response() {
        let resp = ok(&serde_json::json!({"test": true}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_error_statuses() {
        let cases = [
            (RedemptionError::CodeNotFound, StatusCode::NOT_FOUND),
            (RedemptionError::BusinessMismatch, StatusCode::FORBIDDEN),
            (RedemptionError::AlreadyFulfilled, StatusCode::CONFLICT),
            (RedemptionError::RedemptionExpired, StatusCode::GONE),
            (
                RedemptionError::PointsMismatch { expected: 100, actual: 50 },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (RedemptionError::InvalidAmount(0), StatusCode::BAD_REQUEST),
            (
                StorageError::Internal("boom".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (StorageError::Conflict("taken".into()).into(), StatusCode::CONFLICT),
        ];
        for (error, status) in cases {
            assert_eq!(error_response(error).status(), status);
        }
    }

    #[test]
    fn test_from_option_none_is_404() {
        let resp = from_option::<String>(Ok(None), "Reward not found");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
