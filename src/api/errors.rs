use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::errors::CoreError;

/// Wrapper turning any `anyhow::Error` into an HTTP response. Typed
/// `CoreError` conditions inside the chain map to specific status codes;
/// everything else is a 500.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<CoreError>() {
            Some(CoreError::DeviceNotFound(_)) => StatusCode::NOT_FOUND,
            Some(CoreError::ValidationFailure(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(CoreError::AlreadyResolved) => StatusCode::CONFLICT,
            Some(CoreError::CapacityExceeded) | Some(CoreError::UpstreamUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: anyhow::Error) -> StatusCode {
        AppError(err).into_response().status()
    }

    #[test]
    fn core_errors_map_to_specific_statuses() {
        assert_eq!(
            status_of(CoreError::DeviceNotFound("x".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(CoreError::ValidationFailure("empty batch".into()).into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(CoreError::AlreadyResolved.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CoreError::CapacityExceeded.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn context_layers_do_not_hide_the_typed_error() {
        let err = anyhow::Error::from(CoreError::DeviceNotFound("gw-1".into()))
            .context("while handling request");
        assert_eq!(status_of(err), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unknown_errors_are_internal() {
        assert_eq!(
            status_of(anyhow::anyhow!("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
