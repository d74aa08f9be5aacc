use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use insight_contracts::{ErrorBody, ErrorResponse};
use thiserror::Error;

use crate::completion::CompletionError;
use crate::crm::CrmError;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Crm(#[from] CrmError),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "store_error",
            Self::Queue(_) => "queue_error",
            Self::Completion(_) | Self::Crm(_) => "upstream_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_variants_to_status_and_code() {
        let cases = [
            (ServiceError::Validation("x".into()), StatusCode::BAD_REQUEST, "validation_error"),
            (ServiceError::Forbidden("Forbidden"), StatusCode::FORBIDDEN, "forbidden"),
            (ServiceError::NotFound("x".into()), StatusCode::NOT_FOUND, "not_found"),
            (
                ServiceError::Store(StoreError::TableNotFound("Customers".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
            ),
            (
                ServiceError::Crm(CrmError::InvalidWatermark("bad".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_error",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }
}
