//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::pipeline::processor::INTERNAL_ERROR_MESSAGE;
use crate::pipeline::PipelineError;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub errors: Vec<String>,
    pub system: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{source}")]
    Pipeline {
        system: String,
        source: PipelineError,
    },
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn pipeline(system: impl Into<String>, source: PipelineError) -> Self {
        Self::Pipeline {
            system: system.into(),
            source,
        }
    }
}

fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::MalformedUpload(_) | PipelineError::ParameterFailure(_) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::UploadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        PipelineError::ValidationFailure(_) | PipelineError::ConversionFailure(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PipelineError::EngineCrashed { .. }
        | PipelineError::PackagingDefect(_)
        | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Pipeline { system, source } => (
                status_for(&source),
                ErrorBody {
                    code: source.code(),
                    errors: source.errors(),
                    system,
                },
            ),
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "malformed_upload",
                    errors: vec![detail],
                    system: String::new(),
                },
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        code: "internal_error",
                        errors: vec![INTERNAL_ERROR_MESSAGE.to_string()],
                        system: String::new(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn parameter_failure_returns_400_with_system() {
        let err = ApiError::pipeline(
            "unknown",
            PipelineError::ParameterFailure(vec!["Unknown system: \"unknown\"".into()]),
        );
        let (status, json) = render(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "parameter_failure");
        assert_eq!(json["system"], "unknown");
        assert_eq!(json["errors"][0], "Unknown system: \"unknown\"");
    }

    #[tokio::test]
    async fn validation_failure_returns_422_with_full_log() {
        let log = vec!["Invalid fields: ['essay']".to_string(), "Detail error log:".to_string()];
        let (status, json) = render(ApiError::pipeline("redcap", PipelineError::ValidationFailure(log))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn engine_crash_hides_details() {
        let err = ApiError::pipeline(
            "qualtrics",
            PipelineError::EngineCrashed {
                detail: "KeyError: 'SurveyElements'".into(),
            },
        );
        let (status, json) = render(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "engine_crashed");
        assert_eq!(json["errors"][0], INTERNAL_ERROR_MESSAGE);
        assert!(!json.to_string().contains("SurveyElements"));
    }

    #[tokio::test]
    async fn packaging_defect_is_internal() {
        let (status, json) = render(ApiError::pipeline("redcap", PipelineError::PackagingDefect("{}".into()))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "packaging_defect");
    }

    #[tokio::test]
    async fn oversized_upload_returns_413_with_system() {
        let err = ApiError::pipeline("redcap", PipelineError::UploadTooLarge("length limit exceeded".into()));
        let (status, json) = render(err).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["code"], "upload_too_large");
        assert_eq!(json["system"], "redcap");
    }

    #[tokio::test]
    async fn bad_request_returns_400() {
        let (status, json) = render(ApiError::BadRequest("not multipart".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "malformed_upload");
    }

    #[tokio::test]
    async fn internal_returns_500() {
        let (status, json) = render(ApiError::Internal("task join failed".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["errors"][0], INTERNAL_ERROR_MESSAGE);
    }
}
