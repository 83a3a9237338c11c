//! Conversion endpoints.
//!
//! `POST /convert/to/rios` and `POST /convert/from/rios` accept multipart
//! form submissions, run the pipeline on the blocking pool, and answer with
//! the archive as a download.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, IntakeError, UploadFields};
use crate::pipeline::{ConversionResponse, FromStandardForm, ToStandardForm};

/// Header carrying the audit session of a successful conversion.
pub const SESSION_HEADER: &str = "x-conversion-session";

/// `POST /convert/to/rios`
pub async fn to_standard(
    State(ctx): State<ApiContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let mut fields = read_fields(&ctx, multipart).await?;
    let form = ToStandardForm {
        system: fields.text("system"),
        format: fields.text("format"),
        instrument_title: fields.text("instrument_title"),
        instrument_id: fields.text("instrument_id"),
        outname: fields.text("outname"),
        content: fields.take("infile"),
    };
    let system = form.system.clone();

    let pipeline = Arc::clone(&ctx.pipeline);
    let result = tokio::task::spawn_blocking(move || pipeline.convert_to_standard(form))
        .await
        .map_err(|e| ApiError::Internal(format!("conversion task failed: {e}")))?;

    result
        .map(archive_response)
        .map_err(|e| ApiError::pipeline(system, e))
}

/// `POST /convert/from/rios`
pub async fn from_standard(
    State(ctx): State<ApiContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let mut fields = read_fields(&ctx, multipart).await?;
    let form = FromStandardForm {
        system: fields.text("system"),
        format: fields.text("format"),
        outname: fields.text("outname"),
        instrument: fields.take("instrument_file"),
        form: fields.take("form_file"),
        calculationset: fields.take("calculationset_file"),
    };
    let system = form.system.clone();

    let pipeline = Arc::clone(&ctx.pipeline);
    let result = tokio::task::spawn_blocking(move || pipeline.convert_from_standard(form))
        .await
        .map_err(|e| ApiError::Internal(format!("conversion task failed: {e}")))?;

    result
        .map(archive_response)
        .map_err(|e| ApiError::pipeline(system, e))
}

/// Collect the form, recording a body that breaks off or exceeds the limit.
async fn read_fields(ctx: &ApiContext, multipart: Multipart) -> Result<UploadFields, ApiError> {
    match UploadFields::read(multipart).await {
        Ok(fields) => Ok(fields),
        Err(IntakeError { system, error }) => {
            let pipeline = Arc::clone(&ctx.pipeline);
            let reported = system.clone();
            let error = tokio::task::spawn_blocking(move || pipeline.reject_intake(&reported, error))
                .await
                .map_err(|e| ApiError::Internal(format!("intake task failed: {e}")))?;
            Err(ApiError::pipeline(system, error))
        }
    }
}

fn archive_response(response: ConversionResponse) -> Response {
    let content_type = mime_guess::from_path(&response.file_name).first_or_octet_stream();
    let disposition = format!("attachment; filename=\"{}\"", response.file_name);
    let session = response.session.to_string();

    let mut http = (StatusCode::OK, response.archive).into_response();
    let headers = http.headers_mut();
    for (name, value) in [
        (header::CONTENT_TYPE, content_type.essence_str().to_string()),
        (header::CONTENT_DISPOSITION, disposition),
        (HeaderName::from_static(SESSION_HEADER), session),
    ] {
        match HeaderValue::from_str(&value) {
            Ok(v) => {
                headers.insert(name, v);
            }
            Err(e) => tracing::warn!(header = %name, error = %e, "Skipping invalid response header"),
        }
    }
    http
}
