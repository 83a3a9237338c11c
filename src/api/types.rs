//! Shared types for the HTTP layer.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::Multipart;
use axum::http::StatusCode;

use crate::pipeline::attachment::RawField;
use crate::pipeline::{ConversionPipeline, PipelineError};

// ═══════════════════════════════════════════════════════════
// API context: shared state for the router
// ═══════════════════════════════════════════════════════════

/// Shared context for all routes.
#[derive(Clone)]
pub struct ApiContext {
    pub pipeline: Arc<ConversionPipeline>,
    pub max_upload_bytes: usize,
}

impl ApiContext {
    pub fn new(pipeline: ConversionPipeline, max_upload_bytes: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            max_upload_bytes,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Multipart intake
// ═══════════════════════════════════════════════════════════

/// Every part of a multipart body, keyed by field name.
///
/// File parts become [`RawField::File`]; everything else becomes
/// [`RawField::Value`]. A file input left empty by the browser (blank
/// filename, no bytes) counts as absent.
#[derive(Debug, Default)]
pub struct UploadFields {
    fields: HashMap<String, RawField>,
}

/// A multipart body that could not be read to the end.
///
/// `system` is whatever the client submitted before the body broke off
/// (empty when the field had not arrived yet).
#[derive(Debug)]
pub struct IntakeError {
    pub system: String,
    pub error: PipelineError,
}

impl IntakeError {
    fn new(fields: &HashMap<String, RawField>, e: MultipartError) -> Self {
        let system = match fields.get("system") {
            Some(RawField::Value(v)) => v.clone(),
            _ => String::new(),
        };
        let error = if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            PipelineError::UploadTooLarge(e.body_text())
        } else {
            PipelineError::MalformedUpload(e.body_text())
        };
        Self { system, error }
    }
}

impl UploadFields {
    pub async fn read(mut multipart: Multipart) -> Result<Self, IntakeError> {
        let mut fields = HashMap::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| IntakeError::new(&fields, e))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let file_name = field.file_name().map(str::to_string);
            let bytes = match field.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => return Err(IntakeError::new(&fields, e)),
            };

            let raw = match file_name {
                Some(f) if f.is_empty() && bytes.is_empty() => RawField::Absent,
                Some(f) => RawField::File {
                    file_name: Some(f),
                    content: Some(bytes.to_vec()),
                },
                None => RawField::Value(String::from_utf8_lossy(&bytes).into_owned()),
            };
            tracing::debug!(field = %name, kind = ?raw, "Multipart field received");
            fields.insert(name, raw);
        }
        Ok(Self { fields })
    }

    /// Plain text value of `name`; empty when missing or not text.
    pub fn text(&mut self, name: &str) -> String {
        match self.fields.remove(name) {
            Some(RawField::Value(v)) => v,
            _ => String::new(),
        }
    }

    /// Raw field for the attachment extractor.
    pub fn take(&mut self, name: &str) -> RawField {
        self.fields.remove(name).unwrap_or(RawField::Absent)
    }
}
