//! Conversion request orchestrator.
//!
//! Drives one request through
//! `RECEIVED → PARAMS_CHECKED → CONTENT_VALIDATED → CONVERTED → PACKAGED → RESPONDED`
//! for either direction. Engines are injected through the [`EngineRegistry`],
//! so the orchestrator stays testable with in-process fakes.
//!
//! Every terminal transition is written to the session log before the
//! caller sees the result.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::attachment::{self, Attachment, RawField};
use super::content;
use super::csv_validation;
use super::dispatch::{
    classify, ConversionOutcome, ConversionRequest, ConvertedArtifacts, Diagnostics, Direction,
    DispatchError, EngineRegistry, Serialization, SystemId,
};
use super::packaging::{self, PendingEntry};
use super::session_log::{self, SessionId, SessionLog};

/// Shown to callers for every failure whose detail stays in the session log.
pub const INTERNAL_ERROR_MESSAGE: &str =
    "An unexpected error occurred during conversion. The details have been logged.";

pub const ID_NAMESPACE: &str = "urn:";

static TITLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\s]*$").expect("title pattern compiles"));
static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9]{3}[a-z0-9]*)?$").expect("id pattern compiles"));
static OUTNAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("outname pattern compiles"));

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Terminal failure of one request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Malformed upload: {0}")]
    MalformedUpload(String),

    /// The request body exceeded the configured upload limit.
    #[error("Upload too large: {0}")]
    UploadTooLarge(String),

    #[error("Invalid parameters: {}", .0.join("; "))]
    ParameterFailure(Vec<String>),

    #[error("Validation failed")]
    ValidationFailure(Vec<String>),

    #[error("Conversion failed: {0}")]
    ConversionFailure(String),

    /// The engine raised or panicked. The detail is for the session log only.
    #[error("Conversion engine crashed: {detail}")]
    EngineCrashed { detail: String },

    /// The engine result matched none of the known shapes.
    #[error("Engine result has an unknown shape: {0}")]
    PackagingDefect(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedUpload(_) => "malformed_upload",
            Self::UploadTooLarge(_) => "upload_too_large",
            Self::ParameterFailure(_) => "parameter_failure",
            Self::ValidationFailure(_) => "validation_failure",
            Self::ConversionFailure(_) => "conversion_failure",
            Self::EngineCrashed { .. } => "engine_crashed",
            Self::PackagingDefect(_) => "packaging_defect",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Messages safe to show the caller.
    pub fn errors(&self) -> Vec<String> {
        match self {
            Self::MalformedUpload(detail)
            | Self::UploadTooLarge(detail)
            | Self::ConversionFailure(detail) => vec![detail.clone()],
            Self::ParameterFailure(lines) | Self::ValidationFailure(lines) => lines.clone(),
            Self::EngineCrashed { .. } | Self::PackagingDefect(_) | Self::Internal(_) => {
                vec![INTERNAL_ERROR_MESSAGE.to_string()]
            }
        }
    }

    /// True when the caller only gets the generic message.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::EngineCrashed { .. } | Self::PackagingDefect(_) | Self::Internal(_)
        )
    }

    fn session_label(&self) -> &'static str {
        match self {
            Self::MalformedUpload(_) | Self::UploadTooLarge(_) => session_log::UPLOAD_FAILURE_LABEL,
            Self::ParameterFailure(_) => session_log::PARAMETERS_FAILURE_LABEL,
            Self::ValidationFailure(_) => session_log::VALIDATION_LABEL,
            Self::ConversionFailure(_) => session_log::FAILURE_LABEL,
            Self::EngineCrashed { .. } => session_log::CRASH_LABEL,
            Self::PackagingDefect(_) | Self::Internal(_) => session_log::ERROR_LABEL,
        }
    }

    /// Full detail for the audit trail.
    fn session_detail(&self) -> String {
        match self {
            Self::ParameterFailure(lines) | Self::ValidationFailure(lines) => lines.join("\n"),
            Self::MalformedUpload(detail)
            | Self::UploadTooLarge(detail)
            | Self::ConversionFailure(detail)
            | Self::PackagingDefect(detail)
            | Self::Internal(detail) => detail.clone(),
            Self::EngineCrashed { detail } => detail.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request and result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    ParamsChecked,
    ContentValidated,
    Converted,
    Packaged,
    Responded,
}

/// Submitted fields for a conversion into the standard format.
#[derive(Debug)]
pub struct ToStandardForm {
    pub system: String,
    pub format: String,
    pub instrument_title: String,
    pub instrument_id: String,
    pub outname: String,
    pub content: RawField,
}

/// Submitted fields for a conversion out of the standard format.
#[derive(Debug)]
pub struct FromStandardForm {
    pub system: String,
    pub format: String,
    pub outname: String,
    pub instrument: RawField,
    pub form: RawField,
    pub calculationset: RawField,
}

/// A packaged archive ready for download.
#[derive(Debug, Clone)]
pub struct ConversionResponse {
    pub session: SessionId,
    pub file_name: String,
    pub archive: Vec<u8>,
    pub entries: Vec<String>,
}

struct ToStandardParams {
    system: SystemId,
    serialization: Serialization,
    outname: String,
    id: String,
    title: String,
}

struct FromStandardParams {
    system: SystemId,
    serialization: Serialization,
    outname: String,
}

// ---------------------------------------------------------------------------
// Parameter checks
// ---------------------------------------------------------------------------

/// Prefix `id` with the namespace marker unless it already carries it.
pub fn namespace_id(id: &str) -> String {
    if id.starts_with(ID_NAMESPACE) {
        id.to_string()
    } else {
        format!("{ID_NAMESPACE}{id}")
    }
}

fn check_common(
    system: &str,
    format: &str,
    outname: &str,
    problems: &mut Vec<String>,
) -> Option<(SystemId, Serialization)> {
    let system = match system.parse::<SystemId>() {
        Ok(s) => Some(s),
        Err(e) => {
            problems.push(e.to_string());
            None
        }
    };
    let serialization = match format.parse::<Serialization>() {
        Ok(s) => Some(s),
        Err(e) => {
            problems.push(e);
            None
        }
    };
    if !OUTNAME_PATTERN.is_match(outname) {
        problems.push(format!(
            "Invalid output name {outname:?}: use letters, digits and underscores only"
        ));
    }
    Some((system?, serialization?))
}

fn check_to_standard(form: &ToStandardForm) -> Result<ToStandardParams, PipelineError> {
    let mut problems = Vec::new();
    let common = check_common(&form.system, &form.format, &form.outname, &mut problems);

    let title = form.instrument_title.trim();
    let id = form.instrument_id.trim();
    let bare_id = id.strip_prefix(ID_NAMESPACE).unwrap_or(id);
    if !TITLE_PATTERN.is_match(title) {
        problems.push(format!(
            "Invalid instrument title {title:?}: use letters, digits, underscores and spaces only"
        ));
    }
    if !ID_PATTERN.is_match(bare_id) {
        problems.push(format!(
            "Invalid instrument ID {id:?}: use at least 3 lowercase letters or digits"
        ));
    }

    if let Some((SystemId::Redcap, _)) = common {
        if id.is_empty() {
            problems.push("Instrument ID is required for redcap conversions".to_string());
        }
        if title.is_empty() {
            problems.push("Instrument title is required for redcap conversions".to_string());
        }
    }

    match common {
        Some((system, serialization)) if problems.is_empty() => Ok(ToStandardParams {
            system,
            serialization,
            outname: form.outname.clone(),
            id: if id.is_empty() { String::new() } else { namespace_id(id) },
            title: title.to_string(),
        }),
        _ => Err(PipelineError::ParameterFailure(problems)),
    }
}

fn check_from_standard(form: &FromStandardForm) -> Result<FromStandardParams, PipelineError> {
    let mut problems = Vec::new();
    match check_common(&form.system, &form.format, &form.outname, &mut problems) {
        Some((system, serialization)) if problems.is_empty() => Ok(FromStandardParams {
            system,
            serialization,
            outname: form.outname.clone(),
        }),
        _ => Err(PipelineError::ParameterFailure(problems)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs conversion requests against a fixed engine registry and audit log.
#[derive(Debug)]
pub struct ConversionPipeline {
    registry: EngineRegistry,
    sessions: SessionLog,
}

impl ConversionPipeline {
    pub fn new(registry: EngineRegistry, sessions: SessionLog) -> Self {
        Self { registry, sessions }
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionLog {
        &self.sessions
    }

    /// Convert a third-party instrument file into standard documents.
    pub fn convert_to_standard(
        &self,
        form: ToStandardForm,
    ) -> Result<ConversionResponse, PipelineError> {
        let session = self.sessions.open_session();
        let span = tracing::info_span!("convert_to_standard", session = %session, system = %form.system);
        let _guard = span.enter();

        let mut stage = Stage::Received;
        let result = self.run_to_standard(&session, form, &mut stage);
        self.finish(&session, stage, result)
    }

    /// Convert standard documents into a third-party instrument file.
    pub fn convert_from_standard(
        &self,
        form: FromStandardForm,
    ) -> Result<ConversionResponse, PipelineError> {
        let session = self.sessions.open_session();
        let span = tracing::info_span!("convert_from_standard", session = %session, system = %form.system);
        let _guard = span.enter();

        let mut stage = Stage::Received;
        let result = self.run_from_standard(&session, form, &mut stage);
        self.finish(&session, stage, result)
    }

    /// Record a request whose body never made it past multipart intake.
    pub fn reject_intake(&self, system: &str, error: PipelineError) -> PipelineError {
        let session = self.sessions.open_session();
        let span = tracing::info_span!("reject_intake", session = %session, system = %system);
        let _guard = span.enter();

        self.record_failure(&session, Stage::Received, &error);
        error
    }

    fn run_to_standard(
        &self,
        session: &SessionId,
        form: ToStandardForm,
        stage: &mut Stage,
    ) -> Result<ConversionResponse, PipelineError> {
        let params = check_to_standard(&form)?;
        advance(stage, Stage::ParamsChecked);
        self.sessions
            .record(session, &format!("{}_to_rios", params.system), b"");

        let mut upload = attachment::extract(form.content)
            .map_err(|e| PipelineError::MalformedUpload(e.to_string()))?;
        self.sessions
            .record_stream(session, session_log::UPLOAD_LABEL, upload.content());

        let verdict = if params.system.is_tabular() {
            content::validate_data_dictionary(upload.bytes())
                .map_err(|e| PipelineError::ValidationFailure(vec![e.to_string()]))?
        } else {
            content::validate_survey_export(upload.bytes())
        };
        if !verdict.passed {
            return Err(PipelineError::ValidationFailure(verdict.log));
        }
        let text = upload_text(&upload)?;
        advance(stage, Stage::ContentValidated);

        let request = match params.system {
            SystemId::Redcap => ConversionRequest::redcap_to_standard(&params.id, &params.title, text),
            SystemId::Qualtrics => ConversionRequest::qualtrics_to_standard(text),
        };
        let (raw, diagnostics) = self.invoke(session, params.system.as_str(), &request)?;
        advance(stage, Stage::Converted);

        let artifacts = expect_success(Direction::ToStandard, raw)?;
        let entries = packaging::to_standard_entries(
            &params.outname,
            params.serialization,
            &artifacts,
            &diagnostics,
        );
        let response = self.package(session, &params.outname, &entries)?;
        advance(stage, Stage::Packaged);
        Ok(response)
    }

    fn run_from_standard(
        &self,
        session: &SessionId,
        form: FromStandardForm,
        stage: &mut Stage,
    ) -> Result<ConversionResponse, PipelineError> {
        let params = check_from_standard(&form)?;
        advance(stage, Stage::ParamsChecked);
        self.sessions
            .record(session, &format!("rios_to_{}", params.system), b"");

        let malformed = |role: &str, e: attachment::AttachmentError| {
            PipelineError::MalformedUpload(format!("{role}: {e}"))
        };
        let mut instrument =
            attachment::extract(form.instrument).map_err(|e| malformed("instrument", e))?;
        let mut form_doc = attachment::extract(form.form).map_err(|e| malformed("form", e))?;
        let mut calculationset = attachment::extract_optional(form.calculationset)
            .map_err(|e| malformed("calculationset", e))?;

        self.sessions
            .record_stream(session, "uploaded_instrument_contents.log", instrument.content());
        self.sessions
            .record_stream(session, "uploaded_form_contents.log", form_doc.content());
        if let Some(calc) = calculationset.as_mut() {
            self.sessions
                .record_stream(session, "uploaded_calculationset_contents.log", calc.content());
        }

        let mut problems = Vec::new();
        let mut load = |upload: &Attachment, role: &str| {
            match content::load_standard_document(upload.bytes(), params.serialization, role) {
                Ok(value) => Some(value),
                Err(e) => {
                    problems.push(e);
                    None
                }
            }
        };
        let instrument = load(&instrument, "Instrument");
        let form_value = load(&form_doc, "Form");
        let calculationset = calculationset.as_ref().and_then(|c| load(c, "Calculationset"));
        let (Some(instrument), Some(form_value)) = (instrument, form_value) else {
            return Err(PipelineError::ValidationFailure(problems));
        };
        let references = std::iter::once(("Form", &form_value))
            .chain(calculationset.as_ref().map(|calc| ("Calculationset", calc)));
        for (role, document) in references {
            if let Err(e) = content::check_instrument_reference(document, &instrument, role) {
                problems.push(e);
            }
        }
        if !problems.is_empty() {
            return Err(PipelineError::ValidationFailure(problems));
        }
        advance(stage, Stage::ContentValidated);

        let request =
            ConversionRequest::from_standard(params.system, instrument, form_value, calculationset);
        let (raw, diagnostics) = self.invoke(session, params.system.as_str(), &request)?;
        advance(stage, Stage::Converted);

        let artifacts = expect_success(Direction::FromStandard, raw)?;
        let entries =
            packaging::from_standard_entries(&params.outname, params.system, &artifacts, &diagnostics);
        let response = self.package(session, &params.outname, &entries)?;
        advance(stage, Stage::Packaged);
        Ok(response)
    }

    /// Dispatch with engine failures contained. This is the only place
    /// engine errors and panics are caught.
    fn invoke(
        &self,
        session: &SessionId,
        system_id: &str,
        request: &ConversionRequest,
    ) -> Result<(Value, Diagnostics), PipelineError> {
        self.sessions
            .record_json(session, session_log::PARAMS_LABEL, &request.params_summary());

        let mut diagnostics = Diagnostics::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry.dispatch(system_id, request, &mut diagnostics)
        }));

        if !diagnostics.is_empty() {
            let mut text = diagnostics.text();
            text.push('\n');
            self.sessions
                .record(session, session_log::DIAGNOSTICS_LABEL, text);
        }

        match outcome {
            Ok(Ok(Ok(value))) => Ok((value, diagnostics)),
            Ok(Ok(Err(e))) => Err(PipelineError::EngineCrashed {
                detail: e.to_string(),
            }),
            Ok(Err(e @ DispatchError::UnknownSystem(_))) => {
                Err(PipelineError::ParameterFailure(vec![e.to_string()]))
            }
            Ok(Err(e @ DispatchError::NoEngine { .. })) => Err(PipelineError::Internal(e.to_string())),
            Err(payload) => Err(PipelineError::EngineCrashed {
                detail: format!("Engine panicked: {}", panic_message(payload.as_ref())),
            }),
        }
    }

    fn package(
        &self,
        session: &SessionId,
        outname: &str,
        entries: &[PendingEntry],
    ) -> Result<ConversionResponse, PipelineError> {
        let (written, archive) =
            packaging::package(entries).map_err(|e| PipelineError::Internal(e.to_string()))?;
        Ok(ConversionResponse {
            session: session.clone(),
            file_name: packaging::archive_name(outname),
            archive: archive.into_inner(),
            entries: written.into_iter().map(|e| e.name).collect(),
        })
    }

    /// Record the terminal transition, then hand the result back.
    fn finish(
        &self,
        session: &SessionId,
        stage: Stage,
        result: Result<ConversionResponse, PipelineError>,
    ) -> Result<ConversionResponse, PipelineError> {
        match &result {
            Ok(response) => {
                self.sessions
                    .record(session, session_log::OUTPUT_LABEL, &response.archive);
                tracing::info!(
                    stage = ?Stage::Responded,
                    file = %response.file_name,
                    entries = response.entries.len(),
                    "Conversion succeeded"
                );
            }
            Err(e) => self.record_failure(session, stage, e),
        }
        result
    }

    fn record_failure(&self, session: &SessionId, stage: Stage, e: &PipelineError) {
        let mut detail = e.session_detail();
        detail.push('\n');
        self.sessions.record(session, e.session_label(), detail);
        if e.is_internal() {
            tracing::error!(stage = ?stage, code = e.code(), error = %e, "Conversion failed");
        } else {
            tracing::info!(stage = ?stage, code = e.code(), "Conversion rejected");
        }
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    tracing::debug!(from = ?*stage, to = ?next, "Pipeline stage");
    *stage = next;
}

fn upload_text(upload: &Attachment) -> Result<String, PipelineError> {
    csv_validation::decode(upload.bytes())
        .map(str::to_string)
        .map_err(|e| PipelineError::ValidationFailure(vec![e.to_string()]))
}

fn expect_success(direction: Direction, raw: Value) -> Result<ConvertedArtifacts, PipelineError> {
    match classify(direction, raw) {
        ConversionOutcome::Success(artifacts) => Ok(artifacts),
        ConversionOutcome::Failure(reason) => Err(PipelineError::ConversionFailure(reason)),
        ConversionOutcome::Unmatched(value) => Err(PipelineError::PackagingDefect(value.to_string())),
    }
}
