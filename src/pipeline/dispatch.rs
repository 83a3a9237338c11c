//! Conversion dispatch: picks the engine entry point for a system and
//! direction, invokes it, and classifies what came back.
//!
//! The registry is a closed table keyed by [`SystemId`] and [`Direction`],
//! filled once at startup. Engine panics and errors are not handled here;
//! the processor owns that boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_VERSION: &str = "1.0";
pub const DEFAULT_LOCALIZATION: &str = "en";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown system: {0:?} (expected one of: redcap, qualtrics)")]
    UnknownSystem(String),

    #[error("No conversion engine registered for {system} ({direction})")]
    NoEngine { system: SystemId, direction: Direction },
}

/// Failure raised by an engine itself, as opposed to a handled
/// `{failure: ..}` result.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine exited with status {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("Engine produced unreadable output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Third-party instrument systems the service converts to and from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemId {
    Redcap,
    Qualtrics,
}

impl SystemId {
    pub const ALL: [SystemId; 2] = [SystemId::Redcap, SystemId::Qualtrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redcap => "redcap",
            Self::Qualtrics => "qualtrics",
        }
    }

    /// Tabular systems go through structural CSV validation before dispatch.
    pub fn is_tabular(&self) -> bool {
        matches!(self, Self::Redcap)
    }

    /// Extension of the single file produced when converting from the standard.
    pub fn export_extension(&self) -> &'static str {
        match self {
            Self::Redcap => "csv",
            Self::Qualtrics => "txt",
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemId {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redcap" => Ok(Self::Redcap),
            "qualtrics" => Ok(Self::Qualtrics),
            other => Err(DispatchError::UnknownSystem(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToStandard,
    FromStandard,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToStandard => "to_standard",
            Self::FromStandard => "from_standard",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialization of standard documents, both on input and in archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serialization {
    Yaml,
    Json,
}

impl Serialization {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }
}

impl FromStr for Serialization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yaml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => Err(format!("Unsupported format: {other:?} (expected yaml or json)")),
        }
    }
}

/// Named arguments handed to an engine. Built fresh for each request.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionRequest {
    pub system: SystemId,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filemetadata: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculationset: Option<Value>,
    pub suppress: bool,
}

impl ConversionRequest {
    fn base(system: SystemId, direction: Direction) -> Self {
        Self {
            system,
            direction,
            id: None,
            title: None,
            description: None,
            instrument_version: None,
            localization: None,
            filemetadata: None,
            content: None,
            instrument: None,
            form: None,
            calculationset: None,
            suppress: true,
        }
    }

    /// Data dictionary → standard. Identifier and title are required here.
    pub fn redcap_to_standard(id: &str, title: &str, content: String) -> Self {
        Self {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            description: Some(String::new()),
            instrument_version: Some(DEFAULT_VERSION.to_string()),
            localization: Some(DEFAULT_LOCALIZATION.to_string()),
            content: Some(content),
            ..Self::base(SystemId::Redcap, Direction::ToStandard)
        }
    }

    /// Survey export → standard. Metadata is read from the file itself.
    pub fn qualtrics_to_standard(content: String) -> Self {
        Self {
            filemetadata: Some(true),
            content: Some(content),
            ..Self::base(SystemId::Qualtrics, Direction::ToStandard)
        }
    }

    pub fn from_standard(
        system: SystemId,
        instrument: Value,
        form: Value,
        calculationset: Option<Value>,
    ) -> Self {
        Self {
            instrument: Some(instrument),
            form: Some(form),
            calculationset,
            localization: Some(DEFAULT_LOCALIZATION.to_string()),
            ..Self::base(system, Direction::FromStandard)
        }
    }

    /// Request parameters without the uploaded payloads, for the audit log.
    pub fn params_summary(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            for key in ["content", "instrument", "form", "calculationset"] {
                if map.contains_key(key) {
                    map.insert(key.to_string(), Value::String("<attached>".into()));
                }
            }
        }
        value
    }
}

/// Collector for engine diagnostics (warnings, notes) emitted during a call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    lines: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// An external conversion engine entry point.
///
/// Returns the raw result mapping. A handled failure is a normal `Ok` value
/// shaped `{"failure": ..}`; `Err` (or a panic) means the engine itself broke.
pub trait ConversionEngine: Send + Sync {
    fn convert(
        &self,
        request: &ConversionRequest,
        diagnostics: &mut Diagnostics,
    ) -> Result<Value, EngineError>;
}

impl<F> ConversionEngine for F
where
    F: Fn(&ConversionRequest, &mut Diagnostics) -> Result<Value, EngineError> + Send + Sync,
{
    fn convert(
        &self,
        request: &ConversionRequest,
        diagnostics: &mut Diagnostics,
    ) -> Result<Value, EngineError> {
        self(request, diagnostics)
    }
}

/// Closed mapping from (system, direction) to engine.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: BTreeMap<(SystemId, Direction), Arc<dyn ConversionEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        system: SystemId,
        direction: Direction,
        engine: impl ConversionEngine + 'static,
    ) -> Self {
        self.engines.insert((system, direction), Arc::new(engine));
        self
    }

    pub fn is_registered(&self, system: SystemId, direction: Direction) -> bool {
        self.engines.contains_key(&(system, direction))
    }

    /// Resolve an engine by its textual system identifier.
    pub fn resolve(
        &self,
        system_id: &str,
        direction: Direction,
    ) -> Result<(SystemId, Arc<dyn ConversionEngine>), DispatchError> {
        let system: SystemId = system_id.parse()?;
        self.engines
            .get(&(system, direction))
            .cloned()
            .map(|engine| (system, engine))
            .ok_or(DispatchError::NoEngine { system, direction })
    }

    /// Select and invoke the engine for `system_id`.
    ///
    /// Unknown identifiers fail before the engine is touched.
    pub fn dispatch(
        &self,
        system_id: &str,
        request: &ConversionRequest,
        diagnostics: &mut Diagnostics,
    ) -> Result<Result<Value, EngineError>, DispatchError> {
        let (system, engine) = self.resolve(system_id, request.direction)?;
        tracing::debug!(%system, direction = %request.direction, "Dispatching to conversion engine");
        Ok(engine.convert(request, diagnostics))
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.engines.keys()).finish()
    }
}

/// Artifacts of a successful conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedArtifacts {
    pub instrument: Value,
    pub form: Option<Value>,
    pub calculationset: Option<Value>,
    pub logs: Option<Value>,
}

/// The three legitimate result shapes plus the defect case.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    Success(ConvertedArtifacts),
    Failure(String),
    Unmatched(Value),
}

/// Classify a raw engine result for `direction`.
///
/// To-standard success needs `instrument` and `form`; from-standard success
/// needs `instrument`. A mapping that mixes success keys with `failure`, or
/// matches neither, is `Unmatched`.
pub fn classify(direction: Direction, result: Value) -> ConversionOutcome {
    let map = match result {
        Value::Object(map) => map,
        other => return ConversionOutcome::Unmatched(other),
    };

    let has = |key: &str| map.get(key).is_some_and(|v| !v.is_null());
    let (instrument, form, failure) = (has("instrument"), has("form"), has("failure"));
    let success_shape = match direction {
        Direction::ToStandard => instrument && form,
        Direction::FromStandard => instrument,
    };

    match (success_shape, failure) {
        (true, false) => ConversionOutcome::Success(take_artifacts(map)),
        (false, true) if !instrument && !form => {
            let failure = match &map["failure"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            ConversionOutcome::Failure(failure)
        }
        _ => ConversionOutcome::Unmatched(Value::Object(map)),
    }
}

fn take_artifacts(mut map: Map<String, Value>) -> ConvertedArtifacts {
    let mut take = |key: &str| map.remove(key).filter(|v| !v.is_null());
    ConvertedArtifacts {
        instrument: take("instrument").unwrap_or(Value::Null),
        form: take("form"),
        calculationset: take("calculationset"),
        logs: take("logs"),
    }
}
