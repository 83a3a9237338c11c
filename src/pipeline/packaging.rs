//! Output archive assembly.
//!
//! Each payload is serialized into its own in-memory buffer (rewound after
//! writing), then every buffer becomes one deflated entry of a zip archive.
//! Roles missing from a result get no entry at all.

use std::io::{Cursor, Read, Write};

use serde_json::{Map, Value};
use thiserror::Error;

use super::dispatch::{ConvertedArtifacts, Diagnostics, Serialization, SystemId};

pub const CONVERSION_LOG_NAME: &str = "conversion_log.txt";
pub const ARCHIVE_EXTENSION: &str = "zip";

#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Tabular payload must be a list of rows, got: {0}")]
    NotTabular(String),
}

/// How a payload is written into its archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Markup(Serialization),
    Tabular,
    Text,
}

/// Role a payload plays in a to-standard result; decides the name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Instrument,
    Form,
    CalculationSet,
}

impl Role {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Instrument => "i",
            Self::Form => "f",
            Self::CalculationSet => "c",
        }
    }
}

/// `<outname>_<i|f|c>.<ext>`
pub fn entry_name(outname: &str, role: Role, serialization: Serialization) -> String {
    format!("{outname}_{}.{}", role.suffix(), serialization.extension())
}

pub fn archive_name(outname: &str) -> String {
    format!("{outname}.{ARCHIVE_EXTENSION}")
}

/// One payload waiting to be packaged.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub name: String,
    pub payload: Value,
    pub kind: PayloadKind,
}

impl PendingEntry {
    pub fn new(name: impl Into<String>, payload: Value, kind: PayloadKind) -> Self {
        Self {
            name: name.into(),
            payload,
            kind,
        }
    }
}

/// A serialized archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Rebuild objects with keys inserted in sorted order, so output is stable
/// whether or not the map type preserves insertion order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_line(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Serialize `payload` into a fresh buffer positioned at offset 0.
pub fn write_payload(payload: &Value, kind: PayloadKind) -> Result<Cursor<Vec<u8>>, PackagingError> {
    let mut buffer = Cursor::new(Vec::new());
    match kind {
        PayloadKind::Markup(Serialization::Json) => {
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
            let mut ser = serde_json::Serializer::with_formatter(&mut buffer, formatter);
            serde::Serialize::serialize(&sorted(payload), &mut ser)?;
            buffer.write_all(b"\n")?;
        }
        PayloadKind::Markup(Serialization::Yaml) => {
            serde_yaml::to_writer(&mut buffer, &sorted(payload))?;
        }
        PayloadKind::Tabular => {
            let rows = payload
                .as_array()
                .ok_or_else(|| PackagingError::NotTabular(payload.to_string()))?;
            let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(&mut buffer);
            for row in rows {
                match row {
                    Value::Array(cells) => writer.write_record(cells.iter().map(cell))?,
                    scalar => writer.write_record([cell(scalar)])?,
                }
            }
            writer.flush()?;
        }
        PayloadKind::Text => match payload {
            Value::Array(lines) => {
                for line in lines {
                    writeln!(buffer, "{}", text_line(line))?;
                }
            }
            other => buffer.write_all(text_line(other).as_bytes())?,
        },
    }
    buffer.set_position(0);
    Ok(buffer)
}

/// Serialize every pending entry and pack them into one compressed archive.
///
/// Returns the serialized entries alongside the archive buffer (rewound).
pub fn package(entries: &[PendingEntry]) -> Result<(Vec<ArchiveEntry>, Cursor<Vec<u8>>), PackagingError> {
    let mut written = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut buffer = write_payload(&entry.payload, entry.kind)?;
        let mut bytes = Vec::new();
        buffer.read_to_end(&mut bytes)?;
        written.push(ArchiveEntry {
            name: entry.name.clone(),
            bytes,
        });
    }

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .last_modified_time(
            zip::DateTime::try_from(chrono::Local::now().naive_local()).unwrap_or_default(),
        );
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for entry in &written {
        writer.start_file(entry.name.as_str(), options)?;
        writer.write_all(&entry.bytes)?;
    }
    let mut archive = writer.finish()?;
    archive.set_position(0);

    tracing::debug!(entries = written.len(), size_bytes = archive.get_ref().len(), "Archive packaged");
    Ok((written, archive))
}

/// Combine engine-reported logs and collected diagnostics into one text payload.
fn conversion_log(logs: Option<&Value>, diagnostics: &Diagnostics) -> Option<Value> {
    let mut lines: Vec<Value> = match logs {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(s)) if !s.is_empty() => s.lines().map(|l| Value::String(l.into())).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other.clone()],
    };
    lines.extend(diagnostics.lines().iter().cloned().map(Value::String));
    (!lines.is_empty()).then_some(Value::Array(lines))
}

/// Entries for a to-standard success: instrument, form, optional
/// calculation set, optional conversion log.
pub fn to_standard_entries(
    outname: &str,
    serialization: Serialization,
    artifacts: &ConvertedArtifacts,
    diagnostics: &Diagnostics,
) -> Vec<PendingEntry> {
    let markup = PayloadKind::Markup(serialization);
    let mut entries = vec![PendingEntry::new(
        entry_name(outname, Role::Instrument, serialization),
        artifacts.instrument.clone(),
        markup,
    )];
    if let Some(form) = &artifacts.form {
        entries.push(PendingEntry::new(entry_name(outname, Role::Form, serialization), form.clone(), markup));
    }
    if let Some(calc) = &artifacts.calculationset {
        entries.push(PendingEntry::new(
            entry_name(outname, Role::CalculationSet, serialization),
            calc.clone(),
            markup,
        ));
    }
    if let Some(log) = conversion_log(artifacts.logs.as_ref(), diagnostics) {
        entries.push(PendingEntry::new(CONVERSION_LOG_NAME, log, PayloadKind::Text));
    }
    entries
}

/// Entries for a from-standard success: the single exported instrument file
/// plus an optional conversion log.
pub fn from_standard_entries(
    outname: &str,
    system: SystemId,
    artifacts: &ConvertedArtifacts,
    diagnostics: &Diagnostics,
) -> Vec<PendingEntry> {
    let kind = match &artifacts.instrument {
        Value::Array(_) => PayloadKind::Tabular,
        _ => PayloadKind::Text,
    };
    let mut entries = vec![PendingEntry::new(
        format!("{outname}.{}", system.export_extension()),
        artifacts.instrument.clone(),
        kind,
    )];
    if let Some(log) = conversion_log(artifacts.logs.as_ref(), diagnostics) {
        entries.push(PendingEntry::new(CONVERSION_LOG_NAME, log, PayloadKind::Text));
    }
    entries
}

/// Read an archive back into `(name, bytes)` pairs.
pub fn list_entries(archive: &[u8]) -> Result<Vec<ArchiveEntry>, PackagingError> {
    let mut reader = zip::ZipArchive::new(Cursor::new(archive))?;
    let mut out = Vec::with_capacity(reader.len());
    for index in 0..reader.len() {
        let mut entry = reader.by_index(index)?;
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        out.push(ArchiveEntry { name, bytes });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn full_artifacts() -> ConvertedArtifacts {
        ConvertedArtifacts {
            instrument: json!({"id": "urn:demo", "version": "1.0", "fields": [{"id": "q1"}]}),
            form: Some(json!({"instrument": {"id": "urn:demo"}, "pages": []})),
            calculationset: Some(json!({"calculations": [{"id": "total"}]})),
            logs: Some(json!(["Branching logic on q2 simplified"])),
        }
    }

    #[test]
    fn all_four_roles_produce_four_named_entries() {
        let entries = to_standard_entries("demo", Serialization::Yaml, &full_artifacts(), &Diagnostics::new());
        let (_, archive) = package(&entries).unwrap();
        let listed = list_entries(archive.get_ref()).unwrap();
        let mut names: Vec<&str> = listed.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["conversion_log.txt", "demo_c.yaml", "demo_f.yaml", "demo_i.yaml"]);
        assert!(listed.iter().all(|e| !e.bytes.is_empty()));
    }

    #[test]
    fn archive_is_a_deflated_zip_named_after_outname() {
        assert_eq!(archive_name("demo"), "demo.zip");
        let entries = to_standard_entries("demo", Serialization::Json, &full_artifacts(), &Diagnostics::new());
        let (written, archive) = package(&entries).unwrap();
        assert!(archive.get_ref().starts_with(b"PK\x03\x04"));

        let mut reader = zip::ZipArchive::new(Cursor::new(archive.get_ref().as_slice())).unwrap();
        let member = reader.by_name("demo_i.json").unwrap();
        assert_eq!(member.compression(), zip::CompressionMethod::Deflated);
        drop(member);
        let listed = list_entries(archive.get_ref()).unwrap();
        assert_eq!(listed, written);
    }

    #[test]
    fn absent_roles_are_omitted() {
        let artifacts = ConvertedArtifacts {
            calculationset: None,
            logs: None,
            ..full_artifacts()
        };
        let entries = to_standard_entries("out", Serialization::Json, &artifacts, &Diagnostics::new());
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["out_i.json", "out_f.json"]);
    }

    #[test]
    fn diagnostics_alone_create_conversion_log() {
        let artifacts = ConvertedArtifacts {
            logs: None,
            ..full_artifacts()
        };
        let mut diagnostics = Diagnostics::new();
        diagnostics.push("engine warning");
        let entries = to_standard_entries("out", Serialization::Json, &artifacts, &diagnostics);
        let log = entries.iter().find(|e| e.name == CONVERSION_LOG_NAME).unwrap();
        assert_eq!(log.payload, json!(["engine warning"]));
    }

    #[test]
    fn json_output_has_sorted_keys_and_four_space_indent() {
        let mut buf = write_payload(&json!({"b": 1, "a": {"z": 0, "y": 1}}), PayloadKind::Markup(Serialization::Json)).unwrap();
        let mut text = String::new();
        buf.read_to_string(&mut text).unwrap();
        assert_eq!(text, "{\n    \"a\": {\n        \"y\": 1,\n        \"z\": 0\n    },\n    \"b\": 1\n}\n");
    }

    #[test]
    fn yaml_output_has_sorted_keys() {
        let mut buf = write_payload(&json!({"title": "T", "id": "urn:x"}), PayloadKind::Markup(Serialization::Yaml)).unwrap();
        let mut text = String::new();
        buf.read_to_string(&mut text).unwrap();
        assert!(text.find("id:").unwrap() < text.find("title:").unwrap());
    }

    #[test]
    fn tabular_payload_writes_one_record_per_row() {
        let rows = json!([["Variable / Field Name", "Field Type"], ["q1", "text"], ["q2, with comma", null]]);
        let mut buf = write_payload(&rows, PayloadKind::Tabular).unwrap();
        let mut text = String::new();
        buf.read_to_string(&mut text).unwrap();
        assert_eq!(text, "Variable / Field Name,Field Type\nq1,text\n\"q2, with comma\",\n");
    }

    #[test]
    fn tabular_payload_must_be_a_list() {
        let err = write_payload(&json!({"not": "rows"}), PayloadKind::Tabular).unwrap_err();
        assert!(matches!(err, PackagingError::NotTabular(_)));
    }

    #[test]
    fn text_payload_is_verbatim() {
        let mut buf = write_payload(&json!("[[AdvancedFormat]]\n"), PayloadKind::Text).unwrap();
        let mut text = String::new();
        buf.read_to_string(&mut text).unwrap();
        assert_eq!(text, "[[AdvancedFormat]]\n");
    }

    #[test]
    fn buffers_are_rewound() {
        let buf = write_payload(&json!({"a": 1}), PayloadKind::Markup(Serialization::Yaml)).unwrap();
        assert_eq!(buf.position(), 0);
        let (_, archive) = package(&[PendingEntry::new("x.yaml", json!({"a": 1}), PayloadKind::Markup(Serialization::Yaml))]).unwrap();
        assert_eq!(archive.position(), 0);
    }

    #[test]
    fn from_standard_uses_system_extension() {
        let artifacts = ConvertedArtifacts {
            instrument: json!([["a"], ["b"]]),
            form: None,
            calculationset: None,
            logs: None,
        };
        let redcap = from_standard_entries("dict", SystemId::Redcap, &artifacts, &Diagnostics::new());
        assert_eq!(redcap[0].name, "dict.csv");
        assert_eq!(redcap[0].kind, PayloadKind::Tabular);

        let text = ConvertedArtifacts {
            instrument: json!("[[AdvancedFormat]]"),
            ..artifacts
        };
        let qualtrics = from_standard_entries("survey", SystemId::Qualtrics, &text, &Diagnostics::new());
        assert_eq!(qualtrics[0].name, "survey.txt");
        assert_eq!(qualtrics[0].kind, PayloadKind::Text);
        assert_eq!(qualtrics.len(), 1);
    }
}
