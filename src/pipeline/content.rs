//! Content checks that run before any conversion is attempted.
//!
//! - Tabular uploads: sniff the header dialect, then run structural validation
//!   for dialects that have a [`HeaderSpec`].
//! - Markup uploads: must at least parse.
//! - Standard documents (reverse direction): must parse in the declared
//!   serialization and be a mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::csv_validation::{self, CsvValidationError, ValidationResult, REDCAP_MODERN};
use super::dispatch::Serialization;

pub const MODERN_FIRST_HEADER: &str = "Variable / Field Name";
pub const LEGACY_FIRST_HEADER: &str = "fieldID";

/// Header dialect of a REDCap data dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvDialect {
    Modern,
    Legacy,
}

/// Decide which dialect a data dictionary is written in.
///
/// Returns the validation log lines on failure so callers can surface them
/// verbatim.
pub fn sniff_dialect(content: &[u8]) -> Result<CsvDialect, Vec<String>> {
    let unparseable = |detail: String| {
        vec![
            "Unable to parse REDCap data dictionary. Got error:".to_string(),
            format!("  {detail}"),
        ]
    };

    let text = csv_validation::decode(content).map_err(|e| unparseable(e.to_string()))?;
    let text = csv_validation::normalize_line_endings(text);
    let mut rdr = csv_validation::reader(&text);
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| unparseable(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    match headers.first().map(String::as_str) {
        Some(MODERN_FIRST_HEADER) => Ok(CsvDialect::Modern),
        Some(LEGACY_FIRST_HEADER) => Ok(CsvDialect::Legacy),
        _ => Err(vec![
            "Unknown input CSV header format. Got values:".to_string(),
            format!("  {}", headers.join(", ")),
            "Expected first header/field name value to be:".to_string(),
            format!("  \"{MODERN_FIRST_HEADER}\" or \"{LEGACY_FIRST_HEADER}\""),
        ]),
    }
}

/// Sniff and structurally validate a data dictionary upload.
pub fn validate_data_dictionary(content: &[u8]) -> Result<ValidationResult, CsvValidationError> {
    let dialect = match sniff_dialect(content) {
        Ok(d) => d,
        Err(log) => return Ok(ValidationResult { passed: false, log }),
    };

    match dialect {
        CsvDialect::Modern => csv_validation::validate(content, &REDCAP_MODERN),
        CsvDialect::Legacy => {
            tracing::info!("Legacy data dictionary accepted without column checks");
            Ok(ValidationResult {
                passed: true,
                log: vec![
                    "Legacy header format detected; column value checks are not applied".to_string(),
                    csv_validation::SUCCESS_LINE.to_string(),
                ],
            })
        }
    }
}

/// Check that a survey export is well-formed JSON.
pub fn validate_survey_export(content: &[u8]) -> ValidationResult {
    match serde_json::from_slice::<Value>(content) {
        Ok(_) => ValidationResult {
            passed: true,
            log: vec![csv_validation::SUCCESS_LINE.to_string()],
        },
        Err(e) => ValidationResult {
            passed: false,
            log: vec![
                "Qualtrics file validation failed:".to_string(),
                "  The file content is not valid JSON text".to_string(),
                format!("Error: {e}"),
                "Please try again with a valid QSF file".to_string(),
            ],
        },
    }
}

/// Parse one standard document (instrument, form or calculation set).
///
/// `role` names the document in the error, e.g. `"Instrument"`.
pub fn load_standard_document(
    content: &[u8],
    serialization: Serialization,
    role: &str,
) -> Result<Value, String> {
    let parsed: Result<Value, String> = match serialization {
        Serialization::Json => serde_json::from_slice(content).map_err(|e| e.to_string()),
        Serialization::Yaml => serde_yaml::from_slice(content).map_err(|e| e.to_string()),
    };
    match parsed {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(format!("{role} file validation error: expected a mapping at the top level")),
        Err(e) => Err(format!("{role} file validation error: {e}")),
    }
}

/// Check that a form or calculation set points at the uploaded instrument.
///
/// The reference's `id` must equal the instrument's; `version` is compared
/// only when both sides carry one.
pub fn check_instrument_reference(document: &Value, instrument: &Value, role: &str) -> Result<(), String> {
    let Some(expected) = instrument.get("id").and_then(Value::as_str) else {
        return Ok(());
    };
    let reference = document.get("instrument");
    match reference.and_then(|r| r.get("id")).and_then(Value::as_str) {
        Some(found) if found == expected => {}
        Some(found) => {
            return Err(format!(
                "{role} file validation error: references instrument {found:?}, but the instrument file is {expected:?}"
            ))
        }
        None => {
            return Err(format!(
                "{role} file validation error: no instrument reference (expected {expected:?})"
            ))
        }
    }
    fn version(doc: Option<&Value>) -> Option<&Value> {
        doc.and_then(|d| d.get("version")).filter(|v| !v.is_null())
    }
    match (version(Some(instrument)), version(reference)) {
        (Some(want), Some(got)) if want != got => Err(format!(
            "{role} file validation error: references instrument version {got}, but the instrument file is version {want}"
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_header_detected() {
        let csv = b"Variable / Field Name,Form Name\nq1,f\n";
        assert_eq!(sniff_dialect(csv).unwrap(), CsvDialect::Modern);
    }

    #[test]
    fn legacy_header_detected() {
        assert_eq!(sniff_dialect(b"fieldID,formName\n").unwrap(), CsvDialect::Legacy);
    }

    #[test]
    fn unknown_header_lists_values_seen() {
        let log = sniff_dialect(b"name,type\n").unwrap_err();
        assert!(log[1].contains("name, type"));
        assert!(log.iter().any(|l| l.contains("fieldID")));
    }

    #[test]
    fn binary_dictionary_cannot_be_parsed() {
        let log = sniff_dialect(&[0xff, 0x00, 0xfe]).unwrap_err();
        assert!(log[0].starts_with("Unable to parse"));
    }

    #[test]
    fn legacy_dictionary_passes() {
        let result = validate_data_dictionary(b"fieldID,anything\nx,y\n").unwrap();
        assert!(result.passed);
    }

    #[test]
    fn bad_dialect_fails_validation() {
        let result = validate_data_dictionary(b"foo,bar\n1,2\n").unwrap();
        assert!(!result.passed);
        assert!(!result.log.is_empty());
    }

    #[test]
    fn survey_export_must_be_json() {
        assert!(validate_survey_export(br#"{"SurveyEntry": {}}"#).passed);
        let bad = validate_survey_export(b"<xml/>");
        assert!(!bad.passed);
        assert!(bad.log.iter().any(|l| l.contains("valid QSF")));
    }

    #[test]
    fn standard_document_parses_yaml_and_json() {
        let yaml = load_standard_document(b"id: urn:x\nversion: '1.0'\n", Serialization::Yaml, "Instrument").unwrap();
        assert_eq!(yaml["id"], "urn:x");
        let json = load_standard_document(br#"{"id":"urn:x"}"#, Serialization::Json, "Form").unwrap();
        assert_eq!(json["id"], "urn:x");
    }

    #[test]
    fn instrument_reference_must_match() {
        let instrument = serde_json::json!({"id": "urn:demo", "version": "1.0"});
        let form = serde_json::json!({"instrument": {"id": "urn:demo", "version": "1.0"}});
        assert!(check_instrument_reference(&form, &instrument, "Form").is_ok());

        let unversioned = serde_json::json!({"instrument": {"id": "urn:demo"}});
        assert!(check_instrument_reference(&unversioned, &instrument, "Form").is_ok());

        let other = serde_json::json!({"instrument": {"id": "urn:other", "version": "1.0"}});
        let err = check_instrument_reference(&other, &instrument, "Form").unwrap_err();
        assert!(err.starts_with("Form file validation error"));
        assert!(err.contains("urn:other"));

        let stale = serde_json::json!({"instrument": {"id": "urn:demo", "version": "0.9"}});
        let err = check_instrument_reference(&stale, &instrument, "Calculationset").unwrap_err();
        assert!(err.starts_with("Calculationset file validation error"));
        assert!(err.contains("0.9"));

        let detached = serde_json::json!({"calculations": []});
        assert!(check_instrument_reference(&detached, &instrument, "Calculationset").is_err());
    }

    #[test]
    fn standard_document_errors_name_the_role() {
        let err = load_standard_document(b"- a\n- b\n", Serialization::Yaml, "Form").unwrap_err();
        assert!(err.starts_with("Form file validation error"));
        let err = load_standard_document(b"{", Serialization::Json, "Calculationset").unwrap_err();
        assert!(err.starts_with("Calculationset file validation error"));
    }
}
