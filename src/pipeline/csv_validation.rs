//! Structural validation of tabular data dictionaries.
//!
//! Checks run in a fixed order against a [`HeaderSpec`]:
//! 1. a header row exists (short-circuits on failure)
//! 2. required columns are present
//! 3. no header name repeats
//! 4. no header falls outside the header spec
//! 5. expected columns that are absent are noted (diagnostic only)
//! 6. every cell of a constrained column is in its vocabulary, and no row
//!    carries more cells than there are headers
//!
//! Validation is a pure function of its input: each call builds its own
//! accumulator, so running it twice on the same bytes yields identical logs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use serde::Serialize;
use thiserror::Error;

/// Distinct invalid values shown per column before the rest are suppressed.
pub const DISPLAY_LIMIT: usize = 30;

pub const SUCCESS_LINE: &str = "Successful validation!";

#[derive(Error, Debug)]
pub enum CsvValidationError {
    #[error("Content is not valid UTF-8 text: {0}")]
    NotText(#[from] std::str::Utf8Error),

    #[error("Content could not be parsed as CSV: {0}")]
    Parse(#[from] csv::Error),
}

/// Column contract for one tabular dialect.
#[derive(Debug, Clone, Default)]
pub struct HeaderSpec {
    pub required: BTreeSet<String>,
    pub optional: BTreeSet<String>,
    pub constrained_values: BTreeMap<String, BTreeSet<String>>,
}

impl HeaderSpec {
    pub fn new<R, O>(required: R, optional: O) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            optional: optional.into_iter().map(Into::into).collect(),
            constrained_values: BTreeMap::new(),
        }
    }

    pub fn constrain<V>(mut self, column: impl Into<String>, allowed: V) -> Self
    where
        V: IntoIterator,
        V::Item: Into<String>,
    {
        self.constrained_values
            .insert(column.into(), allowed.into_iter().map(Into::into).collect());
        self
    }

    /// Every column the header spec knows about.
    pub fn known(&self) -> BTreeSet<&str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Modern REDCap data dictionary columns.
pub static REDCAP_MODERN: LazyLock<HeaderSpec> = LazyLock::new(|| {
    HeaderSpec::new(
        [
            "Variable / Field Name",
            "Form Name",
            "Field Type",
            "Field Label",
            "Choices, Calculations, OR Slider Labels",
        ],
        [
            "Section Header",
            "Field Note",
            "Text Validation Type OR Show Slider Number",
            "Text Validation Min",
            "Text Validation Max",
            "Identifier?",
            "Branching Logic (Show field only if...)",
            "Required Field?",
            "Custom Alignment",
            "Question Number (surveys only)",
        ],
    )
    .constrain(
        "Field Type",
        [
            "text",
            "notes",
            "dropdown",
            "radio",
            "checkbox",
            "calc",
            "slider",
            "truefalse",
            "yesno",
        ],
    )
});

/// Outcome of one validation run. `passed == false` always comes with a
/// non-empty log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub log: Vec<String>,
}

impl ValidationResult {
    pub fn log_text(&self) -> String {
        self.log.join("\n")
    }
}

/// One cell that fell outside its column's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFailure {
    pub column: String,
    /// 1-based line in the (normalised) file; the header is line 1.
    pub line: u64,
    pub value: String,
}

/// Per-call accumulator. Never outlives a single `validate` call.
#[derive(Default)]
struct Run {
    log: Vec<String>,
    failed: bool,
}

impl Run {
    fn note(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    fn fail(&mut self, line: impl Into<String>) {
        self.failed = true;
        self.note(line);
    }

    fn finish(mut self) -> ValidationResult {
        if !self.failed {
            self.note(SUCCESS_LINE);
        }
        ValidationResult {
            passed: !self.failed,
            log: self.log,
        }
    }
}

/// Collapse `\r\n` and lone `\r` to `\n` so each record ends exactly once.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Decode raw upload bytes as UTF-8, dropping a leading byte-order mark.
pub fn decode(content: &[u8]) -> Result<&str, CsvValidationError> {
    let text = std::str::from_utf8(content)?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

pub(crate) fn reader(text: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

/// Validate `content` against `spec`.
///
/// Only undecodable input is an error; every structural problem is reported
/// inside the returned [`ValidationResult`].
pub fn validate(content: &[u8], spec: &HeaderSpec) -> Result<ValidationResult, CsvValidationError> {
    let text = normalize_line_endings(decode(content)?);
    let mut rdr = reader(&text);
    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();

    let mut run = Run::default();

    if headers.iter().all(|h| h.is_empty()) {
        run.fail("Source CSV has no field names or is empty");
        return Ok(run.finish());
    }

    let seen: BTreeSet<&str> = headers.iter().map(String::as_str).collect();
    let known = spec.known();

    let missing: Vec<&str> = spec
        .required
        .iter()
        .map(String::as_str)
        .filter(|h| !seen.contains(h))
        .collect();
    if !missing.is_empty() {
        run.fail("Missing required headers:");
        for header in &missing {
            run.fail(format!("  \"{header}\""));
        }
    }

    let duplicates = duplicate_indices(&headers);
    if !duplicates.is_empty() {
        run.fail("Found duplicate column headers:");
        for (header, idxs) in &duplicates {
            let locations = idxs.iter().map(usize::to_string).collect::<Vec<_>>().join(", ");
            run.fail(format!("  Header: {header}, columns: {locations}"));
        }
    }

    let unknown: Vec<&str> = seen.difference(&known).copied().collect();
    if !unknown.is_empty() {
        run.fail("Unrecognized column headers:");
        for header in &unknown {
            run.fail(format!("  '{header}'"));
        }
    }

    let unsupported: Vec<&str> = known.difference(&seen).copied().collect();
    if !unsupported.is_empty() {
        run.note("Missing expected column fields:");
        for header in &unsupported {
            run.note(format!("  '{header}'"));
        }
    }

    let constrained: Vec<(usize, &str, &BTreeSet<String>)> = headers
        .iter()
        .enumerate()
        .filter_map(|(idx, h)| spec.constrained_values.get(h).map(|allowed| (idx, h.as_str(), allowed)))
        .collect();

    let mut failures: Vec<CellFailure> = Vec::new();
    let mut ragged: Vec<u64> = Vec::new();

    for record in rdr.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        if record.len() > headers.len() {
            ragged.push(line);
        }
        for &(idx, column, allowed) in &constrained {
            let value = record.get(idx).unwrap_or_default();
            if !allowed.contains(value) {
                failures.push(CellFailure {
                    column: column.to_string(),
                    line,
                    value: value.to_string(),
                });
            }
        }
    }

    if !ragged.is_empty() {
        let lines = ragged.iter().map(u64::to_string).collect::<Vec<_>>().join(", ");
        run.fail(format!(
            "Found a ragged row (a column without a header). Check for too many fields defined on line(s): {lines}"
        ));
    }

    if !failures.is_empty() {
        run.fail("Validation failures:");
        log_failure_summary(&mut run, &constrained, &failures);
        run.fail("Detail error log:");
        for f in &failures {
            run.fail(format!(
                "  Line {}: column \"{}\" has invalid value '{}'",
                f.line, f.column, f.value
            ));
        }
    }

    Ok(run.finish())
}

/// Header names that occur more than once, with every 0-based index at
/// which they occur.
pub fn duplicate_indices(headers: &[String]) -> BTreeMap<String, Vec<usize>> {
    let mut positions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, header) in headers.iter().enumerate() {
        positions.entry(header.clone()).or_default().push(idx);
    }
    positions.retain(|_, idxs| idxs.len() > 1);
    positions
}

fn log_failure_summary(
    run: &mut Run,
    constrained: &[(usize, &str, &BTreeSet<String>)],
    failures: &[CellFailure],
) {
    let columns: BTreeSet<&str> = constrained.iter().map(|(_, c, _)| *c).collect();
    for column in columns {
        let in_column: Vec<&CellFailure> = failures.iter().filter(|f| f.column == column).collect();
        if in_column.is_empty() {
            continue;
        }
        run.fail(format!(
            "  Value check failed {} time(s) on field: '{column}'",
            in_column.len()
        ));
        let mut distinct: Vec<&str> = Vec::new();
        for f in &in_column {
            if !distinct.contains(&f.value.as_str()) {
                distinct.push(&f.value);
            }
        }
        let shown = distinct
            .iter()
            .take(DISPLAY_LIMIT)
            .map(|v| format!("'{v}'"))
            .collect::<Vec<_>>()
            .join(", ");
        run.fail(format!("    Invalid fields: [{shown}]"));
        if distinct.len() > DISPLAY_LIMIT {
            run.fail(format!("    ({} more suppressed)", distinct.len() - DISPLAY_LIMIT));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Variable / Field Name,Form Name,Field Type,Field Label,\"Choices, Calculations, OR Slider Labels\"";

    fn check(csv: &str) -> ValidationResult {
        validate(csv.as_bytes(), &REDCAP_MODERN).unwrap()
    }

    #[test]
    fn minimal_dictionary_passes() {
        let result = check(&format!("{HEADER}\nq1,form1,text,Q1,n/a\n"));
        assert!(result.passed, "log: {:?}", result.log);
        assert_eq!(result.log.last().unwrap(), SUCCESS_LINE);
    }

    #[test]
    fn unknown_field_type_names_value_and_line() {
        let result = check(&format!("{HEADER}\nq1,form1,text,Q1,n/a\nq2,form1,essay,Q2,n/a\n"));
        assert!(!result.passed);
        let text = result.log_text();
        assert!(text.contains("essay"));
        assert!(text.contains("Line 3"), "log: {text}");
        assert!(!text.contains(SUCCESS_LINE));
    }

    #[test]
    fn missing_form_name_is_reported() {
        let csv = "Variable / Field Name,Field Type,Field Label,\"Choices, Calculations, OR Slider Labels\"\nq1,text,Q1,n/a\n";
        let result = check(csv);
        assert!(!result.passed);
        assert!(result.log.iter().any(|l| l.contains("\"Form Name\"")));
    }

    #[test]
    fn missing_headers_are_sorted() {
        let result = check("Field Label\nx\n");
        let missing: Vec<&String> = result
            .log
            .iter()
            .skip_while(|l| !l.starts_with("Missing required headers"))
            .skip(1)
            .take_while(|l| l.starts_with("  \""))
            .collect();
        let mut sorted = missing.clone();
        sorted.sort();
        assert_eq!(missing, sorted);
        assert_eq!(missing.len(), 4);
    }

    #[test]
    fn empty_input_short_circuits() {
        let result = check("");
        assert!(!result.passed);
        assert_eq!(result.log, vec!["Source CSV has no field names or is empty".to_string()]);
    }

    #[test]
    fn duplicate_headers_report_every_index() {
        let csv = format!("{HEADER},Field Note,Field Note,Field Note\nq1,f,text,Q,n/a,a,b,c\n");
        let result = check(&csv);
        assert!(!result.passed);
        assert!(result
            .log
            .iter()
            .any(|l| l == "  Header: Field Note, columns: 5, 6, 7"));
    }

    #[test]
    fn duplicate_indices_are_sorted_and_zero_based() {
        let headers: Vec<String> = ["a", "b", "a", "c", "a", "b"].iter().map(|s| s.to_string()).collect();
        let dups = duplicate_indices(&headers);
        assert_eq!(dups["a"], vec![0, 2, 4]);
        assert_eq!(dups["b"], vec![1, 5]);
        assert!(!dups.contains_key("c"));
    }

    #[test]
    fn unknown_header_fails() {
        let result = check(&format!("{HEADER},Favourite Colour\nq1,f,text,Q,n/a,blue\n"));
        assert!(!result.passed);
        assert!(result.log.iter().any(|l| l.contains("'Favourite Colour'")));
    }

    #[test]
    fn absent_optional_columns_are_diagnostic_only() {
        let result = check(&format!("{HEADER}\nq1,f,text,Q,n/a\n"));
        assert!(result.passed);
        assert!(result.log.iter().any(|l| l == "Missing expected column fields:"));
        assert!(result.log.iter().any(|l| l == "  'Field Note'"));
    }

    #[test]
    fn one_failure_per_offending_cell() {
        let rows = "q1,f,essay,Q,n/a\nq2,f,essay,Q,n/a\nq3,f,text,Q,n/a\nq4,f,memo,Q,n/a\n";
        let result = check(&format!("{HEADER}\n{rows}"));
        let details: Vec<&String> = result.log.iter().filter(|l| l.starts_with("  Line ")).collect();
        assert_eq!(details.len(), 3);
        assert!(details[0].contains("Line 2") && details[0].contains("essay"));
        assert!(details[1].contains("Line 3"));
        assert!(details[2].contains("Line 5") && details[2].contains("memo"));
        assert!(result
            .log
            .iter()
            .any(|l| l == "  Value check failed 3 time(s) on field: 'Field Type'"));
    }

    #[test]
    fn ragged_row_reported_once_per_row() {
        let rows = "q1,f,text,Q,n/a,extra,more\nq2,f,text,Q,n/a\n";
        let result = check(&format!("{HEADER}\n{rows}"));
        assert!(!result.passed);
        let ragged: Vec<&String> = result.log.iter().filter(|l| l.contains("ragged row")).collect();
        assert_eq!(ragged.len(), 1);
        assert!(ragged[0].ends_with("line(s): 2"));
    }

    #[test]
    fn cell_failures_run_row_then_column() {
        let spec = HeaderSpec::new(["a", "b", "c"], Vec::<String>::new())
            .constrain("c", ["x"])
            .constrain("a", ["x"]);
        let csv = "a,b,c\nbad1,_,bad2\nx,_,bad3\nbad4,_,x\n";
        let result = validate(csv.as_bytes(), &spec).unwrap();
        assert!(!result.passed);

        let start = result.log.iter().position(|l| l == "Detail error log:").unwrap();
        let details: Vec<&str> = result.log[start + 1..].iter().map(String::as_str).collect();
        assert_eq!(
            details,
            [
                "  Line 2: column \"a\" has invalid value 'bad1'",
                "  Line 2: column \"c\" has invalid value 'bad2'",
                "  Line 3: column \"c\" has invalid value 'bad3'",
                "  Line 4: column \"a\" has invalid value 'bad4'",
            ]
        );
    }

    #[test]
    fn line_endings_do_not_double_count_rows() {
        let crlf = format!("{HEADER}\r\nq1,f,essay,Q,n/a\r\nq2,f,text,Q,n/a\r\n");
        let cr = format!("{HEADER}\rq1,f,essay,Q,n/a\rq2,f,text,Q,n/a\r");
        let lf = format!("{HEADER}\nq1,f,essay,Q,n/a\nq2,f,text,Q,n/a\n");
        let a = check(&crlf);
        let b = check(&cr);
        let c = check(&lf);
        assert_eq!(a, c);
        assert_eq!(b, c);
    }

    #[test]
    fn validation_is_repeatable() {
        let csv = format!("{HEADER},Bogus\nq1,f,essay,Q,n/a,x\n");
        let first = check(&csv);
        let second = check(&csv);
        assert_eq!(first, second);
    }

    #[test]
    fn suppression_kicks_in_past_display_limit() {
        let mut csv = format!("{HEADER}\n");
        for i in 0..(DISPLAY_LIMIT + 5) {
            csv.push_str(&format!("q{i},f,bad{i},Q,n/a\n"));
        }
        let result = check(&csv);
        assert!(result.log.iter().any(|l| l == "    (5 more suppressed)"));
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let csv = format!("\u{feff}{HEADER}\nq1,form1,text,Q1,n/a\n");
        assert!(check(&csv).passed);
    }

    #[test]
    fn non_utf8_is_malformed_input() {
        let err = validate(&[0xff, 0xfe, 0x00, 0x41], &REDCAP_MODERN).unwrap_err();
        assert!(matches!(err, CsvValidationError::NotText(_)));
    }

    #[test]
    fn failed_results_always_carry_a_log() {
        for csv in ["", "x\n1\n", "Field Type\nessay\n"] {
            let result = check(csv);
            assert!(!result.passed);
            assert!(!result.log.is_empty());
        }
    }
}
