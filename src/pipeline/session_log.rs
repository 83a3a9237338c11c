//! Write-only audit trail, one directory per request.
//!
//! **Output structure**:
//! ```text
//! {log_root}/{session_id}/
//!   redcap_to_rios
//!   uploaded_file_contents.log
//!   conversion_params.log
//!   engine_diagnostics.log
//!   output.zip | failure.log | error.log | crash.log | validation.log | ...
//! ```
//!
//! Recording never fails the request: every I/O error is logged at warn
//! level and dropped.

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

// ──────────────────────────────────────────────
// Labels
// ──────────────────────────────────────────────

pub const UPLOAD_LABEL: &str = "uploaded_file_contents.log";
pub const PARAMS_LABEL: &str = "conversion_params.log";
pub const DIAGNOSTICS_LABEL: &str = "engine_diagnostics.log";
pub const OUTPUT_LABEL: &str = "output.zip";
pub const FAILURE_LABEL: &str = "failure.log";
pub const ERROR_LABEL: &str = "error.log";
pub const CRASH_LABEL: &str = "crash.log";
pub const VALIDATION_LABEL: &str = "validation.log";
pub const PARAMETERS_FAILURE_LABEL: &str = "parameters.log";
pub const UPLOAD_FAILURE_LABEL: &str = "upload.log";

// ──────────────────────────────────────────────
// Session identifiers
// ──────────────────────────────────────────────

/// Timestamp to the microsecond plus a per-process counter.
///
/// The counter keeps two sessions opened in the same microsecond apart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ──────────────────────────────────────────────
// Logger
// ──────────────────────────────────────────────

#[derive(Debug)]
pub struct SessionLog {
    root: PathBuf,
    counter: AtomicU64,
}

impl SessionLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a new session identifier. Nothing touches disk until the
    /// first [`record`](Self::record).
    pub fn open_session(&self) -> SessionId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%6f");
        SessionId(format!("{stamp}-{seq:06}"))
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Append `content` to the file `label` in the session directory.
    pub fn record(&self, id: &SessionId, label: &str, content: impl AsRef<[u8]>) {
        let dir = self.session_dir(id);
        if let Err(e) = append(&dir, label, content.as_ref()) {
            tracing::warn!(
                session = %id,
                label,
                path = %dir.display(),
                error = %e,
                "Session log: write failed"
            );
        }
    }

    /// Record a readable stream, leaving it rewound to offset 0.
    pub fn record_stream<S: Read + Seek>(&self, id: &SessionId, label: &str, stream: &mut S) {
        let mut bytes = Vec::new();
        let read = stream
            .seek(SeekFrom::Start(0))
            .and_then(|_| stream.read_to_end(&mut bytes));
        if let Err(e) = read {
            tracing::warn!(session = %id, label, error = %e, "Session log: stream unreadable");
        } else {
            self.record(id, label, &bytes);
        }
        if let Err(e) = stream.seek(SeekFrom::Start(0)) {
            tracing::warn!(session = %id, label, error = %e, "Session log: rewind failed");
        }
    }

    /// Record a serializable value as pretty JSON.
    pub fn record_json<T: serde::Serialize>(&self, id: &SessionId, label: &str, value: &T) {
        match serde_json::to_vec_pretty(value) {
            Ok(json) => self.record(id, label, json),
            Err(e) => tracing::warn!(session = %id, label, error = %e, "Session log: failed to serialize JSON"),
        }
    }
}

fn append(dir: &Path, label: &str, content: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(label))?;
    file.write_all(content)?;
    tracing::debug!(path = %dir.join(label).display(), size = content.len(), "Session log: written");
    Ok(())
}
