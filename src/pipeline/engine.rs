//! External converter process adapter.
//!
//! The request is written to the child's stdin as JSON, the result mapping is
//! read back from stdout, and every stderr line lands in the caller's
//! [`Diagnostics`]. Nothing is redirected process-wide.

use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::Value;
use thiserror::Error;

use super::dispatch::{ConversionEngine, ConversionRequest, Diagnostics, EngineError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),

    #[error("trailing backslash")]
    TrailingBackslash,
}

/// Split a command line into words, shell style.
///
/// Whitespace separates words. `'...'` is taken literally; inside `"..."` a
/// backslash escapes `"` and `\`; outside quotes a backslash escapes the
/// next character. No variable or glob expansion happens.
pub fn split_command_line(line: &str) -> Result<Vec<String>, CommandLineError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(CommandLineError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(CommandLineError::UnterminatedQuote('"')),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(CommandLineError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next().ok_or(CommandLineError::TrailingBackslash)?);
            }
            ch if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            ch => {
                in_word = true;
                current.push(ch);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a command line (see [`split_command_line`]). `None` if blank.
    pub fn from_command_line(line: &str) -> Result<Option<Self>, CommandLineError> {
        let mut parts = split_command_line(line)?.into_iter();
        Ok(parts.next().map(|program| Self::new(program, parts.collect())))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ConversionEngine for CommandEngine {
    fn convert(
        &self,
        request: &ConversionRequest,
        diagnostics: &mut Diagnostics,
    ) -> Result<Value, EngineError> {
        let payload = serde_json::to_vec(request)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.program)))?;

        // Feed stdin from a separate thread so a chatty child cannot fill its
        // stdout pipe while we are still writing.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Unavailable("child stdin not captured".into()))?;
        let writer = std::thread::spawn(move || stdin.write_all(&payload));

        let output = child.wait_with_output()?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!(program = %self.program, "Engine closed stdin early");
            }
            Ok(Err(e)) => return Err(EngineError::Io(e)),
            Err(_) => return Err(EngineError::Unavailable("stdin writer panicked".into())),
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            diagnostics.push(line);
        }

        if !output.status.success() {
            return Err(EngineError::Exited {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}
