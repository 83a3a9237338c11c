//! Upload normalisation: turns whatever arrived for a form field into a
//! named, rewindable byte buffer.
//!
//! Every uploaded file crosses this boundary exactly once. Downstream stages
//! (content sniffing, structural validation, session logging, engine
//! dispatch) only ever see an [`Attachment`].

use std::fmt;
use std::io::{Cursor, Read, Seek, SeekFrom};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("Expected an uploaded file. Got: {0}")]
    Malformed(String),

    #[error("Expected a valid, uploaded file or no file. Got: {0}")]
    MalformedOptional(String),

    #[error("Could not read uploaded content: {0}")]
    Read(#[from] std::io::Error),
}

/// Raw value of one submitted form field, before validation.
pub enum RawField {
    /// A file part from a multipart body.
    File {
        file_name: Option<String>,
        content: Option<Vec<u8>>,
    },
    /// An in-memory `(name, stream)` pair, as handed over by non-HTTP callers.
    Pair {
        name: String,
        stream: Box<dyn Read + Send>,
    },
    /// A plain (non-file) form value.
    Value(String),
    /// The field was not submitted at all.
    Absent,
}

impl RawField {
    pub fn file(file_name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::File {
            file_name: Some(file_name.into()),
            content: Some(content.into()),
        }
    }

    pub fn pair(name: impl Into<String>, stream: impl Read + Send + 'static) -> Self {
        Self::Pair {
            name: name.into(),
            stream: Box::new(stream),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Self::Absent => true,
            Self::Value(v) => v.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Debug for RawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { file_name, content } => f
                .debug_struct("File")
                .field("file_name", file_name)
                .field("content_len", &content.as_ref().map(Vec::len))
                .finish(),
            Self::Pair { name, .. } => f.debug_tuple("Pair").field(name).field(&"<stream>").finish(),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Absent => f.write_str("Absent"),
        }
    }
}

/// An uploaded file: its client-supplied name and its content.
#[derive(Debug, Clone)]
pub struct Attachment {
    name: String,
    content: Cursor<Vec<u8>>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: Cursor::new(bytes.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content stream, always positioned at offset 0 on return.
    pub fn content(&mut self) -> &mut Cursor<Vec<u8>> {
        self.content.set_position(0);
        &mut self.content
    }

    /// Whole content without moving the stream.
    pub fn bytes(&self) -> &[u8] {
        self.content.get_ref()
    }

    pub fn len(&self) -> usize {
        self.content.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rewind(&mut self) -> std::io::Result<()> {
        self.content.seek(SeekFrom::Start(0)).map(|_| ())
    }

    pub fn position(&self) -> u64 {
        self.content.position()
    }
}

/// Accept a field that must carry a file.
pub fn extract(raw: RawField) -> Result<Attachment, AttachmentError> {
    match raw {
        RawField::File {
            file_name: Some(name),
            content: Some(bytes),
        } if !name.trim().is_empty() => Ok(Attachment::new(name, bytes)),
        RawField::Pair { name, mut stream } if !name.trim().is_empty() => {
            // The source may not be seekable; buffer it once.
            let mut buffer = Vec::new();
            stream.read_to_end(&mut buffer)?;
            Ok(Attachment::new(name, buffer))
        }
        other => Err(AttachmentError::Malformed(format!("{other:?}"))),
    }
}

/// Accept a field that may be left empty, e.g. a companion file.
pub fn extract_optional(raw: RawField) -> Result<Option<Attachment>, AttachmentError> {
    if raw.is_blank() {
        return Ok(None);
    }
    match extract(raw) {
        Ok(attachment) => Ok(Some(attachment)),
        Err(AttachmentError::Malformed(detail)) => Err(AttachmentError::MalformedOptional(detail)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that cannot seek, to prove pairs get buffered.
    struct OneShot(Option<Vec<u8>>);

    impl Read for OneShot {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.take() {
                Some(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn multipart_file_becomes_attachment() {
        let mut att = extract(RawField::file("dict.csv", b"a,b\n".to_vec())).unwrap();
        assert_eq!(att.name(), "dict.csv");
        assert_eq!(att.len(), 4);
        let mut out = String::new();
        att.content().read_to_string(&mut out).unwrap();
        assert_eq!(out, "a,b\n");
    }

    #[test]
    fn pair_stream_is_buffered_and_rewindable() {
        let mut att = extract(RawField::pair("survey.qsf", OneShot(Some(b"{}".to_vec())))).unwrap();
        let mut first = Vec::new();
        att.content().read_to_end(&mut first).unwrap();
        let mut second = Vec::new();
        att.content().read_to_end(&mut second).unwrap();
        assert_eq!(first, b"{}");
        assert_eq!(first, second);
    }

    #[test]
    fn content_is_rewound_before_handoff() {
        let mut att = Attachment::new("x.csv", b"abc".to_vec());
        let mut sink = Vec::new();
        att.content().read_to_end(&mut sink).unwrap();
        assert_eq!(att.position(), 3);
        att.rewind().unwrap();
        assert_eq!(att.position(), 0);
    }

    #[test]
    fn plain_value_is_malformed_and_quoted() {
        let err = extract(RawField::Value("not a file".into())).unwrap_err();
        match err {
            AttachmentError::Malformed(detail) => assert!(detail.contains("not a file")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_filename_is_malformed() {
        let raw = RawField::File {
            file_name: None,
            content: Some(b"data".to_vec()),
        };
        assert!(matches!(extract(raw), Err(AttachmentError::Malformed(_))));

        let blank = RawField::file("   ", b"data".to_vec());
        assert!(matches!(extract(blank), Err(AttachmentError::Malformed(_))));
    }

    #[test]
    fn absent_field_is_malformed_for_required() {
        assert!(matches!(extract(RawField::Absent), Err(AttachmentError::Malformed(_))));
    }

    #[test]
    fn optional_accepts_absent_and_empty() {
        assert!(extract_optional(RawField::Absent).unwrap().is_none());
        assert!(extract_optional(RawField::Value(String::new())).unwrap().is_none());
        let att = extract_optional(RawField::file("c.yaml", b"x: 1".to_vec())).unwrap();
        assert_eq!(att.unwrap().name(), "c.yaml");
    }

    #[test]
    fn optional_still_rejects_garbage() {
        let err = extract_optional(RawField::Value("oops".into())).unwrap_err();
        assert!(matches!(err, AttachmentError::MalformedOptional(d) if d.contains("oops")));
    }
}
