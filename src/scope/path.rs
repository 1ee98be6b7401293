//! Scope path parsing, normalization, and storage encoding

use crate::error::{EngineError, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Byte written after every segment in the storage encoding.
const SEGMENT_TERMINATOR: u8 = 0x00;

/// Leading byte of every encoded path (the root encodes to this byte alone).
const ROOT_MARKER: u8 = b'/';

/// Stable address of a unit of mounted work
///
/// Identity is segment-sequence equality. The textual form is `/a/b`; the
/// root has no segments and renders as `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopePath {
    segments: Vec<String>,
}

/// Normalize a single segment for deterministic identity
///
/// Applies Unicode NFC and rejects empty segments and the reserved `/` and
/// NUL characters.
pub fn normalize_segment(segment: &str) -> Result<String, EngineError> {
    let normalized: String = segment.nfc().collect();
    if normalized.is_empty() {
        return Err(EngineError::InvalidPath("empty path segment".to_string()));
    }
    if normalized.contains('/') || normalized.contains('\0') {
        return Err(EngineError::InvalidPath(format!(
            "segment {:?} contains a reserved character",
            segment
        )));
    }
    Ok(normalized)
}

impl ScopePath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parse `/a/b`, `a/b`, or `/`. Repeated and trailing slashes are ignored.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let mut segments = Vec::new();
        for raw in text.split('/') {
            if raw.is_empty() {
                continue;
            }
            segments.push(normalize_segment(raw)?);
        }
        Ok(Self { segments })
    }

    pub fn from_segments<I, S>(segments: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments = segments
            .into_iter()
            .map(|s| normalize_segment(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    pub fn child(&self, segment: &str) -> Result<Self, EngineError> {
        let mut segments = self.segments.clone();
        segments.push(normalize_segment(segment)?);
        Ok(Self { segments })
    }

    /// Append every segment of `relative` to this path.
    pub fn join(&self, relative: &ScopePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(relative.segments.iter().cloned());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &ScopePath) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Proper ancestors, nearest first, ending at the root.
    pub fn ancestors(&self) -> impl Iterator<Item = ScopePath> + '_ {
        (0..self.segments.len()).rev().map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// Storage key form: `/` then each segment followed by NUL
    ///
    /// The encoding of a path is a byte prefix of the encoding of every
    /// descendant, so a prefix scan visits exactly the subtree.
    pub fn encode(&self) -> Vec<u8> {
        let len = 1 + self.segments.iter().map(|s| s.len() + 1).sum::<usize>();
        let mut out = Vec::with_capacity(len);
        out.push(ROOT_MARKER);
        for segment in &self.segments {
            out.extend_from_slice(segment.as_bytes());
            out.push(SEGMENT_TERMINATOR);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let Some((&marker, rest)) = bytes.split_first() else {
            return Err(StorageError::InvalidKey("empty scope key".to_string()));
        };
        if marker != ROOT_MARKER {
            return Err(StorageError::InvalidKey(format!(
                "scope key starts with {:#04x}",
                marker
            )));
        }
        let mut segments = Vec::new();
        for chunk in rest.split_inclusive(|b| *b == SEGMENT_TERMINATOR) {
            let Some((&SEGMENT_TERMINATOR, body)) = chunk.split_last() else {
                return Err(StorageError::InvalidKey(
                    "unterminated scope key segment".to_string(),
                ));
            };
            let segment = std::str::from_utf8(body)
                .map_err(|e| StorageError::InvalidKey(format!("non-UTF-8 segment: {}", e)))?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ScopePath {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ScopePath::parse(&value)
    }
}

impl From<ScopePath> for String {
    fn from(path: ScopePath) -> Self {
        path.to_string()
    }
}

impl std::str::FromStr for ScopePath {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScopePath::parse(s)
    }
}
