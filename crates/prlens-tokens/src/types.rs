use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Annotation severity. Only these three spellings are recognized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational note.
    Info,
    /// Something the author should look at.
    Warning,
    /// Likely bug or security problem.
    Critical,
}

impl Severity {
    /// Directive spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity string outside `info | warning | critical`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownSeverity(pub String);

impl fmt::Display for UnknownSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown severity: {}", self.0)
    }
}

impl std::error::Error for UnknownSeverity {}

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownSeverity(other.to_string())),
        }
    }
}

/// An inline review comment anchored to a file line.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Annotation {
    /// Content hash of `(file, line, severity, message)`.
    pub id: String,
    /// Repository-relative path.
    pub file: String,
    /// 1-based line. For ranges, the first line.
    pub line: u32,
    /// Severity.
    pub severity: Severity,
    /// Trimmed message body.
    pub message: String,
}

impl Annotation {
    /// Build an annotation, deriving its id from the content.
    pub fn new(file: impl Into<String>, line: u32, severity: Severity, message: &str) -> Self {
        let file = file.into();
        let message = message.trim().to_string();
        let id = format!(
            "ann_{}",
            short_hash(&[&file, &line.to_string(), severity.as_str(), &message])
        );
        Self {
            id,
            file,
            line,
            severity,
            message,
        }
    }
}

/// One renderable piece of a parsed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSegment {
    /// Plain markdown.
    Text {
        /// Markdown source.
        content: String,
    },
    /// Clickable reference to a file, optionally to a line.
    FileRef {
        /// Hash of file, line and position among the message's file refs.
        id: String,
        /// Repository-relative path.
        file: String,
        /// 1-based line.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
    },
    /// Inline annotation.
    Annotation {
        /// The annotation.
        annotation: Annotation,
    },
    /// Suggested order for reviewing files.
    ReviewOrder {
        /// Paths in suggested order, duplicates preserved.
        files: Vec<String>,
    },
}

impl MessageSegment {
    /// Text segment helper.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// File-ref segment with a deterministic id. `ordinal` is the position
    /// of this reference among the file refs of the same message.
    pub fn file_ref(file: impl Into<String>, line: Option<u32>, ordinal: usize) -> Self {
        let file = file.into();
        let line_str = line.map(|l| l.to_string()).unwrap_or_default();
        let id = format!(
            "ref_{}",
            short_hash(&[&file, &line_str, &ordinal.to_string()])
        );
        Self::FileRef { id, file, line }
    }

    /// Whether this is a text segment.
    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }
}

/// Result of parsing one message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    /// Segments in source order.
    pub segments: Vec<MessageSegment>,
    /// First valid review-order block, if any.
    pub review_order: Option<Vec<String>>,
    /// Annotations in source order.
    pub annotations: Vec<Annotation>,
}

/// First 16 hex chars of SHA-256 over NUL-joined parts.
pub(crate) fn short_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
