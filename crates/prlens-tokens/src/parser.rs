//! Directive extraction.
//!
//! Passes run in a fixed order over the text the previous passes left
//! untouched: placeholder echoes are stripped, then review-order blocks,
//! annotations and file references are lifted out into structured segments.
//! A match that fails validation is left in place as literal text.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::types::{Annotation, MessageSegment, ParsedMessage, Severity};

/// Internal marker syntax the model sometimes echoes back verbatim.
static PLACEHOLDER_ECHO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__(?:SEGMENT|FILE_REF|ANNOTATION|REVIEW_ORDER)_\d+__").unwrap()
});

/// Review-order block, optionally wrapped in a code fence.
static REVIEW_ORDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)(```[A-Za-z0-9_-]*[ \t]*\r?\n[ \t]*)?<<REVIEW_ORDER>>(.*?)<</REVIEW_ORDER>>([ \t]*\r?\n[ \t]*```)?",
    )
    .unwrap()
});

static ANNOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<<ANNOTATION\s+file="([^"]+)"\s+line="(\d+)(?:\s*-\s*\d+)?"\s+severity="(info|warning|critical)"\s*>>(.*?)<</ANNOTATION>>"#,
    )
    .unwrap()
});

static FILE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\*\*)?\[\[file:([^\]\n]+?)(?::(\d+))?\]\](\*\*)?").unwrap()
});

/// Work item between passes: text still open to matching, or a lifted segment.
enum Piece {
    Text(String),
    Segment(MessageSegment),
}

/// Parse agent text into ordered segments plus the extracted directives.
///
/// Never fails. Non-empty input always yields at least one segment.
pub fn parse(content: &str) -> ParsedMessage {
    if content.is_empty() {
        return ParsedMessage::default();
    }

    let stripped = PLACEHOLDER_ECHO.replace_all(content, "");
    let mut pieces = vec![Piece::Text(stripped.to_string())];

    let mut review_order: Option<Vec<String>> = None;
    pieces = lift(pieces, &REVIEW_ORDER, |caps| {
        let body = caps.get(2).map_or("", |m| m.as_str()).trim();
        match serde_json::from_str::<Vec<String>>(body) {
            Ok(files) => {
                if review_order.is_none() {
                    review_order = Some(files.clone());
                }
                // A fence is the block's own only when both ends are present;
                // a lone one belongs to a neighbouring code block.
                let open = caps.get(1);
                let close = caps.get(3);
                let mut out = Vec::with_capacity(3);
                if let (Some(open), None) = (open, close) {
                    out.push(Piece::Text(open.as_str().to_string()));
                }
                out.push(Piece::Segment(MessageSegment::ReviewOrder { files }));
                if let (None, Some(close)) = (open, close) {
                    out.push(Piece::Text(close.as_str().to_string()));
                }
                Some(out)
            }
            Err(error) => {
                debug!(%error, "review order body is not a JSON string array");
                None
            }
        }
    });

    let mut annotations = Vec::new();
    pieces = lift(pieces, &ANNOTATION, |caps| {
        let annotation = annotation_from(caps)?;
        annotations.push(annotation.clone());
        Some(vec![Piece::Segment(MessageSegment::Annotation { annotation })])
    });

    let mut ordinal = 0usize;
    pieces = lift(pieces, &FILE_REF, |caps| {
        let file = caps.get(2).map_or("", |m| m.as_str()).trim();
        if file.is_empty() {
            return None;
        }
        let line = caps
            .get(3)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .filter(|l| *l > 0);
        let segment = MessageSegment::file_ref(file, line, ordinal);
        ordinal += 1;

        // Bold markers are consumed only as a pair.
        let open = caps.get(1).is_some();
        let close = caps.get(4).is_some();
        let mut out = Vec::with_capacity(3);
        if open && !close {
            out.push(Piece::Text("**".to_string()));
        }
        out.push(Piece::Segment(segment));
        if close && !open {
            out.push(Piece::Text("**".to_string()));
        }
        Some(out)
    });

    let mut segments = assemble(pieces);
    if segments.is_empty() {
        segments.push(MessageSegment::text(stripped.into_owned()));
    }

    ParsedMessage {
        segments,
        review_order,
        annotations,
    }
}

/// Annotations in `content`, in source order. Same as `parse(content).annotations`.
pub fn extract_annotations(content: &str) -> Vec<Annotation> {
    parse(content).annotations
}

/// First valid review order in `content`, if any.
pub fn extract_review_order(content: &str) -> Option<Vec<String>> {
    parse(content).review_order
}

fn annotation_from(caps: &Captures<'_>) -> Option<Annotation> {
    let file = caps.get(1)?.as_str().trim();
    let line = caps.get(2)?.as_str().parse::<u32>().ok().filter(|l| *l > 0)?;
    let severity = caps.get(3)?.as_str().parse::<Severity>().ok()?;
    let message = caps.get(4).map_or("", |m| m.as_str());
    if file.is_empty() {
        return None;
    }
    Some(Annotation::new(file, line, severity, message))
}

/// Run one pass over every open text piece. `replace` returns `None` to
/// leave a match as literal text.
fn lift<F>(pieces: Vec<Piece>, pattern: &Regex, mut replace: F) -> Vec<Piece>
where
    F: FnMut(&Captures<'_>) -> Option<Vec<Piece>>,
{
    let mut out = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let text = match piece {
            Piece::Text(text) => text,
            segment @ Piece::Segment(_) => {
                out.push(segment);
                continue;
            }
        };

        let mut last = 0;
        for caps in pattern.captures_iter(&text) {
            let Some(whole) = caps.get(0) else { continue };
            let Some(replacement) = replace(&caps) else {
                continue;
            };
            if whole.start() > last {
                out.push(Piece::Text(text[last..whole.start()].to_string()));
            }
            out.extend(replacement);
            last = whole.end();
        }
        if last < text.len() {
            out.push(Piece::Text(text[last..].to_string()));
        }
    }
    out
}

/// Merge adjacent text and drop empty spans.
fn assemble(pieces: Vec<Piece>) -> Vec<MessageSegment> {
    let mut segments = Vec::with_capacity(pieces.len());
    let mut pending = String::new();
    for piece in pieces {
        match piece {
            Piece::Text(text) => pending.push_str(&text),
            Piece::Segment(segment) => {
                if !pending.is_empty() {
                    segments.push(MessageSegment::text(std::mem::take(&mut pending)));
                }
                segments.push(segment);
            }
        }
    }
    if !pending.is_empty() {
        segments.push(MessageSegment::text(pending));
    }
    segments
}
