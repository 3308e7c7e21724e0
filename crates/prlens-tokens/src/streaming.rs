//! Parsing of text that is still arriving.
//!
//! A directive whose closing tag has not streamed in yet would otherwise
//! flash as raw text and then turn into a segment. [`parse_streaming`]
//! parses only the stable prefix and hands back the open tail.

use std::sync::LazyLock;

use regex::Regex;

use crate::parser::parse;
use crate::types::ParsedMessage;

const ANNOTATION_OPEN: &str = "<<ANNOTATION";
const ANNOTATION_CLOSE: &str = "<</ANNOTATION>>";
const REVIEW_ORDER_OPEN: &str = "<<REVIEW_ORDER>>";
const REVIEW_ORDER_CLOSE: &str = "<</REVIEW_ORDER>>";
const FILE_REF_OPEN: &str = "[[file:";
const FILE_REF_CLOSE: &str = "]]";

static FENCE_BEFORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_-]*[ \t]*\r?\n[ \t]*$").unwrap());

/// Stable prefix parsed, plus the unterminated directive held back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamingParse {
    /// Parse of everything before `pending`.
    pub parsed: ParsedMessage,
    /// Raw tail starting at an unterminated directive. Empty when none.
    pub pending: String,
}

impl StreamingParse {
    /// Whether a directive is still open.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Byte offset where an unterminated directive starts, if any.
///
/// Covers an opened but unclosed review order, annotation or file ref, and
/// a trailing partial opener such as `<<ANNO` or `[[fi`.
pub fn pending_directive_start(content: &str) -> Option<usize> {
    let candidates = [
        unclosed(content, REVIEW_ORDER_OPEN, REVIEW_ORDER_CLOSE).map(|i| fence_start(content, i)),
        unclosed(content, ANNOTATION_OPEN, ANNOTATION_CLOSE),
        unclosed(content, FILE_REF_OPEN, FILE_REF_CLOSE)
            .filter(|i| !content[*i..].contains('\n')),
        partial_opener(content),
    ];
    candidates.into_iter().flatten().min()
}

/// Parse `content` up to the first unterminated directive.
pub fn parse_streaming(content: &str) -> StreamingParse {
    match pending_directive_start(content) {
        Some(start) => StreamingParse {
            parsed: parse(&content[..start]),
            pending: content[start..].to_string(),
        },
        None => StreamingParse {
            parsed: parse(content),
            pending: String::new(),
        },
    }
}

fn unclosed(content: &str, open: &str, close: &str) -> Option<usize> {
    let start = content.rfind(open)?;
    if content[start + open.len()..].contains(close) {
        None
    } else {
        Some(start)
    }
}

/// Widen a review-order start to include a code fence opened right before it.
fn fence_start(content: &str, start: usize) -> usize {
    FENCE_BEFORE
        .find(&content[..start])
        .map_or(start, |m| m.start())
}

fn partial_opener(content: &str) -> Option<usize> {
    [ANNOTATION_OPEN, REVIEW_ORDER_OPEN, FILE_REF_OPEN]
        .into_iter()
        .filter_map(|open| {
            (2..open.len())
                .rev()
                .find(|k| content.ends_with(&open[..*k]))
                .map(|k| content.len() - k)
        })
        .min()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::types::MessageSegment;

    #[test]
    fn complete_text_has_nothing_pending() {
        let result = parse_streaming("hello [[file:a.ts]] world");
        assert!(!result.has_pending());
        assert_eq!(result.parsed, parse("hello [[file:a.ts]] world"));
    }

    #[test]
    fn open_annotation_is_held_back() {
        let content = "Look here <<ANNOTATION file=\"a.ts\" line=\"3\" severity=\"info\">>partial mess";
        let result = parse_streaming(content);
        assert_eq!(result.parsed.segments, vec![MessageSegment::text("Look here ")]);
        assert!(result.pending.starts_with("<<ANNOTATION"));
        assert!(result.parsed.annotations.is_empty());
    }

    #[test]
    fn closed_annotation_is_parsed() {
        let content = "<<ANNOTATION file=\"a.ts\" line=\"3\" severity=\"info\">>m<</ANNOTATION>> tail";
        let result = parse_streaming(content);
        assert!(!result.has_pending());
        assert_eq!(result.parsed.annotations.len(), 1);
    }

    #[test]
    fn open_review_order_includes_fence() {
        let content = "Order:\n```json\n<<REVIEW_ORDER>>[\"a.ts\",";
        assert_eq!(pending_directive_start(content), Some("Order:\n".len()));
    }

    #[test]
    fn partial_openers() {
        assert_eq!(pending_directive_start("text <<ANNO"), Some(5));
        assert_eq!(pending_directive_start("text [[fi"), Some(5));
        assert_eq!(pending_directive_start("text <<"), Some(5));
        assert_eq!(pending_directive_start("text <"), None);
        assert_eq!(pending_directive_start("a [[file:src/ma"), Some(2));
    }

    #[test]
    fn file_ref_broken_by_newline_is_not_pending() {
        assert_eq!(pending_directive_start("[[file:oops\nnext line"), None);
    }

    #[test]
    fn earliest_pending_start_wins() {
        let content = "a <<ANNOTATION file=\"x\" line=\"1\" severity=\"info\">>see [[file:y";
        assert_eq!(pending_directive_start(content), Some(2));
    }

    #[test]
    fn multibyte_text_before_partial_opener() {
        let result = parse_streaming("naïve — [[");
        assert_eq!(result.pending, "[[");
        assert_matches!(&result.parsed.segments[..], [MessageSegment::Text { content }] if content == "naïve — ");
    }

    #[test]
    fn stream_prefixes_converge() {
        let full = "Start [[file:src/lib.rs:10]] then <<ANNOTATION file=\"src/lib.rs\" line=\"10\" severity=\"warning\">>check<</ANNOTATION>> end";
        for end in (0..=full.len()).filter(|i| full.is_char_boundary(*i)) {
            let _ = parse_streaming(&full[..end]);
        }
        let last = parse_streaming(full);
        assert!(!last.has_pending());
        assert_eq!(last.parsed, parse(full));
    }

    proptest::proptest! {
        #[test]
        fn pending_start_is_a_char_boundary(s in ".{0,120}") {
            if let Some(i) = pending_directive_start(&s) {
                proptest::prop_assert!(s.is_char_boundary(i));
                proptest::prop_assert!(i <= s.len());
            }
        }
    }
}
