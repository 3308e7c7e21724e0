//! # prlens-tokens
//!
//! Parser for the directives an agent embeds in streamed review markdown:
//!
//! ```text
//! <<REVIEW_ORDER>>["a.ts", "b.ts"]<</REVIEW_ORDER>>
//! <<ANNOTATION file="a.ts" line="42" severity="warning">>message<</ANNOTATION>>
//! [[file:a.ts]] [[file:a.ts:42]]
//! ```
//!
//! [`parse`] is pure and total: malformed directives stay literal text and
//! never produce an error. Annotation and file-ref ids are content hashes,
//! so re-parsing a longer prefix of the same stream keeps every id stable.
//!
//! [`parse_streaming`] additionally holds back a trailing directive that
//! has started but not yet closed.

#![deny(unsafe_code)]

mod parser;
mod streaming;
mod types;

pub use parser::{extract_annotations, extract_review_order, parse};
pub use streaming::{StreamingParse, parse_streaming, pending_directive_start};
pub use types::{Annotation, MessageSegment, ParsedMessage, Severity, UnknownSeverity};
