//! String helpers: UTF-8 safe log previews and URL path segments.
//!
//! Streamed deltas and tool output can be arbitrarily long and contain
//! multi-byte characters; `&s[..n]` panics inside one.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Path-segment encoding: everything but RFC 3986 unreserved characters.
pub const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Encode `s` for use as one URL path segment.
pub fn encode_path_segment(s: &str) -> String {
    utf8_percent_encode(s, PATH_SEGMENT).to_string()
}

/// Longest prefix of `s` that is at most `max_bytes` long and ends on a char boundary.
#[inline]
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Single-line preview for logs: newlines escaped, truncated with `…`.
pub fn preview(s: &str, max_bytes: usize) -> String {
    let head = truncate_str(s, max_bytes);
    let mut out = head.replace('\n', "\\n");
    if head.len() < s.len() {
        out.push('…');
    }
    out
}
