//! SSE chunking utility: splits an opaque payload into SSE-safe chunks and
//! reassembles it losslessly. spec.md §4.7.

/// Escapes `\` and `\n` so a payload containing raw newlines can't be
/// mistaken for a frame boundary once chunked.
fn escape(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    for c in payload.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`].
fn unescape(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Serialises `payload` as a sequence of `data:<chunk>\n` lines (no space
/// after `data:`), each chunk at most `limit` runes, split only on rune
/// boundaries so no surrogate or combining pair is torn in half. Any raw
/// `\` or `\n` in `payload` is escaped first so an embedded newline can
/// never be mistaken for a frame separator — this makes the round trip
/// hold for every payload, not just ones already free of newlines.
pub fn sse_chunked(payload: &str, limit: usize) -> String {
    let limit = limit.max(1);
    let escaped = escape(payload);
    let runes: Vec<char> = escaped.chars().collect();
    let mut out = String::new();
    for slice in runes.chunks(limit) {
        out.push_str("data:");
        out.extend(slice.iter());
        out.push('\n');
    }
    out
}

/// Inverse of [`sse_chunked`]: strips each `data:` prefix, concatenates the
/// chunk bodies back together, then undoes the escaping.
pub fn parse_sse(framed: &str) -> String {
    let mut out = String::new();
    for line in framed.split('\n') {
        if let Some(rest) = line.strip_prefix("data:") {
            out.push_str(rest);
        }
    }
    unescape(&out)
}
