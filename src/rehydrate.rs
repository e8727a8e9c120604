//! The streaming placeholder-rehydration engine — the hardest subsystem in
//! the proxy (spec.md §4.5). A per-session, per-response stateful
//! transducer that restores original values inside SSE `data:` payloads as
//! bytes arrive, tolerating both a line split across transport chunks and a
//! placeholder split across SSE events.

use crate::replacement_map::ReplacementMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex};

static TEXT_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""text":"((?:[^"\\]|\\.)*)""#).unwrap());
static THINKING_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""thinking":"((?:[^"\\]|\\.)*)""#).unwrap());
static CONTENT_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""content":"((?:[^"\\]|\\.)*)""#).unwrap());

const DATA_PREFIX: &str = "data: ";

/// What we extracted from one `data: ` SSE payload: the unescaped text, the
/// byte range of the whole matched JSON fragment (key+value+quotes) within
/// the *raw line*, and the prefix (everything up to and including the
/// opening quote of the value) so emission can rebuild the line without
/// re-deriving an offset via `indexOf` (spec.md §9 open question #1 — we use
/// the regex capture group's own offset instead).
#[derive(Debug, Clone)]
struct Extraction {
    text: String,
    full_start: usize,
    full_end: usize,
    prefix: String,
}

fn extract_content(payload: &str) -> Option<Extraction> {
    let regex = if payload.contains("text_delta") {
        &*TEXT_VALUE_RE
    } else if payload.contains("thinking_delta") {
        &*THINKING_VALUE_RE
    } else if payload.contains("\"delta\"") && payload.contains("\"content\"") {
        &*CONTENT_VALUE_RE
    } else if payload.contains("\"parts\"") && payload.contains("\"text\"") {
        &*TEXT_VALUE_RE
    } else {
        return None;
    };

    let caps = regex.captures(payload)?;
    let whole = caps.get(0)?;
    let group = caps.get(1)?;

    let full_start = DATA_PREFIX.len() + whole.start();
    let full_end = DATA_PREFIX.len() + whole.end();
    let group_start = DATA_PREFIX.len() + group.start();
    let prefix_end = group_start - full_start;

    Some(Extraction {
        text: json_unescape(group.as_str()),
        full_start,
        full_end,
        prefix: payload[whole.start()..whole.start() + prefix_end].to_string(),
    })
}

fn json_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                if let Ok(code) = u32::from_str_radix(&hex, 16) {
                    if let Some(ch) = char::from_u32(code) {
                        out.push(ch);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

struct HeldLine {
    raw: String,
    extraction: Option<Extraction>,
}

/// Exactly one live rehydrator per response; it is not re-entrant and not
/// shared between concurrent streams, per spec.md §9.
pub struct StreamRehydrator {
    map: Arc<Mutex<ReplacementMap>>,
    byte_buf: Vec<u8>,
    line_buf: String,
    content_buf: String,
    held: Vec<HeldLine>,
    output: Vec<String>,
}

impl StreamRehydrator {
    pub fn new(map: Arc<Mutex<ReplacementMap>>) -> Self {
        Self {
            map,
            byte_buf: Vec::new(),
            line_buf: String::new(),
            content_buf: String::new(),
            held: Vec::new(),
            output: Vec::new(),
        }
    }

    fn map_is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    /// Decodes as much of `input` as is valid UTF-8, holding back a trailing
    /// incomplete multi-byte sequence (rather than lossy-replacing it) so it
    /// can be completed by the next chunk's leading bytes.
    fn decode_utf8_prefix(input: Vec<u8>) -> (String, Vec<u8>) {
        match String::from_utf8(input) {
            Ok(s) => (s, Vec::new()),
            Err(err) => {
                let utf8_error = err.utf8_error();
                let valid_up_to = utf8_error.valid_up_to();
                // `error_len() == None` means the tail is a truncated sequence
                // that could still be completed by more bytes, as opposed to
                // bytes that are definitively invalid.
                let incomplete = utf8_error.error_len().is_none();
                let mut input = err.into_bytes();
                let rest = input.split_off(valid_up_to);
                let text = String::from_utf8(input).expect("valid_up_to guarantees valid prefix");
                if incomplete {
                    (text, rest)
                } else {
                    let mut text = text;
                    text.push_str(&String::from_utf8_lossy(&rest));
                    (text, Vec::new())
                }
            }
        }
    }

    /// Feeds one chunk of upstream bytes; returns the bytes to write to the
    /// client. Fast path: if the session map is empty, bytes pass through
    /// untouched and no state is retained.
    pub fn on_chunk(&mut self, bytes: &[u8]) -> Vec<u8> {
        if self.map_is_empty()
            && self.line_buf.is_empty()
            && self.held.is_empty()
            && self.byte_buf.is_empty()
        {
            return bytes.to_vec();
        }

        let mut input = std::mem::take(&mut self.byte_buf);
        input.extend_from_slice(bytes);
        let (text, leftover) = Self::decode_utf8_prefix(input);
        self.byte_buf = leftover;

        let combined = format!("{}{}", self.line_buf, text);

        let ends_with_newline = combined.ends_with('\n');
        let mut parts: Vec<&str> = combined.split('\n').collect();
        if ends_with_newline {
            // split() on a string ending in '\n' yields a trailing empty
            // element; drop it, there is no partial line left over.
            parts.pop();
            self.line_buf.clear();
        } else {
            self.line_buf = parts.pop().unwrap_or("").to_string();
        }

        for line in parts {
            self.process_line(line);
        }

        self.drain_output()
    }

    /// Processes any residual `line_buf` as a final line, then force-flushes
    /// whatever remains held.
    pub fn on_end(&mut self) -> Option<Vec<u8>> {
        if !self.byte_buf.is_empty() {
            let leftover = std::mem::take(&mut self.byte_buf);
            self.line_buf.push_str(&String::from_utf8_lossy(&leftover));
        }
        if !self.line_buf.is_empty() {
            let residual = std::mem::take(&mut self.line_buf);
            self.process_line(&residual);
        }
        self.maybe_flush(true);

        let out = self.drain_output();
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn drain_output(&mut self) -> Vec<u8> {
        if self.output.is_empty() {
            return Vec::new();
        }
        let mut result = self.output.join("\n");
        result.push('\n');
        self.output.clear();
        result.into_bytes()
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.held.push(HeldLine {
                raw: String::new(),
                extraction: None,
            });
            return;
        }

        if !line.starts_with(DATA_PREFIX) {
            self.maybe_flush(true);
            self.held.push(HeldLine {
                raw: line.to_string(),
                extraction: None,
            });
            self.maybe_flush(true);
            return;
        }

        let payload = &line[DATA_PREFIX.len()..];
        match extract_content(payload) {
            None => {
                self.maybe_flush(true);
                self.output.push(line.to_string());
            }
            Some(extraction) => {
                self.content_buf.push_str(&extraction.text);
                self.held.push(HeldLine {
                    raw: line.to_string(),
                    extraction: Some(extraction),
                });
                self.maybe_flush(false);
            }
        }
    }

    fn has_trailing_partial_placeholder(&self) -> bool {
        match self.content_buf.rfind('[') {
            Some(idx) => !self.content_buf[idx..].contains(']'),
            None => false,
        }
    }

    fn maybe_flush(&mut self, forced: bool) {
        if self.held.is_empty() {
            return;
        }
        if !forced && self.has_trailing_partial_placeholder() {
            return;
        }
        self.do_flush();
    }

    fn do_flush(&mut self) {
        let rehydrated = {
            let map = self.map.lock().unwrap();
            map.rehydrate(&self.content_buf)
        };
        let changed = rehydrated != self.content_buf;

        let mut first_content_emitted = false;
        for held in self.held.drain(..) {
            match held.extraction {
                None => self.output.push(held.raw),
                Some(extraction) => {
                    if !changed {
                        self.output.push(held.raw);
                    } else if !first_content_emitted {
                        self.output
                            .push(rewrite_line(&held.raw, &extraction, &rehydrated));
                        first_content_emitted = true;
                    } else {
                        self.output.push(rewrite_line(&held.raw, &extraction, ""));
                    }
                }
            }
        }

        self.content_buf.clear();
    }
}

fn rewrite_line(raw: &str, extraction: &Extraction, new_text: &str) -> String {
    let escaped = json_escape(new_text);
    let mut out = String::with_capacity(raw.len() + escaped.len());
    out.push_str(&raw[..extraction.full_start]);
    out.push_str(&extraction.prefix);
    out.push_str(&escaped);
    out.push('"');
    out.push_str(&raw[extraction.full_end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(entries: &[(&str, &str)]) -> Arc<Mutex<ReplacementMap>> {
        let mut map = ReplacementMap::new();
        for (rule, original) in entries {
            map.get_or_create(original, rule);
        }
        Arc::new(Mutex::new(map))
    }

    #[test]
    fn fast_path_passthrough_on_empty_map() {
        let map = Arc::new(Mutex::new(ReplacementMap::new()));
        let mut rehydrator = StreamRehydrator::new(map);
        let input = b"data: {\"type\":\"text_delta\",\"text\":\"hello\"}\n\n";
        let output = rehydrator.on_chunk(input);
        assert_eq!(output, input);
    }

    #[test]
    fn rehydrates_single_event_placeholder() {
        let map = map_with(&[("email", "john@example.com")]);
        let placeholder = {
            let m = map.lock().unwrap();
            m.iter_placeholders().next().unwrap().clone()
        };
        let mut rehydrator = StreamRehydrator::new(map);
        let line = format!(
            "data: {{\"type\":\"content_block_delta\",\"delta\":{{\"type\":\"text_delta\",\"text\":\"contact {placeholder}\"}}}}\n\n"
        );
        let output = rehydrator.on_chunk(line.as_bytes());
        let output_str = String::from_utf8(output).unwrap();
        assert!(output_str.contains("contact john@example.com"));
        assert!(!output_str.contains(&placeholder));
    }

    #[test]
    fn rehydrates_placeholder_split_across_events() {
        let map = map_with(&[("email", "john@example.com")]);
        let placeholder = {
            let m = map.lock().unwrap();
            m.iter_placeholders().next().unwrap().clone()
        };
        let (first_half, second_half) = placeholder.split_at(placeholder.len() - 2);
        let mut rehydrator = StreamRehydrator::new(map);

        let event1 = format!(
            "data: {{\"type\":\"content_block_delta\",\"delta\":{{\"type\":\"text_delta\",\"text\":\"contact {first_half}\"}}}}\n\n"
        );
        let event2 = format!(
            "data: {{\"type\":\"content_block_delta\",\"delta\":{{\"type\":\"text_delta\",\"text\":\"{second_half}\"}}}}\n\n"
        );

        let mut out = rehydrator.on_chunk(event1.as_bytes());
        out.extend(rehydrator.on_chunk(event2.as_bytes()));
        if let Some(tail) = rehydrator.on_end() {
            out.extend(tail);
        }
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.contains("contact john@example.com"));
        assert!(!out_str.contains(&placeholder));
    }

    #[test]
    fn rehydrates_line_split_across_chunks() {
        let map = map_with(&[("email", "john@example.com")]);
        let placeholder = {
            let m = map.lock().unwrap();
            m.iter_placeholders().next().unwrap().clone()
        };
        let full_line = format!(
            "data: {{\"type\":\"content_block_delta\",\"delta\":{{\"type\":\"text_delta\",\"text\":\"hi {placeholder}\"}}}}\n\n"
        );
        let mid = full_line.len() / 2;
        let (chunk1, chunk2) = full_line.split_at(mid);

        let mut rehydrator = StreamRehydrator::new(map);
        let mut out = rehydrator.on_chunk(chunk1.as_bytes());
        out.extend(rehydrator.on_chunk(chunk2.as_bytes()));
        if let Some(tail) = rehydrator.on_end() {
            out.extend(tail);
        }
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.contains("hi john@example.com"));
    }

    #[test]
    fn structural_events_pass_through_unchanged() {
        let map = map_with(&[("email", "john@example.com")]);
        let mut rehydrator = StreamRehydrator::new(map);
        let input = "data: {\"type\":\"message_start\"}\n\ndata: {\"type\":\"content_block_stop\"}\n\ndata: {\"type\":\"message_stop\"}\n\n";
        let output = rehydrator.on_chunk(input.as_bytes());
        assert_eq!(String::from_utf8(output).unwrap(), input);
    }

    #[test]
    fn trailing_partial_bracket_withholds_flush() {
        assert!("prefix [EMA".contains('['));
        let map = map_with(&[("email", "john@example.com")]);
        let mut rehydrator = StreamRehydrator::new(map);
        rehydrator.content_buf = "partial [EMA".to_string();
        assert!(rehydrator.has_trailing_partial_placeholder());
        rehydrator.content_buf = "complete [EMAIL_1] text".to_string();
        assert!(!rehydrator.has_trailing_partial_placeholder());
    }

    #[test]
    fn multibyte_character_split_across_chunk_boundary_is_not_corrupted() {
        let map = map_with(&[("email", "john@example.com")]);
        let placeholder = {
            let m = map.lock().unwrap();
            m.iter_placeholders().next().unwrap().clone()
        };
        let full_line = format!(
            "data: {{\"type\":\"content_block_delta\",\"delta\":{{\"type\":\"text_delta\",\"text\":\"caf\u{e9} {placeholder}\"}}}}\n\n"
        );
        let bytes = full_line.as_bytes();
        // "é" is encoded as the two bytes 0xC3 0xA9; split right between them
        // so the first chunk ends mid-character.
        let split_at = full_line.find('\u{e9}').unwrap() + 1;
        let (chunk1, chunk2) = bytes.split_at(split_at);

        let mut rehydrator = StreamRehydrator::new(map);
        let mut out = rehydrator.on_chunk(chunk1);
        out.extend(rehydrator.on_chunk(chunk2));
        if let Some(tail) = rehydrator.on_end() {
            out.extend(tail);
        }
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.contains("caf\u{e9} john@example.com"));
        assert!(!out_str.contains('\u{fffd}'));
    }
}
