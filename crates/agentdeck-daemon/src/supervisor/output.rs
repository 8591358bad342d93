//! PTY output reassembly and classification.
//!
//! A pseudo-terminal merges stdout and stderr into one byte stream and hands
//! it over in arbitrary chunks. [`LineAssembler`] turns the chunks back into
//! lines; [`interpret`] decides whether a line is a structured agent message
//! or plain text, and which stream plain text most likely came from.

use std::sync::LazyLock;

use regex::Regex;

use agentdeck_core::stream::{AgentMessage, parse_line};

use super::events::OutputKind;

/// Case-insensitive markers that attribute a line to stderr.
pub const ERROR_KEYWORDS: &[&str] = &[
    "error:",
    "fatal:",
    "aborted",
    "exception:",
    "traceback",
    "permission denied",
    "command not found",
    "no such file or directory",
];

/// CSI and OSC escape sequences emitted by terminal-aware programs.
static ANSI_ESCAPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]").ok()
});

/// Longest line held back waiting for a newline. Structured messages carry
/// whole file contents, so this is generous.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a chunked byte stream into complete lines.
///
/// Bytes are buffered until a `\n` arrives, so multi-byte UTF-8 sequences
/// split across reads decode correctly. A line that outgrows the limit is
/// emitted in pieces.
#[derive(Debug)]
pub struct LineAssembler {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    received_any: bool,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            max_line: if max_line < 4 { 4 } else { max_line },
            received_any: false,
        }
    }

    /// Feed a chunk, returning every line it completed. Blank lines are
    /// dropped; a trailing `\r` is stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if !chunk.is_empty() {
            self.received_any = true;
        }
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        loop {
            let newline = self.pending[from..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|offset| from + offset);
            let end = newline.unwrap_or(self.pending.len());
            while end - start > self.max_line {
                let cut = char_boundary(&self.pending, start + self.max_line, start);
                lines.extend(decode_line(&self.pending[start..cut]));
                start = cut;
            }
            let Some(end) = newline else { break };
            lines.extend(decode_line(&self.pending[start..end]));
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// Take whatever partial line is left. Called once the process exits.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        decode_line(&rest)
    }

    /// Whether the process wrote anything at all.
    pub const fn received_any(&self) -> bool {
        self.received_any
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Back `at` off to the start of a UTF-8 character, but never to `floor`.
fn char_boundary(bytes: &[u8], at: usize, floor: usize) -> usize {
    let mut cut = at;
    while cut > floor + 1 && bytes.get(cut).is_some_and(|b| b & 0xC0 == 0x80) {
        cut -= 1;
    }
    cut
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    let text = strip_ansi(&text);
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Remove terminal escape sequences.
pub fn strip_ansi(text: &str) -> String {
    match ANSI_ESCAPE.as_ref() {
        Some(re) if text.contains('\x1b') => re.replace_all(text, "").into_owned(),
        _ => text.to_string(),
    }
}

/// Guess which stream a plain line came from.
pub fn classify(line: &str) -> OutputKind {
    let lower = line.to_lowercase();
    if ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        OutputKind::Stderr
    } else {
        OutputKind::Stdout
    }
}

/// A complete line, interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Message(AgentMessage),
    Text { kind: OutputKind, text: String },
}

/// Structured agent message if the line parses as one, classified text
/// otherwise.
pub fn interpret(line: String) -> Line {
    match parse_line(&line) {
        Ok(message) => Line::Message(message),
        Err(_) => Line::Text {
            kind: classify(&line),
            text: line,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"hel").is_empty());
        assert_eq!(asm.push(b"lo\r\nwor"), vec!["hello"]);
        assert_eq!(asm.push(b"ld\n\n\r\n"), vec!["world"]);
        assert_eq!(asm.pending_len(), 0);
        assert!(asm.received_any());
    }

    #[test]
    fn utf8_split_inside_a_character_survives() {
        let bytes = "héllo\n".as_bytes();
        let mut asm = LineAssembler::new();
        assert!(asm.push(&bytes[..2]).is_empty());
        assert_eq!(asm.push(&bytes[2..]), vec!["héllo"]);
    }

    #[test]
    fn finish_returns_partial_tail() {
        let mut asm = LineAssembler::new();
        asm.push(b"done\npartial");
        assert_eq!(asm.finish().as_deref(), Some("partial"));
        assert_eq!(asm.finish(), None);
    }

    #[test]
    fn unterminated_output_is_bounded() {
        let mut asm = LineAssembler::with_max_line(8);
        assert!(asm.push(b"abcde").is_empty());
        assert_eq!(asm.push(b"fghijk"), vec!["abcdefgh"]);
        assert_eq!(asm.pending_len(), 3);
        assert_eq!(asm.push(b"lm\nxy"), vec!["ijklm"]);
        assert_eq!(asm.finish().as_deref(), Some("xy"));

        let mut asm = LineAssembler::with_max_line(4);
        assert_eq!(asm.push(b"0123456789\n"), vec!["0123", "4567", "89"]);
        assert_eq!(asm.pending_len(), 0);
    }

    #[test]
    fn long_lines_split_on_character_boundaries() {
        let mut asm = LineAssembler::with_max_line(4);
        assert_eq!(asm.push("abcé".as_bytes()), vec!["abc"]);
        assert_eq!(asm.finish().as_deref(), Some("é"));
    }

    #[test]
    fn silent_process_reports_no_output() {
        let mut asm = LineAssembler::new();
        asm.push(b"");
        assert!(!asm.received_any());
        assert_eq!(asm.finish(), None);
    }

    #[test]
    fn escape_sequences_are_stripped() {
        assert_eq!(strip_ansi("\x1b[1;31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn classify_uses_keywords_case_insensitively() {
        assert_eq!(classify("Error: disk full"), OutputKind::Stderr);
        assert_eq!(classify("bash: foo: command not found"), OutputKind::Stderr);
        assert_eq!(classify("Traceback (most recent call last):"), OutputKind::Stderr);
        assert_eq!(classify("all tests passed"), OutputKind::Stdout);
    }

    #[test]
    fn interpret_prefers_structured_messages() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc","model":"m"}"#;
        assert!(matches!(
            interpret(line.to_string()),
            Line::Message(AgentMessage::SystemInit(_))
        ));

        let Line::Text { kind, text } = interpret("fatal: not a git repository".to_string())
        else {
            panic!("expected text");
        };
        assert_eq!(kind, OutputKind::Stderr);
        assert_eq!(text, "fatal: not a git repository");
    }
}
