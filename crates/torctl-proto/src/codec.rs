//! Framing for the Tor control-port wire protocol.
//!
//! A reply is one or more lines `CCCS TEXT`, where `CCC` is a three-digit
//! status and `S` is one of:
//!
//! * `-` — a continuation line; more lines of this reply follow.
//! * ` ` — the final line of this reply.
//! * `+` — a data line: `TEXT` is followed by a multi-line body terminated
//!   by a line containing exactly `.`, with body lines that start with `.`
//!   unescaped by stripping one leading dot.
//!
//! This module only assembles *complete* replies; classifying a reply as a
//! solicited response or an asynchronous `6xx` event is [`Connection`](crate::conn)'s job.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// One parsed reply: a sequence of `(code, sigil, text)` lines, plus an
/// optional trailing data body for lines whose sigil was `+`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The status code of the reply's *final* line (all lines of a
    /// well-formed reply share the same code).
    pub code: u16,
    /// The text of every line in the reply, in order, each alongside the
    /// data body that followed it if its sigil was `+`.
    pub lines: Vec<ReplyLine>,
}

/// A single line of a [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// The text after the status code and sigil.
    pub text: String,
    /// The unescaped data body, if this line's sigil was `+`.
    pub data: Option<Vec<String>>,
}

impl Reply {
    /// Is this reply's status code in the `4xx`/`5xx` error range?
    pub fn is_error(&self) -> bool {
        (400..600).contains(&self.code)
    }

    /// Is this reply an asynchronous event (status code begins with `6`)?
    pub fn is_event(&self) -> bool {
        (600..700).contains(&self.code)
    }

    /// Concatenate every line's text with `\n`, for callers that don't
    /// care about the line structure (e.g. `GETINFO` single-value replies).
    pub fn joined_text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Decoding/encoding error for a single physical line.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The line wasn't `CCC` followed by one of `-`, ` `, `+`.
    #[error("malformed control port line: {0:?}")]
    Malformed(String),
    /// A `+`-sigil data body never saw its terminating `.` line.
    #[error("unterminated data body")]
    UnterminatedBody,
    /// Continuation lines in a reply didn't all share one status code.
    #[error("inconsistent status codes within one reply: {0} vs {1}")]
    InconsistentCode(u16, u16),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sigil distinguishing continuation/final/data reply lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sigil {
    Continuation,
    Final,
    Data,
}

impl Sigil {
    fn from_byte(b: u8) -> Option<Sigil> {
        match b {
            b'-' => Some(Sigil::Continuation),
            b' ' => Some(Sigil::Final),
            b'+' => Some(Sigil::Data),
            _ => None,
        }
    }
}

/// Parse one already-unterminated physical line (CRLF/LF already stripped)
/// into its status code, sigil, and text.
fn split_line(line: &str) -> Result<(u16, Sigil, &str), FrameError> {
    if line.len() < 4 {
        return Err(FrameError::Malformed(line.to_owned()));
    }
    let (code_str, rest) = line.split_at(3);
    let code: u16 = code_str
        .parse()
        .map_err(|_| FrameError::Malformed(line.to_owned()))?;
    let mut chars = rest.chars();
    let sigil_char = chars.next().ok_or_else(|| FrameError::Malformed(line.to_owned()))?;
    let sigil = Sigil::from_byte(sigil_char as u8).ok_or_else(|| FrameError::Malformed(line.to_owned()))?;
    Ok((code, sigil, chars.as_str()))
}

/// Unescape a data-body line: a leading `.` is stripped once.
fn unescape_body_line(line: &str) -> &str {
    line.strip_prefix('.').unwrap_or(line)
}

/// Stateful line-buffering decoder: turns a byte stream into [`Reply`]s.
///
/// Internally this is two nested state machines: an outer one assembling
/// whole replies out of continuation/final lines, and an inner one
/// assembling a `+`-sigil data body out of raw lines until the `.`
/// terminator.
#[derive(Debug, Default)]
pub struct ControlCodec {
    /// Lines accumulated for the reply currently being assembled.
    pending_lines: Vec<ReplyLine>,
    /// The status code shared by every line accumulated so far, once we've
    /// seen at least one line of the reply.
    pending_code: Option<u16>,
    /// `Some` while we are mid-data-body for the most recently pushed
    /// line; holds the body lines seen so far.
    pending_body: Option<Vec<String>>,
}

impl ControlCodec {
    /// Create a fresh codec with no partially-assembled reply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the next CRLF- or LF-terminated line in `src`, if any, and
    /// split it off (the terminator is consumed but not returned).
    fn take_line(src: &mut BytesMut) -> Option<String> {
        let pos = src.iter().position(|&b| b == b'\n')?;
        let mut line = src.split_to(pos + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Decoder for ControlCodec {
    type Item = Reply;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, FrameError> {
        loop {
            let Some(raw_line) = Self::take_line(src) else {
                return Ok(None);
            };

            if let Some(body) = &mut self.pending_body {
                if raw_line == "." {
                    let body = self.pending_body.take().expect("checked Some above");
                    let last = self
                        .pending_lines
                        .last_mut()
                        .ok_or(FrameError::UnterminatedBody)?;
                    last.data = Some(body);
                    continue;
                }
                body.push(unescape_body_line(&raw_line).to_owned());
                continue;
            }

            let (code, sigil, text) = split_line(&raw_line)?;
            match self.pending_code {
                Some(expected) if expected != code => {
                    return Err(FrameError::InconsistentCode(expected, code))
                }
                Some(_) => {}
                None => self.pending_code = Some(code),
            }

            self.pending_lines.push(ReplyLine {
                text: text.to_owned(),
                data: None,
            });

            match sigil {
                Sigil::Continuation => continue,
                Sigil::Data => {
                    self.pending_body = Some(Vec::new());
                    continue;
                }
                Sigil::Final => {
                    let lines = std::mem::take(&mut self.pending_lines);
                    self.pending_code = None;
                    return Ok(Some(Reply { code, lines }));
                }
            }
        }
    }
}

impl Encoder<String> for ControlCodec {
    type Error = FrameError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

/// Escape a multi-line command body for a `+COMMAND` data request: each
/// line that starts with `.` gets one extra `.` prepended, and the body is
/// terminated with a line containing exactly `.`.
pub fn escape_body(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(input: &str) -> Vec<Reply> {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(reply) = codec.decode(&mut buf).unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn single_line_reply() {
        let replies = feed("250 OK\r\n");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code, 250);
        assert_eq!(replies[0].lines[0].text, "OK");
    }

    #[test]
    fn multi_line_reply() {
        let replies = feed("250-first\r\n250-second\r\n250 OK\r\n");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].lines.len(), 3);
        assert_eq!(replies[0].lines[2].text, "OK");
    }

    #[test]
    fn data_body_is_unescaped() {
        let replies = feed("250+desc/id/ABC=\r\nrouter foo\r\n..leading-dot-kept-once\r\n.\r\n250 OK\r\n");
        assert_eq!(replies.len(), 1);
        let body = replies[0].lines[0].data.as_ref().unwrap();
        assert_eq!(body[0], "router foo");
        assert_eq!(body[1], ".leading-dot-kept-once");
    }

    #[test]
    fn bare_650_ok_is_a_well_formed_single_line_event() {
        let replies = feed("650 OK\r\n");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_event());
        assert_eq!(replies[0].joined_text(), "OK");
    }

    #[test]
    fn error_reply_is_classified() {
        let replies = feed("552 Unrecognized option\r\n");
        assert!(replies[0].is_error());
    }

    #[test]
    fn malformed_line_is_rejected() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from("XX\r\n");
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn escape_body_round_trips_leading_dot() {
        let escaped = escape_body(&[".oops".to_owned(), "fine".to_owned()]);
        assert_eq!(escaped, "..oops\r\nfine\r\n.\r\n");
    }
}
