//! Protocol message parsing and formatting.
//!
//! Pure functions and an incremental [`MessageBuilder`]: no I/O happens
//! here, so every framing and escaping rule is unit-testable without a
//! socket. The socket layer feeds lines in and gets whole replies out.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, TorError};
use crate::types::{BootstrapStatus, BridgeLine, StatusSeverity};

/// Status code the daemon uses for asynchronous event notifications.
pub const ASYNC_EVENT_STATUS: u16 = 650;

/// A complete reply from the daemon, potentially spanning multiple lines.
///
/// `lines` holds the text portion of each reply line (status code and
/// separator stripped) plus, for multi-line values, the raw data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The 3-digit status code of the first line.
    pub status: u16,
    /// All content lines, in order.
    pub lines: Vec<String>,
}

impl Reply {
    /// Check whether this reply indicates success (2xx family).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check whether this reply indicates an error (4xx/5xx families).
    pub fn is_error(&self) -> bool {
        (400..600).contains(&self.status)
    }

    /// Check whether this is an asynchronous event notification.
    pub fn is_async_event(&self) -> bool {
        self.status == ASYNC_EVENT_STATUS
    }

    /// The first line's text, or `""` for a pathological empty reply.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// All lines joined with newlines.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Convert into a `Result`, rejecting 4xx/5xx replies with a typed
    /// command error that carries the daemon's status and message.
    pub fn into_result(self) -> Result<Reply> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TorError::Command {
                status: self.status,
                message: self.text(),
            })
        }
    }
}

/// Incremental assembler for one protocol message.
///
/// Feed lines with [`push_line`](Self::push_line) until it returns `true`,
/// then take the result with [`finish`](Self::finish). A fresh builder is
/// needed per message.
///
/// Framing rules: each line carries a 3-digit status code and a separator
/// (`-` mid-reply, `+` begin multi-line value, space final). A `+` line
/// switches the builder into data mode, which collects every following line
/// raw (with `..` dot-unstuffing) until a line containing exactly `.`.
/// Outside data mode the message ends at a space-separated line whose code
/// matches the first line's code.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    status: Option<u16>,
    lines: Vec<String>,
    in_data: bool,
    malformed: Option<String>,
}

impl MessageBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && !self.in_data && self.malformed.is_none()
    }

    /// Feed one line (CRLF already stripped). Returns `true` when the
    /// message is complete; malformed lines are terminal and surface from
    /// [`finish`](Self::finish).
    pub fn push_line(&mut self, line: &str) -> bool {
        if self.in_data {
            if line == "." {
                self.in_data = false;
                return false;
            }
            let unstuffed = if line.starts_with("..") {
                &line[1..]
            } else {
                line
            };
            self.lines.push(unstuffed.to_string());
            return false;
        }

        let bytes = line.as_bytes();
        if bytes.len() < 4 {
            self.malformed = Some(format!("reply line too short: '{}'", line));
            return true;
        }
        if !bytes[..3].iter().all(u8::is_ascii_digit) {
            self.malformed = Some(format!("invalid status code in: '{}'", line));
            return true;
        }
        // First four bytes are ASCII, so the slices below are safe.
        let code: u16 = match line[..3].parse() {
            Ok(c) => c,
            Err(_) => {
                self.malformed = Some(format!("invalid status code in: '{}'", line));
                return true;
            }
        };
        let sep = bytes[3];
        if !matches!(sep, b' ' | b'-' | b'+') {
            self.malformed = Some(format!("invalid separator in: '{}'", line));
            return true;
        }

        if self.status.is_none() {
            self.status = Some(code);
        }
        self.lines.push(line[4..].to_string());

        match sep {
            b'+' => {
                self.in_data = true;
                false
            }
            b' ' => self.status == Some(code),
            _ => false,
        }
    }

    /// Take the assembled reply, or the framing error for a malformed
    /// message. Framing errors are fatal to the connection that produced
    /// them: the byte stream's state can no longer be trusted.
    pub fn finish(self) -> Result<Reply> {
        if let Some(reason) = self.malformed {
            return Err(TorError::Protocol(reason));
        }
        match self.status {
            Some(status) => Ok(Reply {
                status,
                lines: self.lines,
            }),
            None => Err(TorError::Protocol("empty reply".to_string())),
        }
    }
}

/// Quote a string for use in a command argument, if necessary.
///
/// Values containing control bytes, spaces, `"`, `#`, or `\` are wrapped
/// in double quotes with backslash escapes; non-printable bytes (including
/// all non-ASCII) are emitted as `\xHH`.
pub fn escape_string(s: &str) -> String {
    let needs_quoting = s.is_empty()
        || s.bytes().any(|b| {
            b.is_ascii_control() || b == b' ' || b == b'"' || b == b'#' || b == b'\\' || b >= 0x80
        });

    if !needs_quoting {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for b in s.bytes() {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02X}", b)),
        }
    }
    out.push('"');
    out
}

/// Quote a string unconditionally.
///
/// Needed where the command grammar distinguishes a quoted string from a
/// bare token (AUTHENTICATE reads an unquoted argument as cookie hex).
pub fn quote_string(s: &str) -> String {
    let escaped = escape_string(s);
    if escaped.starts_with('"') {
        escaped
    } else {
        format!("\"{}\"", escaped)
    }
}

/// Undo [`escape_string`].
///
/// Unquoted input is returned verbatim. Quoted input must carry a matching
/// closing quote; an unterminated quoted string is an error. `\xHH` hex and
/// `\NNN` octal escapes produce raw bytes, decoded as UTF-8 once the whole
/// string is assembled, so contiguous escaped bytes form one character.
pub fn unescape_string(s: &str) -> Result<String> {
    if !s.starts_with('"') {
        return Ok(s.to_string());
    }
    let (value, rest) = take_quoted(s)?;
    if !rest.is_empty() {
        return Err(TorError::Parse(format!(
            "trailing data after quoted string: '{}'",
            rest
        )));
    }
    Ok(value)
}

/// Consume one quoted string from the front of `s`, returning the decoded
/// value and the remaining input.
fn take_quoted(s: &str) -> Result<(String, &str)> {
    let bytes = s.as_bytes();
    debug_assert_eq!(bytes.first(), Some(&b'"'));

    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let value = String::from_utf8(out)
                    .map_err(|e| TorError::Parse(format!("invalid UTF-8 in value: {}", e)))?;
                return Ok((value, &s[i + 1..]));
            }
            b'\\' => {
                i += 1;
                let Some(&escaped) = bytes.get(i) else {
                    break;
                };
                match escaped {
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'x' => {
                        let hex = s.get(i + 1..i + 3).ok_or_else(|| {
                            TorError::Parse("truncated \\x escape".to_string())
                        })?;
                        let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                            TorError::Parse(format!("invalid \\x escape: '{}'", hex))
                        })?;
                        out.push(byte);
                        i += 2;
                    }
                    b'0'..=b'7' => {
                        let mut value: u16 = 0;
                        let mut digits = 0;
                        while digits < 3 {
                            match bytes.get(i) {
                                Some(&d @ b'0'..=b'7') => {
                                    value = value * 8 + u16::from(d - b'0');
                                    digits += 1;
                                    i += 1;
                                }
                                _ => break,
                            }
                        }
                        i -= 1;
                        if value > 0xff {
                            return Err(TorError::Parse(format!(
                                "octal escape out of range: \\{:o}",
                                value
                            )));
                        }
                        out.push(value as u8);
                    }
                    other => out.push(other),
                }
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(TorError::Parse(format!("unterminated quoted string: '{}'", s)))
}

/// Parse space-separated `KEY=value` pairs, with quoted-string values.
pub fn parse_key_value_pairs(text: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let mut remaining = text.trim_start();

    while !remaining.is_empty() {
        let Some(eq) = remaining.find('=') else {
            break;
        };
        let key = remaining[..eq].to_string();
        remaining = &remaining[eq + 1..];

        let (value, rest) = if remaining.starts_with('"') {
            match take_quoted(remaining) {
                Ok(pair) => pair,
                // An unterminated quote poisons the remainder of the line.
                Err(_) => (remaining.to_string(), ""),
            }
        } else {
            let end = remaining.find(' ').unwrap_or(remaining.len());
            (remaining[..end].to_string(), &remaining[end..])
        };

        result.insert(key, value);
        remaining = rest.trim_start();
    }

    result
}

/// Parse a client-status line into a [`BootstrapStatus`].
///
/// Returns `None` when the line carries no `BOOTSTRAP` marker: callers must
/// treat that as "not a bootstrap line", not as a parse failure.
pub fn parse_bootstrap_status(line: &str) -> Option<BootstrapStatus> {
    let mut parts = line.trim().splitn(3, ' ');
    let severity = StatusSeverity::from_str(parts.next()?).ok()?;
    if parts.next()? != "BOOTSTRAP" {
        return None;
    }
    let kv = parse_key_value_pairs(parts.next().unwrap_or(""));

    let progress = kv.get("PROGRESS")?.parse().ok()?;
    Some(BootstrapStatus {
        severity,
        progress,
        tag: kv.get("TAG").cloned().unwrap_or_default(),
        summary: kv.get("SUMMARY").cloned(),
        warning: kv.get("WARNING").cloned(),
        reason: kv.get("REASON").cloned(),
        count: kv.get("COUNT").and_then(|c| c.parse().ok()),
        host_addr: kv.get("HOSTADDR").cloned(),
        recommendation: kv.get("RECOMMENDATION").cloned(),
    })
}

static BRIDGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^\s*
        (?: ([A-Za-z][A-Za-z0-9_.-]*) \s+ )?       # optional transport name
        ( \[? [0-9A-Fa-f:.]+ \]? : [0-9]{1,5} )    # address:port
        (?: \s+ ([0-9A-Fa-f]{40}) )?               # optional fingerprint
        (?: \s+ (\S.*?) )?                         # optional trailing args
        \s*$",
    )
    .expect("bridge line regex is valid")
});

/// Parse one configured bridge descriptor line.
///
/// The transport name defaults to `"vanilla"` when omitted; a line without
/// the `address:port` shape is an error.
pub fn parse_bridge_line(line: &str) -> Result<BridgeLine> {
    let caps = BRIDGE_LINE
        .captures(line)
        .ok_or_else(|| TorError::Parse(format!("invalid bridge line: '{}'", line)))?;

    let fingerprint = match caps.get(3) {
        Some(m) => Some(m.as_str().parse()?),
        None => None,
    };

    Ok(BridgeLine {
        transport: caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "vanilla".to_string()),
        addr: caps[2].to_string(),
        fingerprint,
        args: caps.get(4).map(|m| m.as_str().to_string()),
    })
}

/// Format a command line with arguments, CRLF-terminated.
pub fn format_command(keyword: &str, args: &[&str]) -> String {
    let mut cmd = keyword.to_string();
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd.push_str("\r\n");
    cmd
}
