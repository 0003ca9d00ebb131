//! String escaping for SQL literals.
//!
//! Byte-oriented: any input is accepted, including NUL bytes and invalid
//! encodings. The output is safe between single or double quotes.

use crate::charset::Charset;

/// Rules used to escape a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeDialect {
    pub charset: &'static Charset,
    /// Server runs with `NO_BACKSLASH_ESCAPES`: only quotes can be escaped,
    /// by doubling them.
    pub no_backslash_escapes: bool,
}

impl EscapeDialect {
    pub fn new(charset: &'static Charset) -> Self {
        Self {
            charset,
            no_backslash_escapes: false,
        }
    }

    pub fn with_no_backslash_escapes(mut self, enabled: bool) -> Self {
        self.no_backslash_escapes = enabled;
        self
    }
}

impl Default for EscapeDialect {
    fn default() -> Self {
        Self::new(Charset::default_charset())
    }
}

/// Escape `input` for embedding inside a quoted literal.
pub fn escape(input: &[u8], dialect: EscapeDialect) -> Vec<u8> {
    if dialect.no_backslash_escapes {
        escape_quotes(input, dialect.charset)
    } else {
        escape_backslashes(input, dialect.charset)
    }
}

fn escape_backslashes(input: &[u8], charset: &Charset) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut i = 0;

    while i < input.len() {
        if let Some(len) = charset.mb_char_len(&input[i..]) {
            out.extend_from_slice(&input[i..i + len]);
            i += len;
            continue;
        }

        let byte = input[i];
        // A lead byte without a valid trail would swallow the next byte on the
        // server side, so it gets its own backslash.
        let escaped = if charset.is_lead_byte(byte) {
            Some(byte)
        } else {
            match byte {
                0 => Some(b'0'),
                b'\n' => Some(b'n'),
                b'\r' => Some(b'r'),
                b'\\' => Some(b'\\'),
                b'\'' => Some(b'\''),
                b'"' => Some(b'"'),
                0x1a => Some(b'Z'),
                _ => None,
            }
        };

        match escaped {
            Some(e) => {
                out.push(b'\\');
                out.push(e);
            }
            None => out.push(byte),
        }
        i += 1;
    }

    out
}

fn escape_quotes(input: &[u8], charset: &Charset) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut i = 0;

    while i < input.len() {
        if let Some(len) = charset.mb_char_len(&input[i..]) {
            out.extend_from_slice(&input[i..i + len]);
            i += len;
            continue;
        }
        if input[i] == b'\'' {
            out.push(b'\'');
        }
        out.push(input[i]);
        i += 1;
    }

    out
}
