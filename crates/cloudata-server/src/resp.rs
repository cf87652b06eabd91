//! RESP2 framing: the subset a key-value front-end needs.
//!
//! Requests arrive either as arrays of bulk strings or as inline commands
//! (`PING\r\n`). Replies use simple strings, errors, integers, bulk strings
//! and the null bulk string.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;
/// Longest inline command or frame header line, CRLF excluded.
pub const MAX_INLINE_LEN: usize = 64 * 1024;
const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid {0} length")]
    InvalidLength(&'static str),
    #[error("invalid integer")]
    InvalidInteger,
    #[error("{what} too large: {len}")]
    TooLarge { what: &'static str, len: usize },
    #[error("expected CRLF after bulk string")]
    MissingCrlf,
    #[error("nesting too deep")]
    TooDeep,
    #[error("expected an array of bulk strings")]
    NotACommand,
    #[error("empty command")]
    EmptyCommand,
}

impl Frame {
    pub fn ok() -> Frame {
        Frame::Simple("OK".into())
    }

    /// An error reply. `msg` starts with its error kind, e.g. `"ERR syntax error"`.
    pub fn error(msg: impl Into<String>) -> Frame {
        Frame::Error(msg.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Frame::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Frame::Null => buf.put_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    /// Command arguments, name first.
    pub fn into_args(self) -> Result<Vec<Bytes>, ProtocolError> {
        let Frame::Array(items) = self else {
            return Err(ProtocolError::NotACommand);
        };
        if items.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }
        items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(b) => Ok(b),
                Frame::Simple(s) => Ok(Bytes::from(s)),
                _ => Err(ProtocolError::NotACommand),
            })
            .collect()
    }
}

/// Parse one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` if `buf`
/// does not yet hold a complete frame.
pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    parse_at(buf, 0, 0)
}

fn parse_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::TooDeep);
    }
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    if !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*') {
        return if depth == 0 { parse_inline(buf, pos) } else { Err(ProtocolError::NotACommand) };
    }
    let Some((line, after_line)) = read_bounded_line(buf, pos + 1, "header line")? else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((Frame::Simple(String::from_utf8_lossy(line).into_owned()), after_line))),
        b'-' => Ok(Some((Frame::Error(String::from_utf8_lossy(line).into_owned()), after_line))),
        b':' => Ok(Some((Frame::Integer(parse_int(line)?), after_line))),
        b'$' => {
            let len = parse_int(line).map_err(|_| ProtocolError::InvalidLength("bulk"))?;
            if len == -1 {
                return Ok(Some((Frame::Null, after_line)));
            }
            let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidLength("bulk"))?;
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::TooLarge { what: "bulk string", len });
            }
            let end = after_line + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(ProtocolError::MissingCrlf);
            }
            Ok(Some((Frame::Bulk(Bytes::copy_from_slice(&buf[after_line..end])), end + 2)))
        }
        _ => {
            let len = parse_int(line).map_err(|_| ProtocolError::InvalidLength("array"))?;
            if len == -1 {
                return Ok(Some((Frame::Null, after_line)));
            }
            let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidLength("array"))?;
            if len > MAX_ARRAY_LEN {
                return Err(ProtocolError::TooLarge { what: "array", len });
            }
            let mut items = Vec::with_capacity(len.min(64));
            let mut next = after_line;
            for _ in 0..len {
                match parse_at(buf, next, depth + 1)? {
                    Some((item, end)) => {
                        items.push(item);
                        next = end;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(items), next)))
        }
    }
}

fn parse_inline(buf: &[u8], pos: usize) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some((line, end)) = read_bounded_line(buf, pos, "inline command")? else {
        return Ok(None);
    };
    let parts: Vec<Frame> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|p| !p.is_empty())
        .map(|p| Frame::Bulk(Bytes::copy_from_slice(p)))
        .collect();
    if parts.is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }
    Ok(Some((Frame::Array(parts), end)))
}

/// The bytes between `start` and the next CRLF, and the offset just past it.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..idx], start + idx + 2))
}

/// [`read_line`], failing once the line outgrows [`MAX_INLINE_LEN`] whether
/// or not its CRLF has arrived.
fn read_bounded_line<'a>(
    buf: &'a [u8],
    start: usize,
    what: &'static str,
) -> Result<Option<(&'a [u8], usize)>, ProtocolError> {
    match read_line(buf, start) {
        Some((line, _)) if line.len() > MAX_INLINE_LEN => {
            Err(ProtocolError::TooLarge { what, len: line.len() })
        }
        Some(found) => Ok(Some(found)),
        None => {
            let pending = buf.len().saturating_sub(start);
            if pending > MAX_INLINE_LEN + 1 {
                Err(ProtocolError::TooLarge { what, len: pending })
            } else {
                Ok(None)
            }
        }
    }
}

fn parse_int(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ProtocolError::InvalidInteger)
}
