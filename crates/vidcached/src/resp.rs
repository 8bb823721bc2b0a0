//! RESP2 frame codec
//!
//! Requests arrive as arrays of bulk strings; replies use every RESP2 type.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest bulk string accepted from a client (512 MiB)
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest array accepted from a client
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Deepest array nesting accepted; requests are flat
const MAX_DEPTH: usize = 8;

/// Malformed input; the connection buffer cannot be resynchronised
#[derive(Debug, Error, PartialEq)]
pub enum RespError {
    #[error("unknown frame type byte {0:#04x}")]
    UnknownType(u8),
    #[error("invalid length or integer: {0}")]
    InvalidNumber(String),
    #[error("bulk string too large: {len} bytes (max {max})")]
    BulkTooLarge { len: usize, max: usize },
    #[error("array too large: {len} elements (max {max})")]
    ArrayTooLarge { len: usize, max: usize },
    #[error("arrays nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("missing CRLF after bulk string")]
    MissingCrlf,
    #[error("line is not UTF-8")]
    InvalidUtf8,
}

/// One RESP2 frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$3\r\nabc\r\n`, or `$-1\r\n` for null
    Bulk(Option<Bytes>),
    /// `*2\r\n...`, or `*-1\r\n` for null
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Error reply with the conventional `ERR` prefix
    pub fn err(message: impl std::fmt::Display) -> Self {
        Frame::Error(format!("ERR {}", message))
    }

    pub fn ok() -> Self {
        Frame::Simple("OK".to_string())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Append the wire encoding of this frame to `out`
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Frame::Simple(s) => write_line(out, b'+', s.as_bytes()),
            Frame::Error(e) => write_line(out, b'-', e.as_bytes()),
            Frame::Integer(i) => write_line(out, b':', i.to_string().as_bytes()),
            Frame::Bulk(None) => out.put_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => {
                write_line(out, b'$', data.len().to_string().as_bytes());
                out.put_slice(data);
                out.put_slice(b"\r\n");
            }
            Frame::Array(None) => out.put_slice(b"*-1\r\n"),
            Frame::Array(Some(items)) => {
                write_line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    /// Take one complete frame off the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when more bytes are needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, RespError> {
        match parse_frame(buf, 0, 0)? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

fn write_line(out: &mut BytesMut, kind: u8, body: &[u8]) {
    out.reserve(body.len() + 3);
    out.put_u8(kind);
    out.put_slice(body);
    out.put_slice(b"\r\n");
}

/// Parse the frame starting at `pos`, returning it and the position after it
///
/// `depth` counts the arrays enclosing this frame.
fn parse_frame(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(Frame, usize)>, RespError> {
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    let frame = match kind {
        b'+' => Frame::Simple(utf8(line)?),
        b'-' => Frame::Error(utf8(line)?),
        b':' => Frame::Integer(number(line)?),
        b'$' => {
            let len = number(line)?;
            if len < 0 {
                return Ok(Some((Frame::Bulk(None), next)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(RespError::BulkTooLarge {
                    len,
                    max: MAX_BULK_LEN,
                });
            }
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(RespError::MissingCrlf);
            }
            let data = Bytes::copy_from_slice(&buf[next..next + len]);
            return Ok(Some((Frame::Bulk(Some(data)), next + len + 2)));
        }
        b'*' => {
            let len = number(line)?;
            if len < 0 {
                return Ok(Some((Frame::Array(None), next)));
            }
            if depth >= MAX_DEPTH {
                return Err(RespError::TooDeep(MAX_DEPTH));
            }
            let len = len as usize;
            if len > MAX_ARRAY_LEN {
                return Err(RespError::ArrayTooLarge {
                    len,
                    max: MAX_ARRAY_LEN,
                });
            }
            let mut items = Vec::with_capacity(len.min(64));
            let mut cursor = next;
            for _ in 0..len {
                match parse_frame(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            return Ok(Some((Frame::Array(Some(items)), cursor)));
        }
        other => return Err(RespError::UnknownType(other)),
    };
    Ok(Some((frame, next)))
}

/// Find the CRLF-terminated line starting at `pos`
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], pos + end + 2))
}

fn utf8(line: &[u8]) -> Result<String, RespError> {
    String::from_utf8(line.to_vec()).map_err(|_| RespError::InvalidUtf8)
}

fn number(line: &[u8]) -> Result<i64, RespError> {
    let text = std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)?;
    text.parse()
        .map_err(|_| RespError::InvalidNumber(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Result<Option<Frame>, RespError> {
        Frame::parse(&mut BytesMut::from(data))
    }

    fn encode(frame: &Frame) -> Vec<u8> {
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        out.to_vec()
    }

    #[test]
    fn test_scalar_frames() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), Some(Frame::ok()));
        assert_eq!(
            parse(b"-ERR boom\r\n").unwrap(),
            Some(Frame::Error("ERR boom".to_string()))
        );
        assert_eq!(parse(b":-12\r\n").unwrap(), Some(Frame::Integer(-12)));
        assert_eq!(parse(b"$-1\r\n").unwrap(), Some(Frame::Bulk(None)));
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(&Frame::Integer(7)), b":7\r\n");
        assert_eq!(encode(&Frame::err("nope")), b"-ERR nope\r\n");
        assert_eq!(encode(&Frame::bulk(&b"abc"[..])), b"$3\r\nabc\r\n");
        assert_eq!(encode(&Frame::Array(Some(vec![]))), b"*0\r\n");
    }

    #[test]
    fn test_command_array() {
        let data = b"*4\r\n$4\r\nREAD\r\n$2\r\nv1\r\n$1\r\n0\r\n$3\r\n100\r\n";
        let frame = parse(data).unwrap().unwrap();

        assert_eq!(
            frame,
            Frame::Array(Some(vec![
                Frame::bulk(&b"READ"[..]),
                Frame::bulk(&b"v1"[..]),
                Frame::bulk(&b"0"[..]),
                Frame::bulk(&b"100"[..]),
            ]))
        );
        assert_eq!(encode(&frame), data);
    }

    #[test]
    fn test_binary_bulk() {
        let frame = parse(b"$4\r\n\r\n\0\xff\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::bulk(&b"\r\n\0\xff"[..]));
    }

    #[test]
    fn test_incomplete_leaves_buffer() {
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nPING\r\n$3\r\nab"[..]);
        assert_eq!(Frame::parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 20);

        buf.extend_from_slice(b"c\r\n+next");
        assert!(Frame::parse(&mut buf).unwrap().is_some());
        assert_eq!(&buf[..], b"+next");
    }

    #[test]
    fn test_pipelined_frames() {
        let mut buf = BytesMut::from(&b"+a\r\n+b\r\n"[..]);
        assert_eq!(Frame::parse(&mut buf).unwrap(), Some(Frame::Simple("a".into())));
        assert_eq!(Frame::parse(&mut buf).unwrap(), Some(Frame::Simple("b".into())));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_nesting_limit() {
        let mut nested = b"*1\r\n".repeat(MAX_DEPTH);
        nested.extend_from_slice(b"$1\r\nx\r\n");
        assert!(parse(&nested).unwrap().is_some());

        let too_deep = b"*1\r\n".repeat(MAX_DEPTH + 1);
        assert_eq!(parse(&too_deep), Err(RespError::TooDeep(MAX_DEPTH)));

        // Deep enough to exhaust the stack without the limit.
        let hostile = b"*1\r\n".repeat(200_000);
        assert_eq!(parse(&hostile), Err(RespError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(parse(b"?x\r\n"), Err(RespError::UnknownType(b'?')));
        assert!(matches!(parse(b"$abc\r\n"), Err(RespError::InvalidNumber(_))));
        assert_eq!(parse(b"$2\r\nabcd"), Err(RespError::MissingCrlf));
        assert!(matches!(
            parse(b"$999999999999\r\n"),
            Err(RespError::BulkTooLarge { .. })
        ));
        assert!(matches!(
            parse(b"*99999999\r\n"),
            Err(RespError::ArrayTooLarge { .. })
        ));
    }
}
