//! RESP wire codec for the remote engine
//!
//! Client-side subset of the Redis serialization protocol: commands are
//! encoded as arrays of bulk strings, replies are decoded incrementally
//! from a growable buffer. `decode` returns `None` while a frame is
//! incomplete and consumes exactly one frame otherwise.

use crate::errors::{CacheError, Result};
use bytes::{Buf, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// One RESP reply value
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$n\r\n…\r\n`; `None` is the null bulk string
    Bulk(Option<Bytes>),
    /// `*n\r\n…`; `None` is the null array
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Bulk payload, if this reply carries one
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Reply::Bulk(Some(data)) => Some(data.to_vec()),
            Reply::Simple(s) => Some(s.into_bytes()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Simple(s) if s == "OK")
    }

    /// Error message, when the server rejected the command
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Append one command, RESP-encoded, to `buf`
pub fn encode_command(buf: &mut BytesMut, args: &[&[u8]]) {
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(CRLF);
    }
}

/// Decode a single reply from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// nothing is consumed in that case.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Reply>> {
    match parse_at(buf, 0)? {
        Some((reply, consumed)) => {
            buf.advance(consumed);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

/// Parse one frame starting at `pos`, returning it plus the end offset
fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(Reply, usize)>> {
    let Some(&marker) = buf.get(pos) else {
        return Ok(None);
    };

    let Some((line, body)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match marker {
        b'+' => Ok(Some((Reply::Simple(line_to_string(line)?), body))),
        b'-' => Ok(Some((Reply::Error(line_to_string(line)?), body))),
        b':' => Ok(Some((Reply::Integer(line_to_integer(line)?), body))),
        b'$' => parse_bulk(buf, line, body),
        b'*' => parse_array(buf, line, body),
        other => Err(protocol_error(format!(
            "unexpected frame marker 0x{other:02x}"
        ))),
    }
}

fn parse_bulk(buf: &[u8], header: &[u8], body: usize) -> Result<Option<(Reply, usize)>> {
    let len = line_to_integer(header)?;
    if len == -1 {
        return Ok(Some((Reply::Bulk(None), body)));
    }
    let len = usize::try_from(len).map_err(|_| protocol_error("negative bulk length"))?;

    let end = body + len + CRLF.len();
    if buf.len() < end {
        return Ok(None);
    }
    if &buf[body + len..end] != CRLF {
        return Err(protocol_error("bulk string missing terminator"));
    }
    let data = Bytes::copy_from_slice(&buf[body..body + len]);
    Ok(Some((Reply::Bulk(Some(data)), end)))
}

fn parse_array(buf: &[u8], header: &[u8], body: usize) -> Result<Option<(Reply, usize)>> {
    let len = line_to_integer(header)?;
    if len == -1 {
        return Ok(Some((Reply::Array(None), body)));
    }
    let len = usize::try_from(len).map_err(|_| protocol_error("negative array length"))?;

    let mut elements = Vec::with_capacity(len);
    let mut cursor = body;
    for _ in 0..len {
        match parse_at(buf, cursor)? {
            Some((element, next)) => {
                elements.push(element);
                cursor = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((Reply::Array(Some(elements)), cursor)))
}

/// Find the `\r\n`-terminated line starting at `pos`; returns the line body
/// and the offset just past the terminator
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rel = buf[pos..].windows(2).position(|w| w == CRLF)?;
    Some((&buf[pos..pos + rel], pos + rel + 2))
}

fn line_to_string(line: &[u8]) -> Result<String> {
    std::str::from_utf8(line)
        .map(|s| s.to_string())
        .map_err(|e| protocol_error(format!("non-UTF-8 line: {e}")))
}

fn line_to_integer(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| protocol_error("unparseable integer line"))
}

fn protocol_error(detail: impl std::fmt::Display) -> CacheError {
    CacheError::serialization("resp frame", detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<Reply> {
        let mut buf = BytesMut::from(input);
        let mut replies = Vec::new();
        while let Some(reply) = decode(&mut buf).unwrap() {
            replies.push(reply);
        }
        assert!(buf.is_empty());
        replies
    }

    #[test]
    fn decodes_simple_and_error() {
        assert_eq!(
            decode_all("+OK\r\n"),
            vec![Reply::Simple("OK".to_string())]
        );
        assert_eq!(
            decode_all("-ERR boom\r\n"),
            vec![Reply::Error("ERR boom".to_string())]
        );
    }

    #[test]
    fn decodes_integers_and_bulk() {
        assert_eq!(decode_all(":1000\r\n"), vec![Reply::Integer(1000)]);
        assert_eq!(
            decode_all("$5\r\nhello\r\n"),
            vec![Reply::Bulk(Some(Bytes::from("hello")))]
        );
        assert_eq!(decode_all("$-1\r\n"), vec![Reply::Bulk(None)]);
        assert_eq!(decode_all("$0\r\n\r\n"), vec![Reply::Bulk(Some(Bytes::new()))]);
    }

    #[test]
    fn decodes_nested_arrays() {
        let replies = decode_all("*2\r\n$1\r\na\r\n*1\r\n:7\r\n");
        assert_eq!(
            replies,
            vec![Reply::Array(Some(vec![
                Reply::Bulk(Some(Bytes::from("a"))),
                Reply::Array(Some(vec![Reply::Integer(7)])),
            ]))]
        );
        assert_eq!(decode_all("*-1\r\n"), vec![Reply::Array(None)]);
    }

    #[test]
    fn incomplete_frames_consume_nothing() {
        for partial in ["+OK\r", "$5\r\nhel", "*2\r\n$1\r\na\r\n"] {
            let mut buf = BytesMut::from(partial);
            assert!(decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), partial.len(), "partial {partial:?} was consumed");
        }
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let replies = decode_all("+OK\r\n:1\r\n$2\r\nhi\r\n");
        assert_eq!(replies.len(), 3);
        assert!(replies[0].is_ok());
        assert_eq!(replies[1].as_integer(), Some(1));
        assert_eq!(replies[2].clone().into_bytes(), Some(b"hi".to_vec()));
    }

    #[test]
    fn rejects_unknown_marker() {
        let mut buf = BytesMut::from("?what\r\n");
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn command_encoding_matches_wire_format() {
        let mut buf = BytesMut::new();
        encode_command(&mut buf, &[b"SET", b"key", b"value"]);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
    }
}
