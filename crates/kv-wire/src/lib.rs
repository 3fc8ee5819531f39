// kv-wire: RESP2 frame types and codec.
//
// Everything the server and its peers put on a TCP connection goes through
// this crate: client command arrays, every reply shape, and the one
// non-standard frame in the protocol — the snapshot payload, which is
// length-prefixed like a bulk string but carries no trailing CRLF.
//
// Decoders report the exact number of bytes consumed per frame; replication
// offset accounting depends on those counts being byte-accurate.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WireError {
    /// The peer closed the connection at a frame boundary.
    #[error("connection closed")]
    Eof,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed frame: bad prefix byte, bad length, or missing CRLF.
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One RESP2 frame.
///
/// `Rdb` is the snapshot-transfer frame sent after `+FULLRESYNC`: the same
/// `$<len>\r\n` prefix as a bulk string, raw bytes, and no trailing CRLF.
/// It never appears inside an `Array` and is only read via
/// [`read_rdb_payload`].
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    /// Full error line as it appears after `-` (including any `ERR` prefix).
    Error(String),
    Integer(i64),
    Bulk(String),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
    Rdb(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Error(msg) => {
                out.push(b'-');
                out.extend_from_slice(msg.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
            Frame::Bulk(s) => {
                out.extend_from_slice(format!("${}\r\n", s.len()).as_bytes());
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::NullBulk => out.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            Frame::NullArray => out.extend_from_slice(b"*-1\r\n"),
            Frame::Rdb(bytes) => {
                out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Convenience: an array of bulk strings, the shape of every command.
    pub fn bulk_array<S: AsRef<str>>(items: &[S]) -> Frame {
        Frame::Array(
            items
                .iter()
                .map(|s| Frame::Bulk(s.as_ref().to_owned()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Hot-path encoders
// ---------------------------------------------------------------------------

pub fn encode_simple(s: &str) -> Vec<u8> {
    Frame::Simple(s.to_owned()).encode()
}

/// Simple error with the standard `ERR` class, i.e. `-ERR <msg>\r\n`.
pub fn encode_error(msg: &str) -> Vec<u8> {
    Frame::Error(format!("ERR {msg}")).encode()
}

pub fn encode_int(n: i64) -> Vec<u8> {
    Frame::Integer(n).encode()
}

pub fn encode_bulk(s: &str) -> Vec<u8> {
    Frame::Bulk(s.to_owned()).encode()
}

pub fn null_bulk() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn null_array() -> Vec<u8> {
    b"*-1\r\n".to_vec()
}

pub fn empty_array() -> Vec<u8> {
    b"*0\r\n".to_vec()
}

/// Array of bulk strings.
pub fn encode_bulk_array<S: AsRef<str>>(items: &[S]) -> Vec<u8> {
    Frame::bulk_array(items).encode()
}

pub fn encode_rdb(bytes: &[u8]) -> Vec<u8> {
    Frame::Rdb(bytes.to_vec()).encode()
}

/// Case-insensitive comparison for command names and option keywords
/// (ASCII only, which is all RESP keywords are).
pub fn keyword_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

/// Read one CRLF-terminated line, stripping the terminator.
///
/// Returns the line and the number of bytes consumed (terminator included).
/// Used directly by the replica handshake, which reads bare `+...` lines.
pub async fn read_line<R>(reader: &mut R) -> Result<(String, usize), WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(WireError::Eof);
    }
    if !line.ends_with("\r\n") {
        return Err(WireError::Protocol(format!(
            "line missing CRLF terminator: {line:?}"
        )));
    }
    line.truncate(line.len() - 2);
    Ok((line, n))
}

fn parse_len(header: &str, prefix: char) -> Result<i64, WireError> {
    let rest = header.strip_prefix(prefix).ok_or_else(|| {
        WireError::Protocol(format!("expected '{prefix}' prefix, got {header:?}"))
    })?;
    rest.parse::<i64>()
        .map_err(|_| WireError::Protocol(format!("invalid length in {header:?}")))
}

/// One `$<len>\r\n<bytes>\r\n` element.
async fn read_bulk_item<R>(reader: &mut R) -> Result<(String, usize), WireError>
where
    R: AsyncBufRead + Unpin,
{
    let (header, mut consumed) = read_line(reader).await?;
    let len = parse_len(&header, '$')?;
    if len < 0 {
        return Err(WireError::Protocol(
            "null bulk string not allowed inside a command".to_owned(),
        ));
    }
    let len = usize::try_from(len).expect("non-negative length");
    let mut buf = vec![0u8; len + 2];
    reader.read_exact(&mut buf).await?;
    consumed += len + 2;
    if &buf[len..] != b"\r\n" {
        return Err(WireError::Protocol(
            "bulk string missing CRLF terminator".to_owned(),
        ));
    }
    buf.truncate(len);
    let s = String::from_utf8(buf)
        .map_err(|_| WireError::Protocol("bulk string is not valid UTF-8".to_owned()))?;
    Ok((s, consumed))
}

/// Decode one client command: `*N\r\n` followed by N bulk strings.
///
/// Returns the parts and the exact wire length of the whole array, which the
/// caller credits against the replication offset.
pub async fn read_command<R>(reader: &mut R) -> Result<(Vec<String>, usize), WireError>
where
    R: AsyncBufRead + Unpin,
{
    let (header, mut consumed) = read_line(reader).await?;
    let count = parse_len(&header, '*')?;
    if count < 0 {
        return Err(WireError::Protocol(
            "command array length must be non-negative".to_owned(),
        ));
    }
    let count = usize::try_from(count).expect("non-negative length");
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let (part, n) = read_bulk_item(reader).await?;
        consumed += n;
        parts.push(part);
    }
    Ok((parts, consumed))
}

/// Decode any RESP2 frame (except the CRLF-less snapshot payload, which is
/// read explicitly with [`read_rdb_payload`]).
pub async fn read_frame<R>(reader: &mut R) -> Result<(Frame, usize), WireError>
where
    R: AsyncBufRead + Unpin,
{
    let (line, mut consumed) = read_line(reader).await?;
    let mut chars = line.chars();
    let kind = chars
        .next()
        .ok_or_else(|| WireError::Protocol("empty frame line".to_owned()))?;
    let rest = chars.as_str();
    match kind {
        '+' => Ok((Frame::Simple(rest.to_owned()), consumed)),
        '-' => Ok((Frame::Error(rest.to_owned()), consumed)),
        ':' => {
            let n = rest
                .parse::<i64>()
                .map_err(|_| WireError::Protocol(format!("invalid integer frame: {line:?}")))?;
            Ok((Frame::Integer(n), consumed))
        }
        '$' => {
            let len = parse_len(&line, '$')?;
            if len < 0 {
                return Ok((Frame::NullBulk, consumed));
            }
            let len = usize::try_from(len).expect("non-negative length");
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await?;
            consumed += len + 2;
            if &buf[len..] != b"\r\n" {
                return Err(WireError::Protocol(
                    "bulk string missing CRLF terminator".to_owned(),
                ));
            }
            buf.truncate(len);
            let s = String::from_utf8(buf).map_err(|_| {
                WireError::Protocol("bulk string is not valid UTF-8".to_owned())
            })?;
            Ok((Frame::Bulk(s), consumed))
        }
        '*' => {
            let len = parse_len(&line, '*')?;
            if len < 0 {
                return Ok((Frame::NullArray, consumed));
            }
            let len = usize::try_from(len).expect("non-negative length");
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                let (item, n) = Box::pin(read_frame(reader)).await?;
                consumed += n;
                items.push(item);
            }
            Ok((Frame::Array(items), consumed))
        }
        other => Err(WireError::Protocol(format!(
            "unknown frame prefix: {other:?}"
        ))),
    }
}

/// Read the snapshot-transfer frame: `$<len>\r\n` followed by exactly `len`
/// raw bytes and no trailing CRLF.
pub async fn read_rdb_payload<R>(reader: &mut R) -> Result<(Vec<u8>, usize), WireError>
where
    R: AsyncBufRead + Unpin,
{
    let (header, mut consumed) = read_line(reader).await?;
    let len = parse_len(&header, '$')?;
    if len < 0 {
        return Err(WireError::Protocol(
            "snapshot payload length must be non-negative".to_owned(),
        ));
    }
    let len = usize::try_from(len).expect("non-negative length");
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    consumed += len;
    Ok((buf, consumed))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
