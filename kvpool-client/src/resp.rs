//! # RESP2 Framing
//!
//! Purpose: The minimum of the cache wire protocol a pooled connection needs
//! to open (`AUTH`, `SELECT`), health-check (`PING`), and relay raw commands
//! for the command layer that sits on top of the pool.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Callers own the write and line buffers.
//! 2. **Binary-Safe**: Bulk strings are raw bytes.
//! 3. **Fail Fast**: Bad framing is a protocol error; the caller drops the
//!    stream because it can no longer be trusted to be in sync.

use std::io::BufRead;

use kvpool_common::{ClientError, ClientResult};

/// Nesting limit for array replies.
const MAX_DEPTH: usize = 32;

/// Largest bulk string accepted from the server (the server's own limit).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// One RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`, `+PONG`.
    Simple(Vec<u8>),
    /// `-ERR ...`.
    Error(Vec<u8>),
    /// `:42`.
    Integer(i64),
    /// `$n` bulk string, `None` for the null bulk.
    Bulk(Option<Vec<u8>>),
    /// `*n` array, empty for the null array.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// True for the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(text) if text == b"OK")
    }

    /// Converts an error reply into `ClientError::Server`, passing anything
    /// else through.
    pub fn into_result(self) -> ClientResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            other => Ok(other),
        }
    }
}

/// Appends a command, encoded as an array of bulk strings, to `out`.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    push_header(out, b'*', args.len());
    for arg in args {
        push_header(out, b'$', arg.len());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads exactly one reply from `reader`.
///
/// `line` is scratch space for header lines; its contents are unspecified
/// afterwards.
pub fn read_response<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_value(reader, line, 0)
}

fn read_value<R: BufRead>(reader: &mut R, line: &mut Vec<u8>, depth: usize) -> ClientResult<RespValue> {
    if depth > MAX_DEPTH {
        return Err(ClientError::Protocol);
    }
    read_line(reader, line)?;
    let (&tag, body) = line.split_first().ok_or(ClientError::Protocol)?;

    match tag {
        b'+' => Ok(RespValue::Simple(body.to_vec())),
        b'-' => Ok(RespValue::Error(body.to_vec())),
        b':' => parse_int(body).map(RespValue::Integer),
        b'$' => {
            let len = parse_int(body)?;
            if len < 0 {
                return Ok(RespValue::Bulk(None));
            }
            let len = usize::try_from(len).map_err(|_| ClientError::Protocol)?;
            if len > MAX_BULK_LEN {
                return Err(ClientError::Protocol);
            }
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data)?;
            if !data.ends_with(b"\r\n") {
                return Err(ClientError::Protocol);
            }
            data.truncate(len);
            Ok(RespValue::Bulk(Some(data)))
        }
        b'*' => {
            let len = parse_int(body)?;
            let count = usize::try_from(len).unwrap_or(0);
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_value(reader, line, depth + 1)?);
            }
            Ok(RespValue::Array(items))
        }
        _ => Err(ClientError::Protocol),
    }
}

fn read_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> ClientResult<()> {
    line.clear();
    if reader.read_until(b'\n', line)? == 0 {
        return Err(ClientError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(ClientError::Protocol);
    }
    line.truncate(line.len() - 2);
    Ok(())
}

fn parse_int(text: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(text)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(ClientError::Protocol)
}

fn push_header(out: &mut Vec<u8>, tag: u8, len: usize) {
    out.push(tag);
    // Digits are produced least-significant first into a stack buffer.
    let mut digits = [0u8; 20];
    let mut pos = digits.len();
    let mut value = len;
    loop {
        pos -= 1;
        digits[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    out.extend_from_slice(&digits[pos..]);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(bytes: &[u8]) -> ClientResult<RespValue> {
        let mut reader = Cursor::new(bytes.to_vec());
        let mut line = Vec::new();
        read_response(&mut reader, &mut line)
    }

    #[test]
    fn encodes_auth_command() {
        let mut buf = Vec::new();
        encode_command(&[b"AUTH", b"secret"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n");
    }

    #[test]
    fn encodes_empty_argument() {
        let mut buf = Vec::new();
        encode_command(&[b"ECHO", b""], &mut buf);
        assert_eq!(&buf, b"*2\r\n$4\r\nECHO\r\n$0\r\n\r\n");
    }

    #[test]
    fn parses_status_and_error() {
        assert!(parse(b"+OK\r\n").unwrap().is_ok());
        assert_eq!(
            parse(b"-WRONGPASS invalid\r\n").unwrap(),
            RespValue::Error(b"WRONGPASS invalid".to_vec())
        );
    }

    #[test]
    fn parses_bulk_and_null() {
        assert_eq!(
            parse(b"$5\r\nhello\r\n").unwrap(),
            RespValue::Bulk(Some(b"hello".to_vec()))
        );
        assert_eq!(parse(b"$-1\r\n").unwrap(), RespValue::Bulk(None));
    }

    #[test]
    fn parses_nested_array() {
        let value = parse(b"*2\r\n:1\r\n*1\r\n$1\r\na\r\n").unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Bulk(Some(b"a".to_vec()))]),
            ])
        );
    }

    #[test]
    fn rejects_bad_framing() {
        assert!(matches!(parse(b"+OK\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"?x\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b":abc\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b""), Err(ClientError::Io(_))));
    }

    #[test]
    fn rejects_oversized_bulk_length() {
        let huge = parse(b"$9223372036854775807\r\nabc\r\n");
        assert!(matches!(huge, Err(ClientError::Protocol)));

        let just_over = format!("${}\r\n", MAX_BULK_LEN + 1);
        assert!(matches!(parse(just_over.as_bytes()), Err(ClientError::Protocol)));
    }

    #[test]
    fn error_reply_becomes_server_error() {
        let err = RespValue::Error(b"ERR nope".to_vec()).into_result().unwrap_err();
        assert!(matches!(err, ClientError::Server { .. }));
    }
}
