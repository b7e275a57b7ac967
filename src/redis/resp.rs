/// Redis RESP (Redis Serialization Protocol) parsing and generation

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

const CRLF: &[u8] = b"\r\n";

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

impl RespValue {
    /// Text of a simple or bulk string reply
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(Some(data)) => str::from_utf8(data).ok(),
            _ => None,
        }
    }
}

/// RESP parser for reading Redis protocol messages
pub struct RespParser;

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
}

impl RespParser {
    /// Parse one RESP value from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the value is not
    /// complete yet.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::decode(&buf[..], 0)? {
            Some((value, end)) => {
                buf.advance(end);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Decode the value starting at `pos`, returning it with the position
    /// just past it.
    fn decode(data: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let Some(&kind) = data.get(pos) else {
            return Ok(None);
        };
        let Some((line, next)) = Self::read_line(data, pos + 1) else {
            return Ok(None);
        };

        match kind {
            b'+' => Ok(Some((RespValue::SimpleString(str::from_utf8(line)?.to_string()), next))),
            b'-' => Ok(Some((RespValue::Error(str::from_utf8(line)?.to_string()), next))),
            b':' => Ok(Some((RespValue::Integer(Self::parse_int(line)?), next))),
            b'$' => {
                let size = Self::parse_int(line)?;
                if size == -1 {
                    return Ok(Some((RespValue::BulkString(None), next)));
                }
                let size = usize::try_from(size).map_err(|_| {
                    RespParseError::InvalidFormat("Invalid bulk string size".to_string())
                })?;
                let end = next + size;
                if data.len() < end + CRLF.len() {
                    return Ok(None);
                }
                if &data[end..end + CRLF.len()] != CRLF {
                    return Err(RespParseError::InvalidFormat(
                        "Missing \\r\\n after bulk string".to_string(),
                    ));
                }
                let content = Bytes::copy_from_slice(&data[next..end]);
                Ok(Some((RespValue::BulkString(Some(content)), end + CRLF.len())))
            }
            b'*' => {
                let size = Self::parse_int(line)?;
                if size == -1 {
                    return Ok(Some((RespValue::Array(None), next)));
                }
                let size = usize::try_from(size).map_err(|_| {
                    RespParseError::InvalidFormat("Invalid array size".to_string())
                })?;
                let mut elements = Vec::with_capacity(size.min(1024));
                let mut cursor = next;
                for _ in 0..size {
                    match Self::decode(data, cursor)? {
                        Some((element, end)) => {
                            elements.push(element);
                            cursor = end;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(Some(elements)), cursor)))
            }
            other => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    /// Line content starting at `pos` and the position after its \r\n
    fn read_line(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        let tail = data.get(pos..)?;
        let offset = tail.windows(CRLF.len()).position(|w| w == CRLF)?;
        Some((&tail[..offset], pos + offset + CRLF.len()))
    }

    fn parse_int(line: &[u8]) -> Result<i64, RespParseError> {
        btoi::btoi::<i64>(line).map_err(|_| {
            RespParseError::InvalidFormat(format!(
                "Invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
    }
}

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.extend_from_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Encode a command as an array of bulk strings
    pub fn command(args: &[&str]) -> Bytes {
        let elements = args
            .iter()
            .map(|arg| RespValue::BulkString(Some(Bytes::copy_from_slice(arg.as_bytes()))))
            .collect();
        Self::encode(&RespValue::Array(Some(elements)))
    }
}
