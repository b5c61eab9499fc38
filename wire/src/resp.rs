//! RESP array-of-bulk-strings framing, used by the write-ahead log to encode
//! command tuples such as `["SET", k, v]`.
//!
//! Wire form of one record: `*N\r\n` followed by N bulk strings, each
//! `$L\r\n<L bytes>\r\n`. Unlike the client-facing reply format (see
//! [`crate::reply`]), this framing only ever carries bulk strings — a record
//! is a flat array, never nested, never another RESP type — so the codec
//! does not need to dispatch on a type byte past the leading `*`.
use std::fmt;
use std::io::Read;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

#[derive(Debug)]
pub enum RespCodecError {
    /// The stream ended cleanly before any bytes of a new record were read.
    Eof,
    /// The stream ended in the middle of a record (a crash-truncated tail).
    UnexpectedEof,
    Malformed(String),
    Io(String),
}

impl fmt::Display for RespCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespCodecError::Eof => write!(f, "end of stream"),
            RespCodecError::UnexpectedEof => write!(f, "truncated record at end of stream"),
            RespCodecError::Malformed(reason) => write!(f, "malformed RESP record: {reason}"),
            RespCodecError::Io(reason) => write!(f, "I/O error reading RESP record: {reason}"),
        }
    }
}

impl std::error::Error for RespCodecError {}

/// Encodes a command tuple as a RESP array of bulk strings.
pub fn encode_record(fields: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", fields.len()).as_bytes());
    for field in fields {
        out.extend_from_slice(format!("${}\r\n", field.len()).as_bytes());
        out.extend_from_slice(field);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Decodes one record from `reader`. Returns `Ok(None)` only when the stream
/// ended cleanly before the record's leading `*` was read; any other
/// incompleteness or malformed header is an error, per the WAL reader's
/// "fail the whole replay, never skip" contract.
pub fn decode_record<R: Read>(reader: &mut R) -> Result<Vec<Vec<u8>>, RespCodecError> {
    let header = match read_line(reader) {
        Ok(line) => line,
        Err(RespCodecError::Eof) => return Err(RespCodecError::Eof),
        Err(e) => return Err(e),
    };

    let count_str = header
        .strip_prefix('*')
        .ok_or_else(|| RespCodecError::Malformed("expected array header '*N'".to_string()))?;
    let count: usize = count_str
        .parse()
        .map_err(|_| RespCodecError::Malformed(format!("invalid array length '{count_str}'")))?;

    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let bulk_header = match read_line(reader) {
            Ok(line) => line,
            Err(RespCodecError::Eof) => return Err(RespCodecError::UnexpectedEof),
            Err(e) => return Err(e),
        };
        let len_str = bulk_header
            .strip_prefix('$')
            .ok_or_else(|| RespCodecError::Malformed("expected bulk header '$L'".to_string()))?;
        let len: usize = len_str
            .parse()
            .map_err(|_| RespCodecError::Malformed(format!("invalid bulk length '{len_str}'")))?;

        let mut body = vec![0u8; len + 2];
        reader
            .read_exact(&mut body)
            .map_err(|_| RespCodecError::UnexpectedEof)?;
        if &body[len..] != b"\r\n" {
            return Err(RespCodecError::Malformed(
                "bulk string not terminated by CRLF".to_string(),
            ));
        }
        body.truncate(len);
        fields.push(body);
    }

    Ok(fields)
}

/// Reads one CRLF-terminated line, returning it without the trailing CRLF.
/// Returns `Eof` only when zero bytes were read before the stream closed.
fn read_line<R: Read>(reader: &mut R) -> Result<String, RespCodecError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader
            .read(&mut byte)
            .map_err(|e| RespCodecError::Io(e.to_string()))?;
        if n == 0 {
            if line.is_empty() {
                return Err(RespCodecError::Eof);
            }
            return Err(RespCodecError::UnexpectedEof);
        }
        line.push(byte[0]);
        if line.len() >= 2 && line[line.len() - 2] == CR && line[line.len() - 1] == LF {
            line.truncate(line.len() - 2);
            return String::from_utf8(line)
                .map_err(|_| RespCodecError::Malformed("header is not valid UTF-8".to_string()));
        }
    }
}
