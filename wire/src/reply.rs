//! Redis-line reply formatting (§6.1 of the wire interface): every reply is
//! one CRLF-terminated line. This is intentionally simpler than full RESP —
//! the line-framed client protocol does not nest and never sends arrays back.
use crate::error::CommandError;

pub fn ok() -> String {
    "+OK\r\n".to_string()
}

pub fn bulk(value: &str) -> String {
    format!("{value}\r\n")
}

pub fn integer(n: i64) -> String {
    format!(":{n}\r\n")
}

/// Renders any `CommandError` as the `-ERR …` or `-MOVED …` line the client expects.
pub fn error(err: &CommandError) -> String {
    match err {
        CommandError::Redirect { slot, host, port } => {
            format!("-MOVED {slot} {host}:{port}\r\n")
        }
        CommandError::NotFound => "-ERR key not found\r\n".to_string(),
        other => format!("-{other}\r\n"),
    }
}
