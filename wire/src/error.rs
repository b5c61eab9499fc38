//! Error kinds shared across the command core and every transport.
use std::fmt;

/// Every way a command can fail to complete, from the client's point of view.
#[derive(Debug)]
pub enum CommandError {
    /// Malformed request line or wrong argument count for a command.
    Protocol(String),
    /// `GET` on a key that is absent or has lazily expired.
    NotFound,
    /// The key's slot is not owned by this node; the client must retry elsewhere.
    Redirect { slot: u16, host: String, port: u16 },
    /// The write-ahead log could not be appended to or read from.
    Wal(String),
    /// `CLUSTER MEET` received invalid arguments.
    Cluster(String),
}

impl CommandError {
    pub fn wrong_arity(cmd: &str) -> Self {
        CommandError::Protocol(format!("wrong number of arguments for '{cmd}'"))
    }

    pub fn unknown_command() -> Self {
        CommandError::Protocol("unknown command".to_string())
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Protocol(reason) => write!(f, "ERR {reason}"),
            CommandError::NotFound => write!(f, "ERR key not found"),
            CommandError::Redirect { slot, host, port } => {
                write!(f, "MOVED {slot} {host}:{port}")
            }
            CommandError::Wal(reason) => write!(f, "ERR {reason}"),
            CommandError::Cluster(reason) => write!(f, "ERR {reason}"),
        }
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_formats_as_moved() {
        let err = CommandError::Redirect {
            slot: 1234,
            host: "127.0.0.1".to_string(),
            port: 7001,
        };
        assert_eq!(err.to_string(), "MOVED 1234 127.0.0.1:7001");
    }

    #[test]
    fn wrong_arity_names_the_command() {
        let err = CommandError::wrong_arity("SET");
        assert_eq!(
            err.to_string(),
            "ERR wrong number of arguments for 'SET'"
        );
    }
}
