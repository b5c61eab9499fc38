//! The Redis-line wire protocol: one CR-LF-terminated request per line,
//! whitespace-separated tokens, double quotes to embed spaces. Thread per
//! connection, gated by `max_clients`.
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::spawn;

use logger::Logger;

use crate::command_core::CommandCore;
use wire::{reply, CommandError};

/// Tokenizes one request line. Tokens may be double-quoted to embed
/// whitespace; inside quotes a backslash escapes the following byte. An
/// unterminated quote is a protocol error.
fn tokenize(line: &str) -> Result<Vec<String>, CommandError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => {
                            return Err(CommandError::Protocol(
                                "unterminated escape at end of line".to_string(),
                            ));
                        }
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => token.push(other),
                }
            }
            if !closed {
                return Err(CommandError::Protocol("unterminated quote".to_string()));
            }
        } else {
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                token.push(chars.next().unwrap());
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

fn dispatch(core: &CommandCore, tokens: &[String]) -> String {
    let Some(cmd) = tokens.first() else {
        return reply::error(&CommandError::Protocol("empty command".to_string()));
    };

    match cmd.to_uppercase().as_str() {
        "SET" => match tokens {
            [_, key, value] => match core.set(key, value.as_bytes().to_vec()) {
                Ok(()) => reply::ok(),
                Err(e) => reply::error(&e),
            },
            _ => reply::error(&CommandError::wrong_arity("SET")),
        },
        "GET" => match tokens {
            [_, key] => match core.get(key) {
                Ok(value) => reply::bulk(&String::from_utf8_lossy(&value)),
                Err(e) => reply::error(&e),
            },
            _ => reply::error(&CommandError::wrong_arity("GET")),
        },
        "DEL" => match tokens {
            [_, key] => match core.del(key) {
                Ok(true) => reply::integer(1),
                Ok(false) => reply::integer(0),
                Err(e) => reply::error(&e),
            },
            _ => reply::error(&CommandError::wrong_arity("DEL")),
        },
        "CLUSTER" => match tokens {
            [_, sub, host, port] if sub.eq_ignore_ascii_case("MEET") => {
                match port.parse::<u16>() {
                    Ok(port) => match core.cluster_meet(host.clone(), port) {
                        Ok(()) => reply::ok(),
                        Err(e) => reply::error(&e),
                    },
                    Err(_) => reply::error(&CommandError::Cluster(format!(
                        "invalid port '{port}'"
                    ))),
                }
            }
            [_, sub, ..] if sub.eq_ignore_ascii_case("NODES") || sub.eq_ignore_ascii_case("INFO") => {
                reply::error(&CommandError::Protocol(format!(
                    "CLUSTER {} is not implemented",
                    sub.to_uppercase()
                )))
            }
            _ => reply::error(&CommandError::wrong_arity("CLUSTER")),
        },
        _ => reply::error(&CommandError::unknown_command()),
    }
}

fn handle_connection(stream: TcpStream, core: Arc<CommandCore>, logger: Logger) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            logger.error(&format!("could not clone stream for {peer}: {e}"), "tcp");
            return;
        }
    };
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.is_empty() {
            continue;
        }

        let response = match tokenize(&line) {
            Ok(tokens) if tokens.is_empty() => continue,
            Ok(tokens) => dispatch(&core, &tokens),
            Err(e) => reply::error(&e),
        };

        if writer.write_all(response.as_bytes()).is_err() {
            break;
        }
    }
    logger.debug("connection closed", "tcp", &peer);
}

/// Runs the accept loop on `listener` until the process exits. Connections
/// beyond `max_clients` are rejected with a protocol error and closed
/// immediately.
pub fn serve(listener: TcpListener, core: Arc<CommandCore>, max_clients: usize, logger: Logger) {
    let active = Arc::new(AtomicUsize::new(0));
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                logger.error(&format!("error accepting connection: {e}"), "tcp");
                continue;
            }
        };

        if active.load(Ordering::Acquire) >= max_clients {
            let mut stream = stream;
            let msg = reply::error(&CommandError::Protocol(
                "max number of clients reached".to_string(),
            ));
            let _ = stream.write_all(msg.as_bytes());
            logger.warn("rejected connection: max clients reached", "tcp");
            continue;
        }

        active.fetch_add(1, Ordering::AcqRel);
        let core = core.clone();
        let logger = logger.clone();
        let active = active.clone();
        spawn(move || {
            handle_connection(stream, core, logger);
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_plain_whitespace_separated_words() {
        assert_eq!(tokenize("SET foo bar").unwrap(), vec!["SET", "foo", "bar"]);
    }

    #[test]
    fn tokenizes_quoted_strings_with_spaces() {
        assert_eq!(
            tokenize(r#"SET foo "bar baz""#).unwrap(),
            vec!["SET", "foo", "bar baz"]
        );
    }

    #[test]
    fn backslash_escapes_the_next_byte_inside_quotes() {
        assert_eq!(
            tokenize(r#"SET foo "bar\"baz""#).unwrap(),
            vec!["SET", "foo", "bar\"baz"]
        );
    }

    #[test]
    fn unterminated_quote_is_a_protocol_error() {
        assert!(tokenize(r#"SET foo "bar"#).is_err());
    }

    #[test]
    fn blank_line_tokenizes_to_nothing() {
        assert!(tokenize("   ").unwrap().is_empty());
    }
}
