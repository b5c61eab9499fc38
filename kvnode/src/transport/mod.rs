//! Thin adapters over the command core: the Redis-line TCP listener and the
//! combined HTTP/WebSocket listener. Neither transport carries any command
//! logic of its own — they parse a request, call into [`crate::command_core`],
//! and format the reply.
pub mod http_ws;
pub mod tcp;
