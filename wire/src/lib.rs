//! Wire-level building blocks shared by the node: the RESP array framing used
//! by the write-ahead log, the Redis-line reply formatters, and the error
//! enum that both the command core and the transports speak.

pub mod error;
pub mod reply;
pub mod resp;

pub use error::CommandError;
