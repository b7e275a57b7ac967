/// Bundled RESP transport used by the command-line tool and benchmarks

pub mod connection;
pub mod resp;

pub use connection::{RespConnection, RespConnectionFactory};
pub use resp::{RespEncoder, RespParseError, RespParser, RespValue};
