//! Stream a single local file to every TCP client that connects.
//!
//! The server sends the raw file bytes and closes the connection; the client
//! treats the close as end-of-file.

pub mod client;
pub mod common;
pub mod error;
pub mod logging;
pub mod server;
pub mod transfer;
pub mod workerpool;

pub use error::{RelayError, Result};
