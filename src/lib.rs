//! HTTP/1.x wire protocol engine.
//!
//! This crate implements the hard parts of HTTP/1.0 and HTTP/1.1 framing:
//! a streaming head parser that installs the right body reader
//! (content-length bounded, chunked or read-to-close), a chunked
//! transfer-encoding decoder with trailers, a message writer, a per-host
//! connection pool with idle reaping, a client driver with redirects and
//! wall-clock deadlines, and a per-connection server loop.
//!
//! See [`client`] and [`server`] for the two entry points.

#[macro_use]
extern crate log;

mod body;
pub mod buf_reader;
pub mod chunked;
mod error;
pub mod http11;
pub mod limit;

pub mod client;
pub mod pool;
pub mod server;

pub use body::Body;
pub use error::Error;

pub(crate) fn err_closed<T>() -> Result<T, Error> {
    use std::io;
    Err(io::Error::new(io::ErrorKind::NotConnected, "Connection is closed").into())
}
