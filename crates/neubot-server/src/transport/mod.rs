//! Transport: connection handles with close notification, HTTP serving.

pub mod connection;
pub mod http;

pub use connection::{Connection, ConnectionIds};

#[cfg(test)]
pub(crate) use connection::test_connection;
