//! Framed TCP (or any async byte stream) channels between host and executor.

mod connection;

pub use connection::{
    Connection, ConnectionInfo, ConnectionSender, ExecutorConnection, HostConnection, SendPermit,
};
