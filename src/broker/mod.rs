//! Module providing a loopback broker for tests and local demos.
//!
//! Production deployments talk to an external broker cluster through
//! [`TcpConnector`](crate::connection::tcp::TcpConnector); the loopback broker speaks the same
//! framed protocol over in-process streams.

pub mod in_memory;
