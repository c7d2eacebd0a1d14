//! Stevedore Gateway - RPC surface of the image engine.
//!
//! Newline-delimited JSON calls over a Unix domain socket, dispatched to the
//! image engine, with every failure reported as one of a fixed set of fault
//! kinds.

pub mod fault;
pub mod protocol;
pub mod server;
pub mod service;

pub use fault::{Fault, FaultKind};
pub use protocol::{Call, Reply};
pub use server::{serve_connection, GatewayServer};
pub use service::ImageService;
