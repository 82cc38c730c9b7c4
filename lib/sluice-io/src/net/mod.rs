//! Networking primitives.

pub mod client;
pub mod tls;
