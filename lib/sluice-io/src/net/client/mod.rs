//! Network clients.

pub mod http;
