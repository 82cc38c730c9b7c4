//! I/O building blocks for the ingestion pipeline: payload compression, wire framing, TLS configuration, and the
//! HTTP client used for both data delivery and endpoint discovery.

pub mod compression;
pub mod framing;
pub mod net;
