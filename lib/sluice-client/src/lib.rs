//! Asynchronous time-series ingestion client.
//!
//! Points are offered to a [`Writer`] without blocking, batched by size or time, encoded as protobuf, optionally
//! compressed, and delivered to an ingestion endpoint. Failed payloads are redriven from a bounded retry queue, and
//! every asynchronous failure is reported on a best-effort error channel.
//!
//! Two delivery flavors are available:
//!
//! - [`Client`] delivers each batch as an HTTP `PUT` to the broker.
//! - [`StreamClient`] discovers ingestion nodes from the broker and streams length-prefixed batches over TCP.

pub mod batcher;
pub mod buffer;
pub mod client;
pub mod config;
pub mod discovery;
pub mod encoding;
pub mod errors;
pub mod model;
pub mod retry;
pub mod sender;
mod task;
pub mod telemetry;
pub mod writer;

pub use self::client::{Client, ClientContext, StreamClient};
pub use self::config::{ClientConfiguration, Compression, TlsConfiguration};
pub use self::errors::{ClientError, ErrorKind, WriteError};
pub use self::model::{Field, FieldKind, Histogram, Point};
pub use self::writer::Writer;
