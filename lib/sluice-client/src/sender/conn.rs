use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sluice_io::framing::write_length_delimited;
use snafu::ResultExt as _;
use tokio::{io::AsyncWriteExt as _, net::TcpStream};
use tracing::{debug, info, warn};

use super::Transport;
use crate::{
    discovery::{Endpoint, EndpointSource},
    errors::{Framing, TransportError},
};

struct Connection {
    stream: TcpStream,
    endpoint: Endpoint,
}

/// Streams length-prefixed payloads over a persistent TCP connection.
///
/// The connection is opened lazily against an endpoint picked from the [`EndpointSource`], and is dropped on any write
/// error. Each delivery runs up to `retry_limit` rounds: a round either connects, when disconnected, or writes the
/// framed payload. The first successful write completes the delivery.
pub struct ConnTransport<S> {
    source: Arc<S>,
    conn: Option<Connection>,
    dial_timeout: Duration,
    retry_limit: usize,
    frame: BytesMut,
}

impl<S: EndpointSource> ConnTransport<S> {
    /// Creates a new, disconnected `ConnTransport`.
    pub fn new(source: Arc<S>, dial_timeout: Duration, retry_limit: usize) -> Self {
        Self {
            source,
            conn: None,
            dial_timeout,
            retry_limit,
            frame: BytesMut::new(),
        }
    }

    /// Returns `true` if a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let endpoint = self.source.random_next()?;

        let stream = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(endpoint.to_string())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { endpoint, source }),
            Err(_) => {
                return Err(TransportError::ConnectTimedOut {
                    endpoint,
                    timeout: self.dial_timeout,
                })
            }
        };

        info!(%endpoint, "Connected to ingestion node.");
        self.conn = Some(Connection { stream, endpoint });
        Ok(())
    }

    async fn close_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.stream.shutdown().await {
                warn!(endpoint = %conn.endpoint, error = %e, "Failed to cleanly close connection.");
            }
            info!(endpoint = %conn.endpoint, "Closed connection to ingestion node.");
        }
    }
}

#[async_trait]
impl<S: EndpointSource + 'static> Transport for ConnTransport<S> {
    async fn deliver(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.frame.clear();
        write_length_delimited(&payload, &mut self.frame).context(Framing)?;

        let mut last_error = None;
        for _ in 0..self.retry_limit {
            let Some(conn) = self.conn.as_mut() else {
                if let Err(e) = self.connect().await {
                    warn!(error = %e, "Failed to connect to ingestion node.");
                    last_error = Some(e);
                }
                continue;
            };

            match conn.stream.write_all(&self.frame).await {
                Ok(()) => {
                    if last_error.is_some() {
                        info!(endpoint = %conn.endpoint, "Delivered payload after reconnecting.");
                    }
                    return Ok(());
                }
                Err(source) => {
                    let endpoint = conn.endpoint.clone();
                    warn!(%endpoint, error = %source, "Failed to write to ingestion node. Reconnecting.");
                    self.close_connection().await;
                    last_error = Some(TransportError::Write { endpoint, source });
                }
            }
        }

        debug!(attempts = self.retry_limit, "Stream send attempts exhausted.");
        Err(match last_error {
            Some(last) => TransportError::AttemptsExhausted {
                attempts: self.retry_limit,
                last: Box::new(last),
            },
            None => TransportError::Unwritten {
                attempts: self.retry_limit,
            },
        })
    }

    async fn close(&mut self) {
        self.close_connection().await;
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use sluice_io::framing::LengthDelimitedFramer;
    use tokio::{io::AsyncReadExt as _, net::TcpListener};

    use super::*;
    use crate::discovery::AddressManager;

    async fn read_frames(mut stream: TcpStream, expected: usize) -> Vec<Bytes> {
        let mut framer = LengthDelimitedFramer::new(1024 * 1024);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        while frames.len() < expected {
            let n = stream.read_buf(&mut buf).await.unwrap();
            while let Some(frame) = framer.next_frame(&mut buf, n == 0).unwrap() {
                frames.push(frame);
            }
            if n == 0 {
                break;
            }
        }
        frames
    }

    fn manager_for(addr: std::net::SocketAddr) -> Arc<AddressManager> {
        Arc::new(AddressManager::from_endpoints(vec![Endpoint::new(
            addr.ip().to_string(),
            addr.port(),
        )]))
    }

    #[tokio::test]
    async fn connects_lazily_and_frames_payloads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            read_frames(stream, 2).await
        });

        let mut transport = ConnTransport::new(manager_for(addr), Duration::from_secs(1), 2);
        assert!(!transport.is_connected());

        transport.deliver(Bytes::from_static(b"first")).await.unwrap();
        assert!(transport.is_connected());
        transport.deliver(Bytes::from_static(b"second")).await.unwrap();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_connected());

        let frames = server.await.unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
    }

    #[tokio::test]
    async fn no_endpoints_exhausts_attempts() {
        let manager = Arc::new(AddressManager::from_endpoints(Vec::new()));
        let mut transport = ConnTransport::new(manager, Duration::from_secs(1), 3);

        let err = transport.deliver(Bytes::from_static(b"payload")).await.unwrap_err();
        match err {
            TransportError::AttemptsExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, TransportError::NoAvailableNode));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        // Nothing listens on a port freed by dropping its listener.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let mut transport = ConnTransport::new(manager_for(addr), Duration::from_secs(1), 2);

        let err = transport.deliver(Bytes::from_static(b"payload")).await.unwrap_err();
        match err {
            TransportError::AttemptsExhausted { last, .. } => {
                assert!(matches!(*last, TransportError::Connect { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn write_error_reconnects_to_refreshed_node() {
        // A node that accepts connections and immediately hangs up.
        let dropping = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dropping_addr = dropping.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = dropping.accept().await {
                drop(stream);
            }
        });

        let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let healthy_addr = healthy.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = healthy.accept().await.unwrap();
            read_frames(stream, 1).await
        });

        let manager = manager_for(dropping_addr);
        let mut transport = ConnTransport::new(Arc::clone(&manager), Duration::from_secs(1), 2);

        // Writes into a reset connection fail once the reset has been seen locally.
        let payload = Bytes::from(vec![0xAB; 64 * 1024]);
        let mut failure = None;
        for _ in 0..100 {
            match transport.deliver(payload.clone()).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        match failure.expect("writing to a dropped connection should eventually fail") {
            TransportError::AttemptsExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, TransportError::Write { .. }), "unexpected cause: {last}");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Once the node list is refreshed, a later reconnect lands on the healthy node.
        manager.replace(vec![Endpoint::new(healthy_addr.ip().to_string(), healthy_addr.port())]);
        for _ in 0..100 {
            let _ = transport.deliver(Bytes::from_static(b"after")).await;
            if server.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let frames = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("healthy node should receive a payload")
            .unwrap();
        assert_eq!(frames.first(), Some(&Bytes::from_static(b"after")));
        transport.close().await;
    }

    #[tokio::test]
    async fn single_round_only_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // With one round, a disconnected transport spends it connecting and never writes.
        let mut transport = ConnTransport::new(manager_for(addr), Duration::from_secs(1), 1);
        let err = transport.deliver(Bytes::from_static(b"payload")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unwritten { attempts: 1 }));
        assert!(transport.is_connected());

        // The next delivery reuses the connection.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            read_frames(stream, 1).await
        });
        transport.deliver(Bytes::from_static(b"payload")).await.unwrap();
        transport.close().await;

        assert_eq!(server.await.unwrap(), vec![Bytes::from_static(b"payload")]);
    }
}
