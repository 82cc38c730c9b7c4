//! Ingestion node discovery.
//!
//! The [`AddressManager`] keeps the set of live ingestion nodes. A background task polls the broker at a fixed interval
//! and swaps in each successfully discovered list as a whole; readers always see a complete snapshot and never block.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{Request, StatusCode, Uri};
use http_body_util::Full;
use rand::seq::IndexedRandom as _;
use serde::Deserialize;
use sluice_io::net::client::http::{HttpClient, HttpClientError};
use snafu::{ResultExt as _, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    errors::{ConfigurationError, TransportError},
    task::spawn_traced_named,
};

const NODE_STATE_PATH: &str = "/broker/node/state";

/// Address of a single ingestion node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A source of ingestion endpoints.
pub trait EndpointSource: Send + Sync {
    /// Picks an endpoint to connect to.
    ///
    /// # Errors
    ///
    /// If no endpoint is available, an error is returned.
    fn random_next(&self) -> Result<Endpoint, TransportError>;
}

/// Maintains the live set of ingestion nodes.
pub struct AddressManager {
    endpoints: ArcSwap<Vec<Endpoint>>,
    shutdown: CancellationToken,
}

impl AddressManager {
    /// Creates a manager with a fixed set of endpoints and no background refresh.
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a manager that discovers nodes from the broker at `broker_url`.
    ///
    /// One discovery poll runs before this returns, so the manager is immediately queryable. If that poll fails, the
    /// manager starts out empty. Afterwards, the broker is polled every `interval` until the manager is dropped.
    ///
    /// # Errors
    ///
    /// If the discovery URL cannot be built from `broker_url`, an error is returned.
    pub async fn start(broker_url: &str, client: HttpClient, interval: Duration) -> Result<Arc<Self>, ConfigurationError> {
        let uri = discovery_uri(broker_url)?;
        let manager = Arc::new(Self::from_endpoints(Vec::new()));
        let poller = DiscoveryPoller { client, uri };

        poller.refresh(&manager).await;

        let weak = Arc::downgrade(&manager);
        let shutdown = manager.shutdown.clone();
        spawn_traced_named("address-manager", run_refresh_loop(poller, weak, shutdown, interval));

        Ok(manager)
    }

    /// Returns a uniformly random endpoint from the current set.
    ///
    /// # Errors
    ///
    /// If the set is empty, `NoAvailableNode` is returned.
    pub fn random_next(&self) -> Result<Endpoint, TransportError> {
        let endpoints = self.endpoints.load();
        endpoints
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(TransportError::NoAvailableNode)
    }

    /// Returns a copy of the current set.
    pub fn broker_address_list(&self) -> Vec<Endpoint> {
        self.endpoints.load().to_vec()
    }

    /// Replaces the current set.
    pub fn replace(&self, endpoints: Vec<Endpoint>) {
        self.endpoints.store(Arc::new(endpoints));
    }
}

impl EndpointSource for AddressManager {
    fn random_next(&self) -> Result<Endpoint, TransportError> {
        AddressManager::random_next(self)
    }
}

impl Drop for AddressManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_refresh_loop(
    poller: DiscoveryPoller, manager: Weak<AddressManager>, shutdown: CancellationToken, interval: Duration,
) {
    debug!(interval = ?interval, "Address refresh loop started.");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let Some(manager) = manager.upgrade() else { break };
                poller.refresh(&manager).await;
            }
        }
    }

    debug!("Address refresh loop stopped.");
}

fn discovery_uri(broker_url: &str) -> Result<Uri, ConfigurationError> {
    let raw = format!("{}{}", broker_url.trim_end_matches('/'), NODE_STATE_PATH);
    raw.parse::<Uri>().map_err(|e| ConfigurationError::InvalidBrokerUrl {
        url: broker_url.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
enum DiscoveryError {
    #[snafu(display("failed to build request: {}", source))]
    BuildRequest { source: http::Error },

    #[snafu(display("{}", source))]
    Poll { source: HttpClientError },

    #[snafu(display("broker responded with {}", status))]
    Status { status: StatusCode },

    #[snafu(display("failed to decode node list: {}", source))]
    Decode { source: serde_json::Error },

    #[snafu(display("broker returned no nodes"))]
    Empty,
}

#[derive(Deserialize)]
struct NodeDescriptor {
    ip: String,
    #[serde(rename = "tcpPort")]
    tcp_port: u16,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodeEntry {
    Nested { node: NodeDescriptor },
    Flat(NodeDescriptor),
}

impl From<NodeEntry> for Endpoint {
    fn from(entry: NodeEntry) -> Self {
        let (NodeEntry::Nested { node } | NodeEntry::Flat(node)) = entry;
        Endpoint::new(node.ip, node.tcp_port)
    }
}

fn parse_node_list(body: &[u8]) -> Result<Vec<Endpoint>, DiscoveryError> {
    let entries: Vec<NodeEntry> = serde_json::from_slice(body).context(Decode)?;
    if entries.is_empty() {
        return Err(DiscoveryError::Empty);
    }
    Ok(entries.into_iter().map(Endpoint::from).collect())
}

struct DiscoveryPoller {
    client: HttpClient,
    uri: Uri,
}

impl DiscoveryPoller {
    async fn poll(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let req = Request::get(self.uri.clone())
            .body(Full::new(Bytes::new()))
            .context(BuildRequest)?;
        let resp = self.client.send(req).await.context(Poll)?;
        if !resp.status().is_success() {
            return Err(DiscoveryError::Status { status: resp.status() });
        }
        parse_node_list(resp.body())
    }

    async fn refresh(&self, manager: &AddressManager) {
        match self.poll().await {
            Ok(endpoints) => {
                if manager.endpoints.load().as_slice() == endpoints.as_slice() {
                    debug!(nodes = endpoints.len(), "Ingestion node list unchanged.");
                } else {
                    info!(nodes = endpoints.len(), "Refreshed ingestion node list.");
                    manager.replace(endpoints);
                }
            }
            Err(e) => warn!(error = %e, uri = %self.uri, "Failed to refresh ingestion node list. Keeping previous list."),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        net::SocketAddr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use axum::{http::StatusCode as AxumStatusCode, response::IntoResponse, routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    async fn spawn_broker(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn client() -> HttpClient {
        HttpClient::builder()
            .with_request_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[test]
    fn empty_set_has_no_available_node() {
        let manager = AddressManager::from_endpoints(Vec::new());
        let err = manager.random_next().unwrap_err();
        assert!(matches!(err, TransportError::NoAvailableNode));
        assert_eq!(err.to_string(), "no available node");
    }

    #[test]
    fn single_endpoint_is_always_chosen() {
        let only = Endpoint::new("10.0.0.1", 2891);
        let manager = AddressManager::from_endpoints(vec![only.clone()]);
        for _ in 0..32 {
            assert_eq!(manager.random_next().unwrap(), only);
        }
    }

    #[test]
    fn replaced_endpoints_are_never_returned() {
        let manager = AddressManager::from_endpoints(vec![Endpoint::new("old-1", 1), Endpoint::new("old-2", 2)]);
        let fresh = vec![Endpoint::new("new-1", 3), Endpoint::new("new-2", 4)];
        manager.replace(fresh.clone());

        let fresh = fresh.into_iter().collect::<HashSet<_>>();
        for _ in 0..64 {
            assert!(fresh.contains(&manager.random_next().unwrap()));
        }
    }

    #[test]
    fn address_list_is_a_copy() {
        let manager = AddressManager::from_endpoints(vec![Endpoint::new("a", 1)]);
        let mut copy = manager.broker_address_list();
        copy.push(Endpoint::new("b", 2));

        assert_eq!(manager.broker_address_list(), vec![Endpoint::new("a", 1)]);
    }

    #[test]
    fn parses_flat_and_nested_descriptors() {
        let body = br#"[
            {"ip": "10.0.0.1", "tcpPort": 2891, "hostName": "ingest-1"},
            {"node": {"ip": "10.0.0.2", "tcpPort": 2892}, "online": true}
        ]"#;

        let endpoints = parse_node_list(body).unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::new("10.0.0.1", 2891), Endpoint::new("10.0.0.2", 2892)]
        );
    }

    #[test]
    fn rejects_empty_and_malformed_lists() {
        assert!(matches!(parse_node_list(b"[]"), Err(DiscoveryError::Empty)));
        assert!(matches!(parse_node_list(b"{\"ip\": 1}"), Err(DiscoveryError::Decode { .. })));
    }

    #[test]
    fn ipv6_endpoint_display() {
        assert_eq!(Endpoint::new("::1", 80).to_string(), "[::1]:80");
        assert_eq!(Endpoint::new("localhost", 80).to_string(), "localhost:80");
    }

    #[tokio::test]
    async fn start_polls_once_before_returning() {
        let router = Router::new().route(
            NODE_STATE_PATH,
            get(|| async { r#"[{"ip":"127.0.0.1","tcpPort":9000}]"# }),
        );
        let addr = spawn_broker(router).await;

        let manager = AddressManager::start(&format!("http://{}/", addr), client(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(manager.broker_address_list(), vec![Endpoint::new("127.0.0.1", 9000)]);
    }

    #[tokio::test]
    async fn failed_first_poll_starts_empty() {
        let router = Router::new().route(
            NODE_STATE_PATH,
            get(|| async { (AxumStatusCode::SERVICE_UNAVAILABLE, "down").into_response() }),
        );
        let addr = spawn_broker(router).await;

        let manager = AddressManager::start(&format!("http://{}", addr), client(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(manager.broker_address_list().is_empty());
        assert!(manager.random_next().is_err());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_list() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let router = Router::new().route(
            NODE_STATE_PATH,
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 => r#"[{"ip":"10.0.0.1","tcpPort":1}]"#.into_response(),
                        1 => "not json".into_response(),
                        2 => "[]".into_response(),
                        _ => r#"[{"ip":"10.0.0.2","tcpPort":2}]"#.into_response(),
                    }
                }
            }),
        );
        let addr = spawn_broker(router).await;

        let manager = AddressManager::start(&format!("http://{}", addr), client(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(manager.broker_address_list(), vec![Endpoint::new("10.0.0.1", 1)]);

        // Polls 1 and 2 fail, so the first list must survive until poll 3 replaces it.
        while polls.load(Ordering::SeqCst) < 3 {
            assert_eq!(manager.broker_address_list(), vec![Endpoint::new("10.0.0.1", 1)]);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.broker_address_list() != vec![Endpoint::new("10.0.0.2", 2)] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("list should eventually be replaced");
    }

    #[test]
    fn invalid_broker_url_is_rejected() {
        assert!(discovery_uri("not a url").is_err());
    }
}
