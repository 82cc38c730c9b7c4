//! Client entry points.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use http::HeaderValue;
use sluice_io::{compression::CompressionScheme, net::client::http::HttpClient};
use snafu::ResultExt as _;
use tracing::info;

use crate::{
    config::ClientConfiguration,
    discovery::AddressManager,
    errors::{ClientError, Configuration, ConfigurationError, HttpClient as HttpClientFailed},
    sender::{write_uri, ConnTransport, HttpTransport},
    writer::Writer,
};

/// Process-wide client identity, built once and shared by every writer.
#[derive(Clone, Debug)]
pub struct ClientContext {
    version: &'static str,
    user_agent: HeaderValue,
}

impl ClientContext {
    /// Creates the default context, identifying as `sluice-client/<version> (<os>; <arch>)`.
    pub fn new() -> Self {
        let version = env!("CARGO_PKG_VERSION");
        let user_agent = format!(
            "sluice-client/{} ({}; {})",
            version,
            std::env::consts::OS,
            std::env::consts::ARCH
        );

        Self {
            version,
            user_agent: HeaderValue::from_str(&user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("sluice-client")),
        }
    }

    /// Returns the client version.
    pub fn version(&self) -> &'static str {
        self.version
    }

    /// Returns the `User-Agent` header value sent with every request.
    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the databases a client has handed out writers for.
struct DatabaseRegistry {
    limit: usize,
    databases: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl DatabaseRegistry {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            databases: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Records `database`, unless the client is closed or a new database would exceed the limit.
    fn register(&self, database: &str) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ClientClosed);
        }

        let mut databases = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        if !databases.contains(database) {
            if databases.len() >= self.limit {
                return Err(ClientError::TooManyDatabases { limit: self.limit });
            }
            databases.insert(database.to_string());
        }
        Ok(())
    }

    /// Marks the client closed. Returns `false` if it already was.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

fn build_http_client(
    config: &ClientConfiguration, request_timeout: std::time::Duration,
) -> Result<HttpClient, ConfigurationError> {
    let ca_cert_path = config.tls.ca_cert_path.clone();
    HttpClient::builder()
        .with_request_timeout(request_timeout)
        .with_tls_config(|tls| match ca_cert_path {
            Some(path) => tls.with_ca_cert_path(path),
            None => tls,
        })
        .build()
        .context(HttpClientFailed)
}

/// Client writing to the broker over HTTP.
///
/// Each [`Writer`] it hands out `PUT`s its batches to `{broker_url}/api/v1/write?db={database}`, compressed according
/// to the configuration.
pub struct Client {
    config: Arc<ClientConfiguration>,
    context: Arc<ClientContext>,
    http: HttpClient,
    databases: DatabaseRegistry,
}

impl Client {
    /// Creates a new client with the default [`ClientContext`].
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the HTTP client cannot be built, an error is returned.
    pub fn new(config: ClientConfiguration) -> Result<Self, ConfigurationError> {
        Self::with_context(config, ClientContext::new())
    }

    /// Creates a new client with the given context.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the HTTP client cannot be built, an error is returned.
    pub fn with_context(config: ClientConfiguration, context: ClientContext) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let http = build_http_client(&config, config.request_timeout())?;

        Ok(Self {
            databases: DatabaseRegistry::new(config.database_limit),
            config: Arc::new(config),
            context: Arc::new(context),
            http,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfiguration {
        &self.config
    }

    /// Starts a writer for `database`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the database name is empty or cannot be used in the write URL, if the client is closed, or if the database
    /// would exceed the configured database limit, an error is returned.
    pub fn writer(&self, database: &str) -> Result<Writer, ClientError> {
        let uri = write_uri(self.config.broker_base(), database).context(Configuration)?;
        self.databases.register(database)?;
        let scheme = self.config.compression.scheme();
        let transport = HttpTransport::new(
            self.http.clone(),
            uri,
            self.context.user_agent().clone(),
            scheme.content_encoding(),
        );

        Ok(Writer::spawn(database, &self.config, transport, scheme))
    }

    /// Closes the client.
    ///
    /// Later calls to [`writer`][Self::writer] fail. Writers already handed out keep running until they are closed.
    pub fn close(&self) {
        if self.databases.close() {
            info!("Client closed.");
        }
    }
}

/// Client streaming batches over TCP to ingestion nodes discovered from the broker.
///
/// Payloads are framed with a 4-byte little-endian length prefix and are never compressed.
pub struct StreamClient {
    config: Arc<ClientConfiguration>,
    manager: Arc<AddressManager>,
    databases: DatabaseRegistry,
}

impl StreamClient {
    /// Creates a new client, discovering ingestion nodes from the configured broker.
    ///
    /// One discovery poll completes before this returns. A failed poll is logged and leaves the node list empty; the
    /// background refresh keeps trying.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the discovery HTTP client cannot be built, an error is returned.
    pub async fn new(config: ClientConfiguration) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let http = build_http_client(&config, config.sync_address_timeout())?;
        let manager = AddressManager::start(config.broker_base(), http, config.sync_address_interval()).await?;

        info!(
            nodes = manager.broker_address_list().len(),
            "Stream client started."
        );
        Ok(Self {
            databases: DatabaseRegistry::new(config.database_limit),
            config: Arc::new(config),
            manager,
        })
    }

    /// Creates a new client that takes its ingestion nodes from an existing address manager.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn with_address_manager(
        config: ClientConfiguration, manager: Arc<AddressManager>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            databases: DatabaseRegistry::new(config.database_limit),
            config: Arc::new(config),
            manager,
        })
    }

    /// Returns the address manager.
    pub fn address_manager(&self) -> &Arc<AddressManager> {
        &self.manager
    }

    /// Starts a writer for `database`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the database name is empty, if the client is closed, or if the database would exceed the configured database
    /// limit, an error is returned.
    pub fn writer(&self, database: &str) -> Result<Writer, ClientError> {
        if database.is_empty() {
            return Err(ClientError::Configuration {
                source: ConfigurationError::InvalidDatabase {
                    database: database.to_string(),
                },
            });
        }
        self.databases.register(database)?;

        let transport = ConnTransport::new(
            Arc::clone(&self.manager),
            self.config.dial_timeout(),
            self.config.retry_limit,
        );
        Ok(Writer::spawn(database, &self.config, transport, CompressionScheme::noop()))
    }

    /// Closes the client.
    ///
    /// Later calls to [`writer`][Self::writer] fail. Writers already handed out keep running until they are closed.
    pub fn close(&self) {
        if self.databases.close() {
            info!("Stream client closed.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_names_client_and_platform() {
        let context = ClientContext::new();
        let user_agent = context.user_agent().to_str().unwrap();

        assert!(user_agent.starts_with(&format!("sluice-client/{} (", context.version())));
        assert!(user_agent.contains(std::env::consts::OS));
        assert!(user_agent.ends_with(&format!("{})", std::env::consts::ARCH)));
    }

    #[test]
    fn invalid_configuration_fails_fast() {
        assert!(matches!(
            Client::new(ClientConfiguration::new("")),
            Err(ConfigurationError::InvalidBrokerUrl { .. })
        ));
        assert!(matches!(
            Client::new(ClientConfiguration::new("http://broker").with_batch_size(0)),
            Err(ConfigurationError::InvalidSetting { .. })
        ));
    }

    #[tokio::test]
    async fn writer_requires_database() {
        let client = Client::new(ClientConfiguration::new("http://127.0.0.1:1")).unwrap();
        assert!(matches!(
            client.writer(""),
            Err(ClientError::Configuration {
                source: ConfigurationError::InvalidDatabase { .. }
            })
        ));

        let manager = Arc::new(AddressManager::from_endpoints(Vec::new()));
        let config = ClientConfiguration::new("http://127.0.0.1:1");
        let stream = StreamClient::with_address_manager(config, manager).unwrap();
        assert!(matches!(
            stream.writer(""),
            Err(ClientError::Configuration {
                source: ConfigurationError::InvalidDatabase { .. }
            })
        ));
    }

    #[tokio::test]
    async fn database_limit_counts_distinct_databases() {
        let config = ClientConfiguration::new("http://127.0.0.1:1").with_database_limit(2);
        let client = Client::new(config).unwrap();

        let first = client.writer("db1").unwrap();
        let again = client.writer("db1").unwrap();
        let second = client.writer("db2").unwrap();
        assert!(matches!(
            client.writer("db3"),
            Err(ClientError::TooManyDatabases { limit: 2 })
        ));

        for writer in [first, again, second] {
            writer.close().await;
        }
    }

    #[tokio::test]
    async fn closed_client_hands_out_no_writers() {
        let manager = Arc::new(AddressManager::from_endpoints(Vec::new()));
        let config = ClientConfiguration::new("http://127.0.0.1:1");
        let client = StreamClient::with_address_manager(config, manager).unwrap();
        let writer = client.writer("db1").unwrap();

        client.close();
        client.close();
        assert!(matches!(client.writer("db1"), Err(ClientError::ClientClosed)));
        assert!(matches!(client.writer("db2"), Err(ClientError::ClientClosed)));

        // Writers handed out before the close keep accepting points.
        writer.add_point(crate::Point::new("cpu").with_field(crate::Field::sum("value", 1.0)));
        writer.close().await;
    }
}
