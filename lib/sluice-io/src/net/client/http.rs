//! HTTP client.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt as _, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Builder, Client},
    rt::{TokioExecutor, TokioTimer},
};
use sluice_error::GenericError;
use snafu::{ResultExt as _, Snafu};

use super::super::tls::ClientTLSConfigBuilder;

/// HTTP client error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum HttpClientError {
    /// The request could not be sent, or no response was received.
    #[snafu(display("failed to send request: {}", source))]
    SendRequest {
        /// Underlying error.
        source: hyper_util::client::legacy::Error,
    },

    /// The response body could not be read.
    #[snafu(display("failed to read response body: {}", source))]
    ReadBody {
        /// Underlying error.
        source: hyper::Error,
    },

    /// The request did not complete within the configured timeout.
    #[snafu(display("request timed out after {:?}", timeout))]
    TimedOut {
        /// Configured request timeout.
        timeout: Duration,
    },
}

/// A fully-buffered HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    /// Returns the response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the response body as text, replacing invalid UTF-8 sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// An HTTP client.
///
/// Requests carry a fully-buffered body, and responses are read to completion before being returned. Connections are
/// pooled and reused, and both plain HTTP and HTTPS endpoints are supported.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    request_timeout: Option<Duration>,
}

impl HttpClient {
    /// Creates a new builder for configuring an HTTP client.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Sends a request to the server, and waits for the full response.
    ///
    /// The request timeout, if any, covers both waiting for the response head and reading the body.
    ///
    /// # Errors
    ///
    /// If the request cannot be sent, the body cannot be read, or the timeout elapses, an error is returned. Non-2xx
    /// responses are not errors at this level.
    pub async fn send(&self, req: Request<Full<Bytes>>) -> Result<HttpResponse, HttpClientError> {
        let exchange = async {
            let response = self.inner.request(req).await.context(SendRequest)?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await.context(ReadBody)?.to_bytes();

            Ok::<_, HttpClientError>(HttpResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => TimedOut { timeout }.fail(),
            },
            None => exchange.await,
        }
    }
}

/// An HTTP client builder.
///
/// # Defaults
///
/// - support for both HTTP and HTTPS (uses the platform's root certificates unless a CA file is configured)
/// - 30 second connect timeout, 30 second per-request timeout
/// - connection pool with a 45 second idle timeout and at most 5 idle connections per host
#[derive(Clone)]
pub struct HttpClientBuilder {
    hyper_builder: Builder,
    tls_builder: ClientTLSConfigBuilder,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl HttpClientBuilder {
    /// Sets the timeout when connecting to the remote host.
    ///
    /// Defaults to 30 seconds.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-request timeout.
    ///
    /// Defaults to 30 seconds.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Allow requests to run indefinitely.
    pub fn without_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    /// Sets the maximum number of idle connections per host.
    ///
    /// Defaults to 5.
    pub fn with_max_idle_conns_per_host(mut self, max: usize) -> Self {
        self.hyper_builder.pool_max_idle_per_host(max);
        self
    }

    /// Sets the TLS configuration.
    pub fn with_tls_config<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ClientTLSConfigBuilder) -> ClientTLSConfigBuilder,
    {
        self.tls_builder = f(self.tls_builder);
        self
    }

    /// Builds the `HttpClient`.
    ///
    /// # Errors
    ///
    /// If there was an error building the TLS configuration for the client, an error will be returned.
    pub fn build(self) -> Result<HttpClient, GenericError> {
        let tls_config = self.tls_builder.build()?;

        // HTTP must not be enforced, or wrapping in the HTTPS connector breaks.
        let mut http_connector = HttpConnector::new();
        http_connector.set_connect_timeout(Some(self.connect_timeout));
        http_connector.enforce_http(false);

        let https_connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http_connector);

        Ok(HttpClient {
            inner: self.hyper_builder.build(https_connector),
            request_timeout: self.request_timeout,
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        let mut hyper_builder = Builder::new(TokioExecutor::new());
        hyper_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(45));

        Self {
            hyper_builder,
            tls_builder: ClientTLSConfigBuilder::new(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}
