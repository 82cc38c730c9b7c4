use ::http::{
    header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT},
    HeaderValue, Method, Request, Uri,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use sluice_io::net::client::http::HttpClient;
use snafu::ResultExt as _;
use url::form_urlencoded;

use super::Transport;
use crate::errors::{BuildRequest, ConfigurationError, Http, TransportError};

const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

/// Builds the write endpoint for `database` under the broker at `broker_base`.
pub(crate) fn write_uri(broker_base: &str, database: &str) -> Result<Uri, ConfigurationError> {
    if database.is_empty() {
        return Err(ConfigurationError::InvalidDatabase {
            database: database.to_string(),
        });
    }

    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("db", database)
        .finish();
    format!("{}/api/v1/write?{}", broker_base, query)
        .parse::<Uri>()
        .map_err(|_| ConfigurationError::InvalidDatabase {
            database: database.to_string(),
        })
}

/// Delivers each payload as an HTTP `PUT` to the broker's write endpoint.
///
/// Any transport failure or non-success status fails the delivery. For non-success statuses, the response body is
/// kept as the error detail.
pub struct HttpTransport {
    client: HttpClient,
    write_uri: Uri,
    user_agent: HeaderValue,
    content_encoding: Option<HeaderValue>,
}

impl HttpTransport {
    /// Creates a new `HttpTransport`.
    ///
    /// `content_encoding` must describe how payloads handed to [`deliver`][Transport::deliver] are encoded.
    pub fn new(
        client: HttpClient, write_uri: Uri, user_agent: HeaderValue, content_encoding: Option<HeaderValue>,
    ) -> Self {
        Self {
            client,
            write_uri,
            user_agent,
            content_encoding,
        }
    }

    fn build_request(&self, payload: Bytes) -> Result<Request<Full<Bytes>>, TransportError> {
        let mut builder = Request::builder()
            .method(Method::PUT)
            .uri(self.write_uri.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_PROTOBUF))
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(content_encoding) = &self.content_encoding {
            builder = builder.header(CONTENT_ENCODING, content_encoding.clone());
        }

        builder.body(Full::new(payload)).context(BuildRequest)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let req = self.build_request(payload)?;
        let resp = self.client.send(req).await.context(Http)?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: resp.status(),
                body: resp.body_text(),
            })
        }
    }
}
