//! TLS client configuration.

use std::{
    fs::File,
    io::BufReader,
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use rustls::{client::Resumption, ClientConfig, RootCertStore};
use sluice_error::{generic_error, ErrorContext as _, GenericError};
use tracing::{debug, warn};

/// Root certificates loaded from the platform's native store, shared by every client in the process.
static PLATFORM_ROOT_CERT_STORE: OnceLock<Arc<RootCertStore>> = OnceLock::new();

const DEFAULT_MAX_TLS12_RESUMPTION_SESSIONS: usize = 8;

/// A TLS client configuration builder.
///
/// Server certificates are verified against either a user-supplied PEM bundle or the platform's native root store.
/// The AWS-LC cryptography provider is used for every configuration built here, without touching the process-wide
/// default provider.
///
/// ## Missing
///
/// - client authentication
#[derive(Clone, Debug, Default)]
pub struct ClientTLSConfigBuilder {
    max_tls12_resumption_sessions: Option<usize>,
    ca_cert_path: Option<PathBuf>,
}

impl ClientTLSConfigBuilder {
    /// Creates a new `ClientTLSConfigBuilder` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of TLS 1.2 sessions to cache.
    ///
    /// Defaults to 8.
    pub fn with_max_tls12_resumption_sessions(mut self, max: usize) -> Self {
        self.max_tls12_resumption_sessions = Some(max);
        self
    }

    /// Verifies server certificates against the PEM-encoded certificates in the file at `path` instead of the
    /// platform's root store.
    pub fn with_ca_cert_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Builds the client TLS configuration.
    ///
    /// # Errors
    ///
    /// If a CA certificate file was given and it cannot be read or holds no usable certificates, or if the
    /// cryptography provider rejects the default protocol versions, an error is returned.
    pub fn build(self) -> Result<ClientConfig, GenericError> {
        let root_cert_store = match &self.ca_cert_path {
            Some(path) => Arc::new(load_root_certificates_from_file(path)?),
            None => platform_root_certificates(),
        };

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .with_error_context(|| "Failed to select TLS protocol versions.")?
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        config.resumption = Resumption::in_memory_sessions(
            self.max_tls12_resumption_sessions
                .unwrap_or(DEFAULT_MAX_TLS12_RESUMPTION_SESSIONS),
        );

        Ok(config)
    }
}

fn load_root_certificates_from_file(path: &PathBuf) -> Result<RootCertStore, GenericError> {
    let file = File::open(path).with_error_context(|| format!("Failed to open CA certificate file '{}'.", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_error_context(|| format!("Failed to parse CA certificate file '{}'.", path.display()))?;

    let mut store = RootCertStore::empty();
    let (added, failed) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(generic_error!(
            "No usable certificates found in CA certificate file '{}' ({} rejected).",
            path.display(),
            failed
        ));
    }

    debug!(added, failed, path = %path.display(), "Loaded CA certificates from file.");
    Ok(store)
}

fn platform_root_certificates() -> Arc<RootCertStore> {
    let store = PLATFORM_ROOT_CERT_STORE.get_or_init(|| {
        let mut store = RootCertStore::empty();

        let result = rustls_native_certs::load_native_certs();
        for error in &result.errors {
            warn!(error = %error, "Failed to load certificate from platform store.");
        }

        let (added, failed) = store.add_parsable_certificates(result.certs);
        if added == 0 {
            // Plain HTTP endpoints still work, HTTPS ones will fail verification.
            warn!(failed, "No usable certificates found in platform root store.");
        } else {
            debug!(added, failed, "Loaded platform root certificates.");
        }

        Arc::new(store)
    });

    Arc::clone(store)
}
