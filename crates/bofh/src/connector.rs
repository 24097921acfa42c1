//! Validating TLS connector.
//!
//! Hands out HTTPS clients whose TLS layer verifies the server certificate
//! chain against the configured trust anchor. Hostname matching is a
//! separate step that can be switched off.

use std::error::Error as StdError;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{verify_server_cert_signed_by_trust_anchor, verify_server_name};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::types::{BofhError, BofhResult};

/// Default connect/read/write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// PEM file with the trusted root certificates. `None` uses the bundled
    /// web PKI roots.
    pub ca_file: Option<PathBuf>,
    /// Whether the certificate must match the requested hostname.
    pub validate_hostname: bool,
    pub timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            validate_hostname: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Verifies the chain, then (optionally) the hostname.
#[derive(Debug)]
struct BofhCertVerifier {
    roots: Arc<RootCertStore>,
    validate_hostname: bool,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for BofhCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algorithms.all,
        )?;

        if self.validate_hostname {
            verify_server_name(&cert, server_name)?;
        } else {
            tracing::debug!("Hostname validation disabled, accepting certificate for {server_name:?}");
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds HTTPS clients that validate the server the way the config says.
pub struct Connector {
    tls: ClientConfig,
    timeout: Duration,
}

impl Connector {
    /// Build a connector. Fails with `CertificateError` if the trust anchor
    /// cannot be loaded.
    pub fn new(config: &ConnectorConfig) -> BofhResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = Arc::new(load_roots(config.ca_file.as_deref())?);

        let verifier = Arc::new(BofhCertVerifier {
            roots,
            validate_hostname: config.validate_hostname,
            algorithms: provider.signature_verification_algorithms,
        });

        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| BofhError::UnsupportedTransport(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(Self {
            tls,
            timeout: config.timeout,
        })
    }

    /// Channel to `host:port`: an HTTP/1.1 client with its own keep-alive
    /// pool. Nothing goes on the wire until the first request, so refused
    /// connections and bad certificates surface from that request.
    pub fn connect(&self, host: &str, port: u16) -> BofhResult<Client> {
        let client = Client::builder()
            .use_preconfigured_tls(self.tls.clone())
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .pool_max_idle_per_host(1)
            .tcp_nodelay(true)
            .user_agent(concat!("bofh/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BofhError::UnsupportedTransport(e.to_string()))?;

        tracing::debug!("New channel to {host}:{port}");
        Ok(client)
    }
}

/// Classify a failed request to `destination`.
pub fn request_error(destination: &str, err: &reqwest::Error) -> BofhError {
    match tls_error(err) {
        Some(tls @ rustls::Error::InvalidCertificate(_))
        | Some(tls @ rustls::Error::NoCertificatesPresented) => {
            BofhError::CertificateError(format!("{destination}: {tls}"))
        }
        Some(tls) => {
            BofhError::TransportFault(format!("TLS handshake with {destination} failed: {tls}"))
        }
        None if err.is_connect() => BofhError::ConnectionError(format!(
            "Cannot connect to {destination}: {}",
            root_cause(err)
        )),
        None if err.is_timeout() => {
            BofhError::TransportFault(format!("Request to {destination} timed out"))
        }
        None => BofhError::TransportFault(format!(
            "Request to {destination} failed: {}",
            root_cause(err)
        )),
    }
}

/// Find the rustls error behind a request failure. The TLS layer reports it
/// wrapped in an `io::Error`, whose `source()` skips the wrapped value.
fn tls_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(tls) = e
            .downcast_ref::<io::Error>()
            .and_then(|wrapped| wrapped.get_ref())
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Some(tls);
        }
        current = e.source();
    }
    None
}

fn root_cause(err: &(dyn StdError + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

/// Load trust anchors from a PEM file, or fall back to the web PKI roots.
fn load_roots(ca_file: Option<&Path>) -> BofhResult<RootCertStore> {
    let Some(path) = ca_file else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };

    let file = File::open(path).map_err(|e| {
        BofhError::CertificateError(format!("Cannot read trust anchor {}: {e}", path.display()))
    })?;

    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|e| {
            BofhError::CertificateError(format!("Bad PEM in {}: {e}", path.display()))
        })?;
        store.add(cert).map_err(|e| {
            BofhError::CertificateError(format!("Bad certificate in {}: {e}", path.display()))
        })?;
    }

    if store.is_empty() {
        return Err(BofhError::CertificateError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    tracing::debug!("Loaded {} trust anchors from {}", store.len(), path.display());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_missing_trust_anchor_file() {
        let config = ConnectorConfig {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            Connector::new(&config),
            Err(BofhError::CertificateError(_))
        ));
    }

    #[test]
    fn test_trust_anchor_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a certificate").unwrap();
        let config = ConnectorConfig {
            ca_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            Connector::new(&config),
            Err(BofhError::CertificateError(_))
        ));
    }

    #[test]
    fn test_default_roots_load() {
        let roots = load_roots(None).unwrap();
        assert!(!roots.is_empty());
    }

    #[test]
    fn test_tls_error_found_inside_io_error() {
        let inner = rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName);
        let wrapped = io::Error::new(io::ErrorKind::InvalidData, inner);
        assert!(matches!(
            tls_error(&wrapped),
            Some(rustls::Error::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_plain_io_error_has_no_tls_cause() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(tls_error(&err).is_none());
        assert_eq!(root_cause(&err), "refused");
    }

    #[test]
    fn test_connect_builds_client() {
        let connector = Connector::new(&ConnectorConfig::default()).unwrap();
        assert!(connector.connect("localhost", 8000).is_ok());
    }
}
