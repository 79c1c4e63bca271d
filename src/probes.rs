//! Network probes backing the leaf checks.
//!
//! Each probe performs one bounded network exchange and reports success or a
//! [`ProbeError`] whose text becomes the check's failure reason.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest greeting line accepted from an SMTP server, terminator included.
const MAX_GREETING_LINE: u64 = 4096;

static VERIFIED_CONFIG: LazyLock<Result<Arc<ClientConfig>, rustls::Error>> =
    LazyLock::new(|| client_config(false).map(Arc::new));
static UNVERIFIED_CONFIG: LazyLock<Result<Arc<ClientConfig>, rustls::Error>> =
    LazyLock::new(|| client_config(true).map(Arc::new));

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("tls setup failed: {0}")]
    TlsConfig(#[from] rustls::Error),
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("smtp greeting failed: {0}")]
    Greeting(#[source] std::io::Error),
    #[error("unexpected smtp greeting: {0}")]
    UnexpectedGreeting(String),
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProbeError::Timeout(limit))?
}

/// Completes a TLS handshake against `address`.
#[derive(Debug, Clone)]
pub struct TlsProbe {
    pub address: String,
    pub insecure: bool,
    timeout: Duration,
}

impl TlsProbe {
    pub fn new(address: impl Into<String>, insecure: bool) -> Self {
        Self {
            address: address.into(),
            insecure,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self) -> Result<(), ProbeError> {
        let config = shared_config(self.insecure)?;
        let host = host_of(&self.address);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProbeError::ServerName(host.to_string()))?;

        bounded(self.timeout, async {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(ProbeError::Connect)?;
            let mut tls = TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(ProbeError::Handshake)?;
            let _ = tls.shutdown().await;
            Ok(())
        })
        .await
    }
}

/// Waits for a 220 greeting from an SMTP server at `address`.
#[derive(Debug, Clone)]
pub struct SmtpProbe {
    pub address: String,
    timeout: Duration,
}

impl SmtpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self) -> Result<(), ProbeError> {
        bounded(self.timeout, async {
            let mut stream = TcpStream::connect(&self.address)
                .await
                .map_err(ProbeError::Connect)?;
            let mut reader = BufReader::new(&mut stream);

            // A greeting may span several "220-" lines; "220 " ends it.
            loop {
                let mut line = String::new();
                let read = (&mut reader)
                    .take(MAX_GREETING_LINE)
                    .read_line(&mut line)
                    .await
                    .map_err(ProbeError::Greeting)?;
                if read == 0 {
                    return Err(ProbeError::UnexpectedGreeting(
                        "connection closed before greeting".into(),
                    ));
                }
                if !line.ends_with('\n') && read as u64 == MAX_GREETING_LINE {
                    return Err(ProbeError::UnexpectedGreeting(format!(
                        "greeting line exceeds {MAX_GREETING_LINE} bytes"
                    )));
                }
                let line = line.trim_end();
                match greeting_continues(line) {
                    Some(true) => {}
                    Some(false) => break,
                    None => return Err(ProbeError::UnexpectedGreeting(line.to_string())),
                }
            }

            let _ = reader.get_mut().write_all(b"QUIT\r\n").await;
            Ok(())
        })
        .await
    }
}

/// Classifies one greeting line: `Some(true)` for a "220-" continuation,
/// `Some(false)` for the final "220" line, `None` for anything else.
fn greeting_continues(line: &str) -> Option<bool> {
    let rest = line.strip_prefix("220")?;
    match rest.as_bytes().first() {
        None | Some(b' ') => Some(false),
        Some(b'-') => Some(true),
        Some(_) => None,
    }
}

fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn shared_config(insecure: bool) -> Result<Arc<ClientConfig>, ProbeError> {
    let config = if insecure { &*UNVERIFIED_CONFIG } else { &*VERIFIED_CONFIG };
    Ok(config.clone()?)
}

fn client_config(insecure: bool) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// Verifier for `insecure` checks: any certificate chain is accepted, but
/// handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
