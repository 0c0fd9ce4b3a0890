/// Encrypted, certificate-pinned transport
///
/// Electrum servers commonly run self-signed certificates, so trust is
/// established by pinning the leaf certificate (or its SHA-256 fingerprint)
/// rather than by a CA chain.
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::SyncError;
use crate::server::pool::split_host_port;
use crate::server::{Server, TransportKind, TrustAnchor};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone)]
enum CertPin {
    Der(CertificateDer<'static>),
    Sha256(String),
}

impl CertPin {
    fn matches(&self, cert: &CertificateDer<'_>) -> bool {
        match self {
            CertPin::Der(pinned) => pinned.as_ref() == cert.as_ref(),
            CertPin::Sha256(fingerprint) => fingerprint_der(cert.as_ref()) == *fingerprint,
        }
    }
}

/// Accepts exactly the pinned leaf certificate; with no pin it accepts
/// anything and only records what was presented.
#[derive(Debug)]
struct PinnedVerifier {
    pin: Option<CertPin>,
    presented: Mutex<Option<CertificateDer<'static>>>,
    provider: Arc<CryptoProvider>,
}

impl PinnedVerifier {
    fn new(pin: Option<CertPin>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            pin,
            presented: Mutex::new(None),
            provider,
        }
    }

    fn take_presented(&self) -> Option<CertificateDer<'static>> {
        self.presented
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.presented.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(end_entity.clone().into_owned());

        match &self.pin {
            None => Ok(ServerCertVerified::assertion()),
            Some(pin) if pin.matches(end_entity) => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(
                "server certificate does not match the pinned certificate".into(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
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
        crypto::verify_tls13_signature(
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

/// Open a byte stream to `server`, completing the TLS handshake if required.
pub async fn open(server: &Server, connect_timeout: Duration) -> Result<BoxedStream, SyncError> {
    let tcp = tcp_connect(&server.address, connect_timeout).await?;

    match server.transport {
        TransportKind::Plaintext => Ok(Box::new(tcp)),
        TransportKind::Tls => {
            let pin = match &server.trust_anchor {
                TrustAnchor::Certificate(pem) => {
                    CertPin::Der(parse_pem(pem).map_err(|e| {
                        SyncError::connect(&server.address, e)
                    })?)
                }
                TrustAnchor::Fingerprint(fp) => CertPin::Sha256(fp.clone()),
                TrustAnchor::None => {
                    return Err(SyncError::connect(
                        &server.address,
                        "TLS server has no pinned certificate",
                    ))
                }
            };
            let verifier = Arc::new(PinnedVerifier::new(Some(pin), default_provider()));
            let stream =
                tls_handshake(tcp, &server.address, verifier, connect_timeout).await?;
            Ok(Box::new(stream))
        }
    }
}

/// Fetch the leaf certificate a TLS server presents, PEM encoded.
pub async fn download_certificate(
    address: &str,
    connect_timeout: Duration,
) -> Result<String, SyncError> {
    let tcp = tcp_connect(address, connect_timeout).await?;
    let verifier = Arc::new(PinnedVerifier::new(None, default_provider()));
    tls_handshake(tcp, address, verifier.clone(), connect_timeout).await?;

    let cert = verifier
        .take_presented()
        .ok_or_else(|| SyncError::connect(address, "server presented no certificate"))?;
    log::info!(
        "Downloaded certificate from {} (sha256 {})",
        address,
        fingerprint_der(cert.as_ref())
    );
    Ok(encode_pem(cert.as_ref()))
}

async fn tcp_connect(address: &str, connect_timeout: Duration) -> Result<TcpStream, SyncError> {
    split_host_port(address)?;
    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| SyncError::connect(address, "connect timed out"))?
        .map_err(|e| SyncError::connect(address, e))?;
    tcp.set_nodelay(true)
        .map_err(|e| SyncError::connect(address, e))?;
    Ok(tcp)
}

async fn tls_handshake(
    tcp: TcpStream,
    address: &str,
    verifier: Arc<PinnedVerifier>,
    connect_timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SyncError> {
    let (host, _) = split_host_port(address)?;
    let server_name = ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| SyncError::connect(address, e))?;

    let config = ClientConfig::builder_with_provider(default_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::connect(address, e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| SyncError::connect(address, "TLS handshake timed out"))?
        .map_err(|e| SyncError::connect(address, e))
}

fn default_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn parse_pem(pem: &str) -> Result<CertificateDer<'static>, String> {
    let mut reader = pem.as_bytes();
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| "no certificate found in PEM".to_string())?
        .map_err(|e| format!("invalid PEM certificate: {}", e));
    cert
}

pub fn encode_pem(der: &[u8]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(64) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}
