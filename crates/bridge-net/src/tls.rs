//! TLS dialing
//!
//! [`BasicDialer`] opens TCP + TLS connections. Certificate validation runs
//! only for the canonical address; every other address is dialed without it
//! so that trust can be decided afterwards by a [`crate::PinChecker`].

use crate::address::split_host_port;
use crate::cancel::CancelToken;
use crate::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

static WEB_PKI_ROOTS: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
    Arc::new(RootCertStore::from_iter(
        webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
    ))
});

/// Anything that can open a TLS connection to `network`/`address`.
///
/// This is the only capability HTTP transports depend on.
#[async_trait]
pub trait TlsDialer: Send + Sync {
    /// Dial a TLS connection. `network` is `tcp`, `tcp4` or `tcp6`.
    async fn dial_tls(
        &self,
        cancel: &CancelToken,
        network: &str,
        address: &str,
    ) -> Result<TlsConnection>;
}

/// Handshake facts about an established connection
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// SNI / verification name used for the handshake
    pub server_name: String,
    /// Chain served by the peer, leaf first
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// Chain validated against the root store; empty when validation was skipped
    pub verified_chain: Vec<CertificateDer<'static>>,
}

impl ConnectionState {
    /// Leaf certificate served by the peer
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certificates.first()
    }

    /// Whether WebPKI validation ran for this connection
    pub fn is_verified(&self) -> bool {
        !self.verified_chain.is_empty()
    }
}

/// Established TLS connection
pub struct TlsConnection {
    stream: TlsStream<TcpStream>,
    state: ConnectionState,
}

impl TlsConnection {
    fn new(stream: TlsStream<TcpStream>, server_name: String, verified: bool) -> Self {
        let peer_certificates = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();
        let verified_chain = if verified {
            peer_certificates.clone()
        } else {
            Vec::new()
        };

        Self {
            stream,
            state: ConnectionState {
                server_name,
                peer_certificates,
                verified_chain,
            },
        }
    }

    /// Handshake state
    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    /// Remote socket address
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.get_ref().0.peer_addr()?)
    }

    /// Send close_notify and shut the socket down
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnection")
            .field("server_name", &self.state.server_name)
            .field("verified", &self.state.is_verified())
            .finish()
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn parse(network: &str) -> Result<Self> {
        match network {
            "tcp" => Ok(Self::Any),
            "tcp4" => Ok(Self::V4),
            "tcp6" => Ok(Self::V6),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// Plain TCP + TLS dialer
pub struct BasicDialer {
    canonical_address: String,
    verified: Arc<ClientConfig>,
    unverified: Arc<ClientConfig>,
    connect_timeout: Duration,
}

impl BasicDialer {
    /// Dialer validating `canonical_address` against the WebPKI roots
    pub fn new(canonical_address: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        Self::with_root_store(canonical_address, WEB_PKI_ROOTS.clone(), connect_timeout)
    }

    /// Dialer validating `canonical_address` against a custom root store
    pub fn with_root_store(
        canonical_address: impl Into<String>,
        roots: impl Into<Arc<RootCertStore>>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let provider = Arc::new(ring::default_provider());

        let mut verified = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("Failed to build TLS config: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        verified.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut unverified = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("Failed to build TLS config: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();
        unverified.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            canonical_address: canonical_address.into(),
            verified: Arc::new(verified),
            unverified: Arc::new(unverified),
            connect_timeout,
        })
    }

    /// Address whose certificate is validated
    pub fn canonical_address(&self) -> &str {
        &self.canonical_address
    }

    async fn connect(
        &self,
        family: Family,
        host: &str,
        port: u16,
        verify: bool,
    ) -> Result<TlsConnection> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::InvalidAddress(format!("invalid server name: {}", host)))?;

        let tcp = connect_tcp(family, host, port).await?;
        tcp.set_nodelay(true)?;

        let config = if verify {
            self.verified.clone()
        } else {
            self.unverified.clone()
        };
        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(map_handshake_error)?;

        Ok(TlsConnection::new(stream, host.to_string(), verify))
    }
}

#[async_trait]
impl TlsDialer for BasicDialer {
    async fn dial_tls(
        &self,
        cancel: &CancelToken,
        network: &str,
        address: &str,
    ) -> Result<TlsConnection> {
        let family = Family::parse(network)?;
        let (host, port) = split_host_port(address)?;
        let verify = address == self.canonical_address;

        debug!("Dialing {} (verify={})", address, verify);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.connect_timeout, self.connect(family, &host, port, verify)) => {
                res.map_err(|_| {
                    Error::Timeout(format!("dial {} exceeded {:?}", address, self.connect_timeout))
                })?
            }
        }
    }
}

async fn connect_tcp(family: Family, host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await?
        .filter(|addr| family.accepts(addr))
        .collect();

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {}", host),
        )
    })))
}

fn map_handshake_error(err: io::Error) -> Error {
    let rustls_err = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match rustls_err {
        Some(rustls::Error::InvalidCertificate(reason)) => {
            Error::Certificate(format!("{:?}", reason))
        }
        Some(other) => Error::Tls(other.to_string()),
        None => Error::Tls(err.to_string()),
    }
}

/// Accepts any certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
