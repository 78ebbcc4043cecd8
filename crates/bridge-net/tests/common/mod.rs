//! Shared fixtures: throwaway TLS servers and scripted DoH resolvers.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_net::{
    pin_for_certificate, DialerConfig, DnsProvider, DohLookup, Error, Result,
};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Certificate + key served by a test server
#[derive(Clone)]
pub struct TestIdentity {
    pub cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
    pub pin: String,
}

impl TestIdentity {
    pub fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
        let pin = pin_for_certificate(&cert_der).unwrap();

        Self {
            cert_der,
            key_der: cert.serialize_private_key_der(),
            pin,
        }
    }

    /// Root store trusting this self-signed certificate
    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        roots
    }

    fn server_config(&self) -> Arc<ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![self.cert_der.clone()], key)
        .unwrap();
        Arc::new(config)
    }
}

/// Request received by a [`TestServer`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// In-process HTTPS server answering every request with an empty 200
pub struct TestServer {
    pub identity: TestIdentity,
    pub port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(TestIdentity::generate(), 0).await
    }

    pub async fn start_with(identity: TestIdentity, port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = TlsAcceptor::from(identity.server_config());

        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let requests = requests.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);

                    let acceptor = acceptor.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = serve(acceptor, stream, requests).await;
                    });
                }
            })
        };

        Self {
            identity,
            port,
            requests,
            connections,
            task,
        }
    }

    /// `127.0.0.1:port`, dialed without validation
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// `https://localhost:port`, matching the certificate name
    pub fn localhost_url(&self) -> String {
        format!("https://localhost:{}", self.port)
    }

    pub fn pin(&self) -> String {
        self.identity.pin.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let mut tls = acceptor.accept(stream).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = tls.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = tls.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    requests.lock().push(RecordedRequest {
        head,
        body: buf[header_end..].to_vec(),
    });

    tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await?;
    tls.shutdown().await?;
    Ok(())
}

/// A local port with nothing listening on it
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Scripted answer of one resolver
#[derive(Debug, Clone)]
pub enum MockAnswer {
    Records(Vec<String>, Duration),
    Fail(Duration),
}

/// [`DohLookup`] answering from a script keyed by provider URL
#[derive(Default)]
pub struct MockDoh {
    answers: Mutex<HashMap<String, MockAnswer>>,
    calls: AtomicUsize,
}

impl MockDoh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, provider: &DnsProvider, records: Vec<String>, delay: Duration) {
        self.answers
            .lock()
            .insert(provider.url().to_string(), MockAnswer::Records(records, delay));
    }

    pub fn fail(&self, provider: &DnsProvider, delay: Duration) {
        self.answers
            .lock()
            .insert(provider.url().to_string(), MockAnswer::Fail(delay));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DohLookup for MockDoh {
    async fn lookup_txt(&self, _query: &str, provider: &DnsProvider) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answers.lock().get(provider.url()).cloned();

        match answer {
            Some(MockAnswer::Records(records, delay)) => {
                tokio::time::sleep(delay).await;
                Ok(records)
            }
            Some(MockAnswer::Fail(delay)) => {
                tokio::time::sleep(delay).await;
                Err(Error::Dns(format!("{} failed", provider)))
            }
            None => Err(Error::Dns(format!("{} not scripted", provider))),
        }
    }
}

pub fn resolver_a() -> DnsProvider {
    DnsProvider::Custom("https://doh-a.invalid/dns-query".to_string())
}

pub fn resolver_b() -> DnsProvider {
    DnsProvider::Custom("https://doh-b.invalid/dns-query".to_string())
}

/// Short timeouts, two scripted resolvers, reports to a dead local port
pub fn test_config(host_url: &str) -> DialerConfig {
    DialerConfig::new(host_url)
        .with_app_version("bridge-test@1.0.0")
        .with_user_agent("bridge-test")
        .with_report_uri(format!("https://127.0.0.1:{}/reports/tls", unused_port()))
        .with_doh_providers(vec![resolver_a(), resolver_b()])
        .with_connect_timeout(Duration::from_secs(2))
        .with_can_reach_timeout(Duration::from_secs(2))
        .with_doh_timeouts(Duration::from_secs(2), Duration::from_secs(1))
        .with_lookup_cooldown(Duration::from_millis(100))
}
