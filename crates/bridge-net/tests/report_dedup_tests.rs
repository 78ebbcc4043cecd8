//! Incident report delivery and deduplication.

mod common;

use bridge_net::{
    BasicDialer, ConnectionState, Reporter, TlsDialer, TlsReport, TlsReporter, TrustedPinSet,
};
use common::{test_config, TestIdentity, TestServer};
use std::sync::Arc;
use std::time::Duration;

fn reporter(window: Duration) -> TlsReporter {
    let config = test_config("https://api.invalid").with_report_dedup_window(window);
    let basic: Arc<dyn TlsDialer> =
        Arc::new(BasicDialer::new("api.invalid:443", Duration::from_secs(2)).unwrap());
    TlsReporter::new(&config, TrustedPinSet::api_defaults(), basic)
}

fn state(identity: &TestIdentity) -> ConnectionState {
    ConnectionState {
        server_name: "api.invalid".to_string(),
        peer_certificates: vec![identity.cert_der.clone()],
        verified_chain: Vec::new(),
    }
}

fn report_uri(server: &TestServer) -> String {
    format!("https://{}/reports/tls", server.address())
}

#[tokio::test]
async fn test_same_incident_sent_once() {
    let server = TestServer::start().await;
    let reporter = reporter(Duration::from_secs(60));
    let state = state(&TestIdentity::generate());

    for _ in 0..5 {
        reporter.report_cert_issue(&report_uri(&server), "api.invalid", "443", &state);
    }
    reporter.flush().await;

    assert_eq!(server.requests().len(), 1);
    assert_eq!(reporter.sent_count(), 1);
}

#[tokio::test]
async fn test_different_incidents_each_sent() {
    let server = TestServer::start().await;
    let reporter = reporter(Duration::from_secs(60));
    let first = state(&TestIdentity::generate());
    let second = state(&TestIdentity::generate());

    reporter.report_cert_issue(&report_uri(&server), "api.invalid", "443", &first);
    reporter.report_cert_issue(&report_uri(&server), "api.invalid", "443", &second);
    reporter.report_cert_issue(&report_uri(&server), "api.invalid", "8443", &first);
    reporter.report_cert_issue(&report_uri(&server), "api.invalid", "443", &first);
    reporter.flush().await;

    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_incident_resent_after_window() {
    let server = TestServer::start().await;
    let reporter = reporter(Duration::from_millis(200));
    let state = state(&TestIdentity::generate());

    reporter.report_cert_issue(&report_uri(&server), "api.invalid", "443", &state);
    reporter.flush().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(reporter.sent_count(), 0);

    reporter.report_cert_issue(&report_uri(&server), "api.invalid", "443", &state);
    reporter.flush().await;

    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn test_report_request_format() {
    let server = TestServer::start().await;
    let reporter = reporter(Duration::from_secs(60));
    let identity = TestIdentity::generate();

    reporter.report_cert_issue(&report_uri(&server), "api.invalid", "443", &state(&identity));
    reporter.flush().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    assert_eq!(request.request_line(), "POST /reports/tls HTTP/1.1");
    assert_eq!(request.header("content-type").as_deref(), Some("application/json"));
    assert_eq!(request.header("user-agent").as_deref(), Some("bridge-test"));
    assert_eq!(
        request.header("x-pm-appversion").as_deref(),
        Some("bridge-test@1.0.0")
    );
    assert_eq!(
        request.header("host"),
        Some(server.address())
    );

    let report: TlsReport = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(report.hostname, "api.invalid");
    assert_eq!(report.port, "443");
    assert_eq!(report.noted_hostname, "api.invalid");
    assert!(!report.include_subdomains);
    assert_eq!(report.app_version, "bridge-test@1.0.0");
    assert_eq!(report.known_pins.len(), bridge_net::DEFAULT_API_PINS.len());
    assert_eq!(report.served_certificate_chain.len(), 1);
    assert!(report.validated_certificate_chain.is_empty());

    let served = pem::parse(&report.served_certificate_chain[0]).unwrap();
    assert_eq!(served.tag(), "CERTIFICATE");
    assert_eq!(served.contents(), identity.cert_der.as_ref());

    let observed = chrono::DateTime::parse_from_rfc3339(&report.date_time).unwrap();
    let expires = chrono::DateTime::parse_from_rfc3339(&report.effective_expiration_date).unwrap();
    assert_eq!((expires - observed).num_days(), 365);
}

#[tokio::test]
async fn test_unreachable_report_endpoint_is_contained() {
    let reporter = reporter(Duration::from_secs(60));
    let state = state(&TestIdentity::generate());
    let uri = format!("https://127.0.0.1:{}/reports/tls", common::unused_port());

    reporter.report_cert_issue(&uri, "api.invalid", "443", &state);
    tokio::time::timeout(Duration::from_secs(5), reporter.flush())
        .await
        .expect("failed send should finish");

    assert_eq!(reporter.sent_count(), 1);
}
