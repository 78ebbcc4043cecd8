//! TLS pin failure reports
//!
//! Reports follow the RFC 7469 section 3 format and are posted as JSON.
//! Identical incidents are sent once per dedup window; sending happens in
//! the background and failures are only logged.

use crate::cancel::CancelToken;
use crate::config::DialerConfig;
use crate::pins::TrustedPinSet;
use crate::task::spawn_supervised;
use crate::tls::{ConnectionState, TlsDialer};
use crate::transport::HttpTransport;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use pem::{EncodeConfig, LineEnding, Pem};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Where TLS reports are posted by default
pub const TLS_REPORT_URI: &str = "https://reports.protonmail.ch/reports/tls";

const APP_VERSION_HEADER: HeaderName = HeaderName::from_static("x-pm-appversion");

/// One pin validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsReport {
    /// When the failure was observed (RFC 3339), set at send time
    pub date_time: String,
    /// Host of the failed request
    pub hostname: String,
    /// Port of the failed request
    pub port: String,
    /// Expiry of the noted pins (RFC 3339), set at send time
    pub effective_expiration_date: String,
    /// Always false
    pub include_subdomains: bool,
    /// Server name used for the handshake
    pub noted_hostname: String,
    /// PEM chain as served
    pub served_certificate_chain: Vec<String>,
    /// PEM chain as validated
    pub validated_certificate_chain: Vec<String>,
    /// Pins trusted when the failure happened
    pub known_pins: Vec<String>,
    /// Reporting application version
    pub app_version: String,
}

impl TlsReport {
    /// Build an unstamped report
    pub fn new(
        host: &str,
        port: &str,
        state: &ConnectionState,
        known_pins: Vec<String>,
        app_version: &str,
    ) -> Self {
        Self {
            date_time: String::new(),
            hostname: host.to_string(),
            port: port.to_string(),
            effective_expiration_date: String::new(),
            include_subdomains: false,
            noted_hostname: state.server_name.clone(),
            served_certificate_chain: pem_chain(&state.peer_certificates),
            validated_certificate_chain: pem_chain(&state.verified_chain),
            known_pins,
            app_version: app_version.to_string(),
        }
    }

    /// Set observation time and pin expiry (one year later)
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        let expires = now + chrono::Duration::days(365);
        self.date_time = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.effective_expiration_date = expires.to_rfc3339_opts(SecondsFormat::Secs, true);
    }

    /// Equal in everything but the timestamps
    pub fn same_incident(&self, other: &TlsReport) -> bool {
        self.hostname == other.hostname
            && self.port == other.port
            && self.include_subdomains == other.include_subdomains
            && self.noted_hostname == other.noted_hostname
            && self.served_certificate_chain == other.served_certificate_chain
            && self.validated_certificate_chain == other.validated_certificate_chain
            && self.known_pins == other.known_pins
            && self.app_version == other.app_version
    }
}

fn pem_chain(certs: &[CertificateDer<'static>]) -> Vec<String> {
    certs
        .iter()
        .map(|cert| {
            let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
            pem::encode_config(&Pem::new("CERTIFICATE", cert.to_vec()), config)
        })
        .collect()
}

/// Receives pin failures
pub trait Reporter: Send + Sync {
    /// Report a failure; must not block the caller
    fn report_cert_issue(&self, report_uri: &str, host: &str, port: &str, state: &ConnectionState);
}

/// Reporter posting deduplicated [`TlsReport`]s
pub struct TlsReporter {
    app_version: String,
    user_agent: String,
    trusted_pins: TrustedPinSet,
    dedup_window: Duration,
    sent: Mutex<Vec<(TlsReport, Instant)>>,
    transport: HttpTransport,
    tracker: TaskTracker,
}

impl TlsReporter {
    /// Create a reporter sending through `dialer`.
    ///
    /// `dialer` must not be the pinning dialer whose failures are reported.
    pub fn new(config: &DialerConfig, trusted_pins: TrustedPinSet, dialer: Arc<dyn TlsDialer>) -> Self {
        Self {
            app_version: config.app_version.clone(),
            user_agent: config.user_agent.clone(),
            trusted_pins,
            dedup_window: config.report_dedup_window,
            sent: Mutex::new(Vec::new()),
            transport: HttpTransport::new(dialer, config.connect_timeout),
            tracker: TaskTracker::new(),
        }
    }

    /// Reports recorded inside the dedup window
    pub fn sent_count(&self) -> usize {
        let now = Instant::now();
        self.sent
            .lock()
            .iter()
            .filter(|(_, at)| now.duration_since(*at) < self.dedup_window)
            .count()
    }

    /// Wait for every in-flight send
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Record `report` unless the same incident was sent within the window
    fn record_if_new(&self, report: &TlsReport) -> bool {
        let now = Instant::now();
        let mut sent = self.sent.lock();

        sent.retain(|(_, at)| now.duration_since(*at) < self.dedup_window);
        if sent.iter().any(|(r, _)| r.same_incident(report)) {
            return false;
        }

        sent.push((report.clone(), now));
        true
    }
}

impl Reporter for TlsReporter {
    fn report_cert_issue(&self, report_uri: &str, host: &str, port: &str, state: &ConnectionState) {
        let report = TlsReport::new(
            host,
            port,
            state,
            self.trusted_pins.snapshot(),
            &self.app_version,
        );

        if !self.record_if_new(&report) {
            debug!("TLS report for {}:{} already sent", host, port);
            return;
        }

        info!(host = %host, port = %port, "Sending TLS report");

        let transport = self.transport.clone();
        let report_uri = report_uri.to_string();
        let user_agent = self.user_agent.clone();
        let app_version = self.app_version.clone();
        spawn_supervised(&self.tracker, "tls-report", async move {
            send_report(&transport, &report_uri, report, &user_agent, &app_version).await
        });
    }
}

async fn send_report(
    transport: &HttpTransport,
    report_uri: &str,
    mut report: TlsReport,
    user_agent: &str,
    app_version: &str,
) -> Result<()> {
    report.stamp(Utc::now());

    let body = serde_json::to_vec(&report)
        .map_err(|e| Error::Http(format!("Failed to encode TLS report: {}", e)))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent)
            .map_err(|e| Error::Http(format!("Invalid User-Agent: {}", e)))?,
    );
    headers.insert(
        APP_VERSION_HEADER,
        HeaderValue::from_str(app_version)
            .map_err(|e| Error::Http(format!("Invalid app version: {}", e)))?,
    );

    let response = transport
        .post_json(&CancelToken::new(), report_uri, headers, body)
        .await
        .map_err(|e| Error::Http(format!("Failed to send TLS report: {}", e)))?;

    if response.status != StatusCode::OK {
        warn!(status = %response.status, "TLS report rejected");
    } else {
        debug!("TLS report accepted");
    }

    Ok(())
}
