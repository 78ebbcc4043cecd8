//! Pinning TLS dialer
//!
//! Only returns connections whose leaf key is trusted. Every failed check is
//! reported and published to TLS issue subscribers.

use crate::address::split_host_port;
use crate::cancel::CancelToken;
use crate::checker::PinChecker;
use crate::report::{Reporter, TLS_REPORT_URI};
use crate::tls::{TlsConnection, TlsDialer};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Published when a connection fails its pin check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsIssue {
    /// Dialed host
    pub host: String,
    /// Dialed port
    pub port: u16,
}

/// Dialer wrapping another [`TlsDialer`] with a pin check
pub struct PinningDialer {
    dialer: Arc<dyn TlsDialer>,
    checker: Arc<dyn PinChecker>,
    reporter: Option<Arc<dyn Reporter>>,
    report_uri: String,
    issues: broadcast::Sender<TlsIssue>,
}

impl PinningDialer {
    /// Create a pinning dialer.
    ///
    /// Each subscriber buffers up to `issue_capacity` issues; a lagging
    /// subscriber loses the oldest ones.
    pub fn new(
        dialer: Arc<dyn TlsDialer>,
        checker: Arc<dyn PinChecker>,
        reporter: Option<Arc<dyn Reporter>>,
        issue_capacity: usize,
    ) -> Self {
        let (issues, _) = broadcast::channel(issue_capacity.max(1));
        Self {
            dialer,
            checker,
            reporter,
            report_uri: TLS_REPORT_URI.to_string(),
            issues,
        }
    }

    /// Post reports to `report_uri`
    pub fn with_report_uri(mut self, report_uri: impl Into<String>) -> Self {
        self.report_uri = report_uri.into();
        self
    }

    /// Report destination
    pub fn report_uri(&self) -> &str {
        &self.report_uri
    }

    /// Subscribe to TLS issues
    pub fn subscribe(&self) -> broadcast::Receiver<TlsIssue> {
        self.issues.subscribe()
    }
}

#[async_trait]
impl TlsDialer for PinningDialer {
    async fn dial_tls(
        &self,
        cancel: &CancelToken,
        network: &str,
        address: &str,
    ) -> Result<TlsConnection> {
        let (host, port) = split_host_port(address)?;
        let conn = self.dialer.dial_tls(cancel, network, address).await?;

        if let Err(err) = self.checker.check(conn.connection_state()) {
            warn!(address = %address, error = %err, "Rejecting connection");

            if let Some(reporter) = &self.reporter {
                reporter.report_cert_issue(
                    &self.report_uri,
                    &host,
                    &port.to_string(),
                    conn.connection_state(),
                );
            }

            // No subscribers is fine.
            let _ = self.issues.send(TlsIssue { host, port });

            return Err(err);
        }

        Ok(conn)
    }
}
