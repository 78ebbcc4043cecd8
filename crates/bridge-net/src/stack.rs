//! Assembled dialer stack
//!
//! Basic → pin check + reporter → pinning → route discovery → proxy.

use crate::checker::TlsPinChecker;
use crate::config::DialerConfig;
use crate::doh::{DohClient, DohLookup};
use crate::pinning::{PinningDialer, TlsIssue};
use crate::pins::TrustedPinSet;
use crate::provider::ProxyProvider;
use crate::proxy::ProxyDialer;
use crate::report::{Reporter, TlsReporter};
use crate::tls::{BasicDialer, TlsDialer};
use crate::transport::HttpTransport;
use crate::Result;
use rustls::RootCertStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Builder for [`DialerStack`]
pub struct DialerStackBuilder {
    config: DialerConfig,
    trusted_pins: Option<TrustedPinSet>,
    root_store: Option<RootCertStore>,
    doh: Option<Arc<dyn DohLookup>>,
}

impl DialerStackBuilder {
    /// Trust these pins instead of [`crate::DEFAULT_API_PINS`]
    pub fn trusted_pins(mut self, pins: TrustedPinSet) -> Self {
        self.trusted_pins = Some(pins);
        self
    }

    /// Validate the API host against this store instead of the WebPKI roots
    pub fn root_store(mut self, roots: RootCertStore) -> Self {
        self.root_store = Some(roots);
        self
    }

    /// Use this lookup instead of [`DohClient`]
    pub fn doh_lookup(mut self, doh: Arc<dyn DohLookup>) -> Self {
        self.doh = Some(doh);
        self
    }

    /// Build the stack
    pub fn build(self) -> Result<DialerStack> {
        let config = self.config;
        config.validate()?;

        let direct_address = config.direct_address();
        let basic = match self.root_store {
            Some(roots) => {
                BasicDialer::with_root_store(direct_address, roots, config.connect_timeout)?
            }
            None => BasicDialer::new(direct_address, config.connect_timeout)?,
        };
        let basic: Arc<dyn TlsDialer> = Arc::new(basic);

        let trusted_pins = self
            .trusted_pins
            .unwrap_or_else(TrustedPinSet::api_defaults);
        let doh: Arc<dyn DohLookup> = match self.doh {
            Some(doh) => doh,
            None => Arc::new(DohClient::new(config.doh_timeout)?),
        };

        let reporter = Arc::new(TlsReporter::new(
            &config,
            trusted_pins.clone(),
            basic.clone(),
        ));
        let report_sink: Arc<dyn Reporter> = reporter.clone();
        let pinning = Arc::new(
            PinningDialer::new(
                basic,
                Arc::new(TlsPinChecker::new(trusted_pins.clone())),
                Some(report_sink),
                config.issue_channel_capacity,
            )
            .with_report_uri(config.report_uri.clone()),
        );
        let provider = Arc::new(ProxyProvider::new(&config, pinning.clone(), doh));
        let proxy = Arc::new(ProxyDialer::new(
            pinning.clone(),
            provider,
            &config.host_url,
            config.proxy_use_duration,
        ));

        info!("Dialer stack ready for {}", config.direct_address());

        Ok(DialerStack {
            config,
            trusted_pins,
            reporter,
            pinning,
            proxy,
        })
    }
}

/// Every layer built from one [`DialerConfig`]
pub struct DialerStack {
    config: DialerConfig,
    trusted_pins: TrustedPinSet,
    reporter: Arc<TlsReporter>,
    pinning: Arc<PinningDialer>,
    proxy: Arc<ProxyDialer>,
}

impl DialerStack {
    /// Start building a stack
    pub fn builder(config: DialerConfig) -> DialerStackBuilder {
        DialerStackBuilder {
            config,
            trusted_pins: None,
            root_store: None,
            doh: None,
        }
    }

    /// Build with defaults for everything but the config
    pub fn new(config: DialerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Configuration the stack was built from
    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Live pin set shared by every layer
    pub fn trusted_pins(&self) -> &TrustedPinSet {
        &self.trusted_pins
    }

    /// Incident reporter
    pub fn reporter(&self) -> &Arc<TlsReporter> {
        &self.reporter
    }

    /// Pinning dialer, never proxied
    pub fn pinning_dialer(&self) -> Arc<PinningDialer> {
        self.pinning.clone()
    }

    /// Top-level dialer
    pub fn proxy_dialer(&self) -> Arc<ProxyDialer> {
        self.proxy.clone()
    }

    /// Subscribe to pin failures
    pub fn subscribe_tls_issues(&self) -> broadcast::Receiver<TlsIssue> {
        self.pinning.subscribe()
    }

    /// HTTP transport over the proxy dialer
    pub fn http_transport(&self) -> HttpTransport {
        HttpTransport::new(self.proxy.clone(), self.config.connect_timeout)
    }
}
