//! Dialer stack configuration

use crate::doh::DnsProvider;
use crate::report::TLS_REPORT_URI;
use crate::{Error, Result};
use std::time::Duration;

/// Default API host
pub const DEFAULT_HOST_URL: &str = "https://api.protonmail.ch";

/// TXT record name the route hints are published under
pub const DEFAULT_PROXY_QUERY: &str = "dMFYGSLTQOJXXI33ONVQWS3BOMNUA.protonpro.xyz";

/// Path pinged to decide whether a server is reachable
pub const DEFAULT_PING_PATH: &str = "/tests/ping";

/// Configuration for the whole dialer stack
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// API host URL; its `host:port` is the direct address
    pub host_url: String,
    /// Application version sent with incident reports
    pub app_version: String,
    /// User-Agent sent with incident reports
    pub user_agent: String,
    /// Where pin mismatch reports are posted
    pub report_uri: String,
    /// DoH resolvers raced during a candidate refresh
    pub doh_providers: Vec<DnsProvider>,
    /// TXT record name queried for candidate routes
    pub proxy_query: String,
    /// TCP connect + TLS handshake budget per dial
    pub connect_timeout: Duration,
    /// How long a proxy route is used before reverting to direct
    pub proxy_use_duration: Duration,
    /// Minimum spacing between route lookups
    pub lookup_cooldown: Duration,
    /// Budget for the whole DoH race
    pub cache_refresh_timeout: Duration,
    /// Budget for a single DoH request
    pub doh_timeout: Duration,
    /// Budget for one reachability ping
    pub can_reach_timeout: Duration,
    /// Identical reports within this window are sent once
    pub report_dedup_window: Duration,
    /// Buffered TLS issue notifications per subscriber
    pub issue_channel_capacity: usize,
    /// Relative path used for reachability pings
    pub ping_path: String,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            host_url: DEFAULT_HOST_URL.to_string(),
            app_version: format!("bridge-net@{}", env!("CARGO_PKG_VERSION")),
            user_agent: format!("bridge-net/{}", env!("CARGO_PKG_VERSION")),
            report_uri: TLS_REPORT_URI.to_string(),
            doh_providers: DnsProvider::defaults(),
            proxy_query: DEFAULT_PROXY_QUERY.to_string(),
            connect_timeout: Duration::from_secs(30),
            proxy_use_duration: Duration::from_secs(24 * 60 * 60),
            lookup_cooldown: Duration::from_secs(5),
            cache_refresh_timeout: Duration::from_secs(20),
            doh_timeout: Duration::from_secs(20),
            can_reach_timeout: Duration::from_secs(20),
            report_dedup_window: Duration::from_secs(24 * 60 * 60),
            issue_channel_capacity: 8,
            ping_path: DEFAULT_PING_PATH.to_string(),
        }
    }
}

impl DialerConfig {
    /// Create config for an API host
    pub fn new(host_url: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into(),
            ..Default::default()
        }
    }

    /// Set application version
    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = app_version.into();
        self
    }

    /// Set User-Agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set report URI
    pub fn with_report_uri(mut self, report_uri: impl Into<String>) -> Self {
        self.report_uri = report_uri.into();
        self
    }

    /// Replace DoH resolvers
    pub fn with_doh_providers(mut self, providers: Vec<DnsProvider>) -> Self {
        self.doh_providers = providers;
        self
    }

    /// Set TXT query name
    pub fn with_proxy_query(mut self, query: impl Into<String>) -> Self {
        self.proxy_query = query.into();
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set proxy use duration (revert timer)
    pub fn with_proxy_use_duration(mut self, duration: Duration) -> Self {
        self.proxy_use_duration = duration;
        self
    }

    /// Set lookup cooldown
    pub fn with_lookup_cooldown(mut self, cooldown: Duration) -> Self {
        self.lookup_cooldown = cooldown;
        self
    }

    /// Set DoH race and per-request budgets
    pub fn with_doh_timeouts(mut self, refresh: Duration, per_request: Duration) -> Self {
        self.cache_refresh_timeout = refresh;
        self.doh_timeout = per_request;
        self
    }

    /// Set reachability ping budget
    pub fn with_can_reach_timeout(mut self, timeout: Duration) -> Self {
        self.can_reach_timeout = timeout;
        self
    }

    /// Set report dedup window
    pub fn with_report_dedup_window(mut self, window: Duration) -> Self {
        self.report_dedup_window = window;
        self
    }

    /// Set issue channel capacity
    pub fn with_issue_channel_capacity(mut self, capacity: usize) -> Self {
        self.issue_channel_capacity = capacity;
        self
    }

    /// Set ping path
    pub fn with_ping_path(mut self, path: impl Into<String>) -> Self {
        self.ping_path = path.into();
        self
    }

    /// Direct `host:port` address of the API
    pub fn direct_address(&self) -> String {
        crate::address::format_as_address(&self.host_url)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.host_url.trim().is_empty() {
            return Err(Error::Config("host_url is empty".to_string()));
        }
        // Pings and dials always run over TLS.
        if self
            .host_url
            .get(..7)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
        {
            return Err(Error::Config(format!(
                "host_url must use https: {}",
                self.host_url
            )));
        }
        if self.doh_providers.is_empty() {
            return Err(Error::Config("no DoH providers configured".to_string()));
        }
        if self.proxy_query.trim().is_empty() {
            return Err(Error::Config("proxy_query is empty".to_string()));
        }
        if !self.ping_path.starts_with('/') {
            return Err(Error::Config(format!(
                "ping_path must start with '/': {}",
                self.ping_path
            )));
        }
        if self.issue_channel_capacity == 0 {
            return Err(Error::Config(
                "issue_channel_capacity must be positive".to_string(),
            ));
        }

        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("proxy_use_duration", self.proxy_use_duration),
            ("lookup_cooldown", self.lookup_cooldown),
            ("cache_refresh_timeout", self.cache_refresh_timeout),
            ("doh_timeout", self.doh_timeout),
            ("can_reach_timeout", self.can_reach_timeout),
            ("report_dedup_window", self.report_dedup_window),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }
}
