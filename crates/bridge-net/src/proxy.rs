//! Proxy-switching dialer
//!
//! Dials to the API's direct address go to the current route. When such a
//! dial fails with a connectivity error and proxy use is allowed, a new
//! route is searched and the dial is retried once. Leaving the direct route
//! arms a timer that switches back after the proxy use period.

use crate::address::format_as_address;
use crate::cancel::CancelToken;
use crate::provider::{ProxyProvider, Route};
use crate::task::spawn_supervised;
use crate::tls::{TlsConnection, TlsDialer};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Where dials to the API currently go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMode {
    /// Straight to the API host
    Direct,
    /// Through a discovered candidate
    Proxied {
        /// Candidate `host:port`
        address: String,
    },
}

#[derive(Debug)]
struct RouteState {
    direct_address: String,
    mode: RouteMode,
    allow_proxy: bool,
    revert_at: Option<Instant>,
    // Bumped on every return to direct; a revert timer only fires for the
    // generation it was armed in.
    generation: u64,
    revert_task: Option<AbortHandle>,
}

impl RouteState {
    fn current_address(&self) -> &str {
        match &self.mode {
            RouteMode::Direct => &self.direct_address,
            RouteMode::Proxied { address } => address,
        }
    }

    fn reset_to_direct(&mut self) {
        self.mode = RouteMode::Direct;
        self.revert_at = None;
        self.generation += 1;
        if let Some(task) = self.revert_task.take() {
            task.abort();
        }
    }
}

/// Top-level dialer with proxy failover
pub struct ProxyDialer {
    dialer: Arc<dyn TlsDialer>,
    provider: Arc<ProxyProvider>,
    state: Arc<RwLock<RouteState>>,
    switching: tokio::sync::Mutex<()>,
    proxy_use_duration: Duration,
    tracker: TaskTracker,
}

impl ProxyDialer {
    /// Create a dialer for `host_url`; proxy use starts disallowed
    pub fn new(
        dialer: Arc<dyn TlsDialer>,
        provider: Arc<ProxyProvider>,
        host_url: &str,
        proxy_use_duration: Duration,
    ) -> Self {
        Self {
            dialer,
            provider,
            state: Arc::new(RwLock::new(RouteState {
                direct_address: format_as_address(host_url),
                mode: RouteMode::Direct,
                allow_proxy: false,
                revert_at: None,
                generation: 0,
                revert_task: None,
            })),
            switching: tokio::sync::Mutex::new(()),
            proxy_use_duration,
            tracker: TaskTracker::new(),
        }
    }

    /// Allow failover to discovered routes
    pub fn allow_proxy(&self) {
        info!("Allowing proxy use");
        self.state.write().allow_proxy = true;
    }

    /// Forbid failover and return to the direct route immediately
    pub fn disallow_proxy(&self) {
        info!("Disallowing proxy use");
        let mut state = self.state.write();
        state.allow_proxy = false;
        state.reset_to_direct();
    }

    /// Whether failover is allowed
    pub fn allows_proxy(&self) -> bool {
        self.state.read().allow_proxy
    }

    /// The API's direct `host:port`
    pub fn direct_address(&self) -> String {
        self.state.read().direct_address.clone()
    }

    /// Where API dials go right now
    pub fn current_address(&self) -> String {
        self.state.read().current_address().to_string()
    }

    /// Current route
    pub fn mode(&self) -> RouteMode {
        self.state.read().mode.clone()
    }

    /// Whether API dials are proxied
    pub fn is_proxied(&self) -> bool {
        matches!(self.state.read().mode, RouteMode::Proxied { .. })
    }

    /// When the current proxy route will be abandoned
    pub fn revert_at(&self) -> Option<Instant> {
        self.state.read().revert_at
    }

    /// Route discovery backing this dialer
    pub fn provider(&self) -> &Arc<ProxyProvider> {
        &self.provider
    }

    /// Search for a route and switch to it.
    ///
    /// Returns [`Error::NoConnection`] when the API itself answered: the
    /// dialer is back on the direct route, but the caller's failure was real.
    pub async fn switch_to_reachable_server(&self) -> Result<()> {
        let _switching = self.switching.lock().await;
        self.switch_locked().await
    }

    async fn switch_locked(&self) -> Result<()> {
        info!("Attempting to switch to a proxy");

        let route = self.provider.find_reachable_route().await?;

        let mut state = self.state.write();
        let address = match route {
            Route::Primary => state.direct_address.clone(),
            Route::Candidate(candidate) => format_as_address(&candidate),
        };

        if address == state.direct_address {
            info!("The API is reachable again; connection drop was only intermittent");
            state.reset_to_direct();
            return Err(Error::NoConnection);
        }

        if !state.allow_proxy {
            return Err(Error::ProxyNotAllowed);
        }

        info!(proxy = %address, "Switching to a proxy");

        if state.mode == RouteMode::Direct {
            self.arm_revert_timer(&mut state);
        }
        state.mode = RouteMode::Proxied { address };

        Ok(())
    }

    fn arm_revert_timer(&self, state: &mut RouteState) {
        if let Some(task) = state.revert_task.take() {
            task.abort();
        }

        let generation = state.generation;
        let duration = self.proxy_use_duration;
        let weak: Weak<RwLock<RouteState>> = Arc::downgrade(&self.state);

        state.revert_at = Some(Instant::now() + duration);
        state.revert_task = Some(spawn_supervised(&self.tracker, "proxy-revert", async move {
            tokio::time::sleep(duration).await;

            if let Some(state) = weak.upgrade() {
                let mut state = state.write();
                if state.generation == generation {
                    info!("Proxy use period elapsed, reverting to direct");
                    state.revert_task = None;
                    state.reset_to_direct();
                }
            }
            Ok(())
        }));
    }
}

#[async_trait]
impl TlsDialer for ProxyDialer {
    async fn dial_tls(
        &self,
        cancel: &CancelToken,
        network: &str,
        address: &str,
    ) -> Result<TlsConnection> {
        let (is_api, target) = {
            let state = self.state.read();
            if address == state.direct_address {
                (true, state.current_address().to_string())
            } else {
                (false, address.to_string())
            }
        };

        let err = match self.dialer.dial_tls(cancel, network, &target).await {
            Ok(conn) => return Ok(conn),
            Err(err) => err,
        };

        if !is_api || !self.allows_proxy() || !err.is_connectivity() || cancel.is_cancelled() {
            return Err(err);
        }

        debug!(address = %target, error = %err, "Dial failed, trying proxy");

        // Route state is only written once a search completes, so dropping the
        // search on cancellation leaves it untouched.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = async {
                let _switching = self.switching.lock().await;
                // Another dial may have switched routes while this one waited.
                if self.current_address() == target {
                    self.switch_locked().await?;
                }
                Ok::<(), Error>(())
            } => res?,
        }

        let target = self.current_address();
        self.dialer.dial_tls(cancel, network, &target).await
    }
}

impl Drop for ProxyDialer {
    fn drop(&mut self) {
        if let Some(task) = self.state.write().revert_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ProxyDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ProxyDialer")
            .field("direct_address", &state.direct_address)
            .field("mode", &state.mode)
            .field("allow_proxy", &state.allow_proxy)
            .finish()
    }
}
