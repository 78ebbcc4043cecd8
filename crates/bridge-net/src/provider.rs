//! Alternate route discovery
//!
//! Candidate hosts are published as TXT records and fetched over DoH. A
//! route is only returned when a ping through the pinning dialer succeeds,
//! so an unreachable or untrusted candidate is never chosen.

use crate::address::ensure_scheme;
use crate::cancel::CancelToken;
use crate::config::DialerConfig;
use crate::doh::{DnsProvider, DohLookup};
use crate::tls::TlsDialer;
use crate::transport::HttpTransport;
use crate::{Error, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of a route search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The API host itself answered
    Primary,
    /// A discovered candidate answered and is trusted
    Candidate(String),
}

/// Last successful candidate refresh
#[derive(Debug, Clone, Default)]
pub struct ProxyCache {
    /// Candidates in the order the resolver returned them
    pub candidates: Vec<String>,
    /// When the candidates were fetched
    pub fetched_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct ProviderState {
    last_lookup: Option<Instant>,
    cache: ProxyCache,
}

/// Finds a reachable, trusted route to the API
pub struct ProxyProvider {
    transport: HttpTransport,
    doh: Arc<dyn DohLookup>,
    host_url: String,
    providers: Vec<DnsProvider>,
    query: String,
    ping_path: String,
    lookup_cooldown: Duration,
    cache_refresh_timeout: Duration,
    state: Mutex<ProviderState>,
}

impl ProxyProvider {
    /// Create a provider pinging through `dialer`, which must check pins
    pub fn new(config: &DialerConfig, dialer: Arc<dyn TlsDialer>, doh: Arc<dyn DohLookup>) -> Self {
        Self {
            transport: HttpTransport::new(dialer, config.can_reach_timeout),
            doh,
            host_url: config.host_url.clone(),
            providers: config.doh_providers.clone(),
            query: config.proxy_query.clone(),
            ping_path: config.ping_path.clone(),
            lookup_cooldown: config.lookup_cooldown,
            cache_refresh_timeout: config.cache_refresh_timeout,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Current cache contents
    pub fn cache(&self) -> ProxyCache {
        self.state.lock().cache.clone()
    }

    /// Find a route, preferring the API host.
    ///
    /// Rejected with [`Error::LookupTooSoon`] inside the cooldown, without
    /// touching the network. The API ping and the candidate refresh always
    /// both complete before a decision is made.
    pub async fn find_reachable_route(&self) -> Result<Route> {
        debug!("Trying to find a reachable server");

        {
            let mut state = self.state.lock();
            let now = Instant::now();
            if let Some(last) = state.last_lookup {
                if now.duration_since(last) < self.lookup_cooldown {
                    return Err(Error::LookupTooSoon);
                }
            }
            state.last_lookup = Some(now);
        }

        let (api_reachable, refreshed) =
            tokio::join!(self.can_reach(&self.host_url), self.refresh_cache());

        if api_reachable {
            return Ok(Route::Primary);
        }

        for candidate in refreshed? {
            if self.can_reach(&candidate).await {
                return Ok(Route::Candidate(candidate));
            }
        }

        Err(Error::NoReachableServer)
    }

    /// Race every DoH resolver; the first answer replaces the cache
    pub async fn refresh_cache(&self) -> Result<Vec<String>> {
        info!("Refreshing proxy cache");

        let race = async {
            let mut lookups: FuturesUnordered<_> = self
                .providers
                .iter()
                .map(|provider| async move {
                    (provider, self.doh.lookup_txt(&self.query, provider).await)
                })
                .collect();

            while let Some((provider, result)) = lookups.next().await {
                match result {
                    Ok(candidates) => return Ok(candidates),
                    Err(e) => warn!(provider = %provider, error = %e, "DoH lookup failed"),
                }
            }

            Err(Error::Dns("every DoH provider failed".to_string()))
        };

        let candidates = tokio::time::timeout(self.cache_refresh_timeout, race)
            .await
            .map_err(|_| Error::Timeout("timed out while refreshing proxy cache".to_string()))??;

        let mut state = self.state.lock();
        state.cache = ProxyCache {
            candidates: candidates.clone(),
            fetched_at: Some(Instant::now()),
        };

        Ok(candidates)
    }

    /// Whether `url` answers the ping path through the pinning dialer
    pub async fn can_reach(&self, url: &str) -> bool {
        let base = ensure_scheme(url);
        let ping = format!("{}{}", base.trim_end_matches('/'), self.ping_path);
        debug!(url = %ping, "Trying to ping proxy");

        match self.transport.get(&CancelToken::new(), &ping).await {
            Ok(response) => {
                debug!(url = %ping, status = %response.status, "Ping answered");
                true
            }
            Err(e) => {
                warn!(proxy = %base, error = %e, "Failed to ping proxy");
                false
            }
        }
    }
}

impl std::fmt::Debug for ProxyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyProvider")
            .field("host_url", &self.host_url)
            .field("providers", &self.providers)
            .finish()
    }
}
