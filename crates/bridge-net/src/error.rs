//! Error types

/// Dialer stack errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Peer certificate does not match any trusted pin
    #[error("TLS certificate pin mismatch")]
    PinMismatch,

    /// Primary API reachable again after an intermittent drop
    #[error("no connection: the API became reachable again after an intermittent drop")]
    NoConnection,

    /// Neither the primary API nor any candidate route is usable
    #[error("no reachable server could be found")]
    NoReachableServer,

    /// Route lookup rejected by the cooldown
    #[error("not looking for a proxy, too soon")]
    LookupTooSoon,

    /// Proxy use was disallowed while a route search was running
    #[error("proxy use is not allowed")]
    ProxyNotAllowed,

    /// Operation cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Operation exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed host/port or URL
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Network other than tcp/tcp4/tcp6
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate rejected or unparseable
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// DNS-over-HTTPS error
    #[error("DNS error: {0}")]
    Dns(String),

    /// HTTP exchange error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a plain connectivity failure.
    ///
    /// Only connectivity failures may trigger a switch to an alternate route.
    /// Trust failures, cancellation and caller mistakes never do.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout(_) | Self::Tls(_) | Self::Http(_)
        )
    }

    /// Whether this error means the peer could not be trusted.
    pub fn is_trust_failure(&self) -> bool {
        matches!(self, Self::PinMismatch | Self::Certificate(_))
    }

    /// Whether this error is a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Error::Http(e.to_string())
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
