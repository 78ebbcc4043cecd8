//! Resilient TLS dialing for the mail bridge
//!
//! Pins the API's public keys, reports pin failures, and routes around
//! blocking through alternate hosts discovered over DNS-over-HTTPS.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod cancel;
pub mod checker;
pub mod config;
pub mod doh;
pub mod error;
pub mod pinning;
pub mod pins;
pub mod provider;
pub mod proxy;
pub mod report;
pub mod stack;
mod task;
pub mod tls;
pub mod transport;

// Re-export main types
pub use address::format_as_address;
pub use cancel::CancelToken;
pub use checker::{PinChecker, TlsPinChecker};
pub use config::DialerConfig;
pub use doh::{DnsProvider, DohClient, DohLookup};
pub use error::{Error, Result};
pub use pinning::{PinningDialer, TlsIssue};
pub use pins::{pin_for_certificate, spki_fingerprint, TrustedPinSet, DEFAULT_API_PINS};
pub use provider::{ProxyCache, ProxyProvider, Route};
pub use proxy::{ProxyDialer, RouteMode};
pub use report::{Reporter, TlsReport, TlsReporter, TLS_REPORT_URI};
pub use stack::{DialerStack, DialerStackBuilder};
pub use tls::{BasicDialer, ConnectionState, TlsConnection, TlsDialer};
pub use transport::{HttpResponse, HttpTransport};
