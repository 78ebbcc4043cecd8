//! Peer certificate pin checks

use crate::pins::{pin_for_certificate, TrustedPinSet};
use crate::tls::ConnectionState;
use crate::{Error, Result};
use tracing::{debug, warn};

/// Decides whether an established connection is trusted
pub trait PinChecker: Send + Sync {
    /// `Err(Error::PinMismatch)` when the leaf key is not trusted
    fn check(&self, state: &ConnectionState) -> Result<()>;
}

/// Checks the leaf SPKI hash against a live [`TrustedPinSet`]
#[derive(Debug, Clone)]
pub struct TlsPinChecker {
    trusted_pins: TrustedPinSet,
}

impl TlsPinChecker {
    /// Create a checker reading `trusted_pins` on every check
    pub fn new(trusted_pins: TrustedPinSet) -> Self {
        Self { trusted_pins }
    }

    /// The live pin set
    pub fn trusted_pins(&self) -> &TrustedPinSet {
        &self.trusted_pins
    }
}

impl PinChecker for TlsPinChecker {
    fn check(&self, state: &ConnectionState) -> Result<()> {
        let leaf = state.leaf().ok_or_else(|| {
            Error::Certificate(format!("{} presented no certificate", state.server_name))
        })?;

        let pin = pin_for_certificate(leaf)?;
        if self.trusted_pins.contains(&pin) {
            debug!("Pin verified for {}", state.server_name);
            return Ok(());
        }

        warn!("Certificate pin mismatch for {}: got {}", state.server_name, pin);
        Err(Error::PinMismatch)
    }
}
