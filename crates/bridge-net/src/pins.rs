//! Trusted public key pins
//!
//! Pins follow RFC 7469: `pin-sha256="<base64 SHA-256 of SubjectPublicKeyInfo>"`.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Trusted public keys of the API and its proxies.
///
/// All proxies share the same keys.
pub const DEFAULT_API_PINS: &[&str] = &[
    // api.protonmail.ch
    r#"pin-sha256="drtmcR2kFkM8qJClsuWgUzxgBkePfRCkRpqUesyDmeE=""#, // current
    r#"pin-sha256="YRGlaY0jyJ4Jw2/4M8FIftwbDIQfh8Sdro96CeEel54=""#, // hot backup
    r#"pin-sha256="AfMENBVvOS8MnISprtvyPsjKlPooqh8nMB/pvCrpJpw=""#, // cold backup
    // protonmail.com
    r#"pin-sha256="8joiNBdqaYiQpKskgtkJsqRxF7zN0C0aqfi8DacknnI=""#, // current
    r#"pin-sha256="JMI8yrbc6jB1FYGyyWRLFTmDNgIszrNEMGlgy972e7w=""#, // hot backup
    r#"pin-sha256="Iu44zU84EOCZ9vx/vz67/MRVrxF1IO4i4NIa8ETwiIY=""#, // cold backup
    // proton.me
    r#"pin-sha256="CT56BhOTmj5ZIPgb/xD5mH8rY3BLo/MlhP7oPyJUEDo=""#, // current
    r#"pin-sha256="35Dx28/uzN3LeltkCBQ8RHK0tlNSa2kCpCRGNp34Gxc=""#, // hot backup
    r#"pin-sha256="qYIukVc63DEITct8sFT7ebIq5qsWmuscaIKeJx+5J5A=""#, // cold backup
    // proxies
    r#"pin-sha256="EU6TS9MO0L/GsDHvVc9D5fChYLNy5JdGYpJw0ccgetM=""#, // main
    r#"pin-sha256="iKPIHPnDNqdkvOnTClQ8zQAIKG0XavaPkcEo0LBAABA=""#, // backup 1
    r#"pin-sha256="MSlVrBCdL0hKyczvgYVSRNm88RicyY04Q2y5qrBt0xA=""#, // backup 2
    r#"pin-sha256="C2UxW0T1Ckl9s+8cXfjXxlEqwAfPM4HiW2y3UdtBeCw=""#, // backup 3
];

const PIN_PREFIX: &str = "pin-sha256=\"";

/// Base64 SHA-256 of a DER certificate's SubjectPublicKeyInfo
pub fn spki_fingerprint(cert_der: &[u8]) -> Result<String> {
    let der = CertificateDer::from(cert_der);
    let cert = webpki::EndEntityCert::try_from(&der)
        .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {:?}", e)))?;
    let spki = cert.subject_public_key_info();
    Ok(STANDARD.encode(Sha256::digest(spki.as_ref())))
}

/// Format a base64 SPKI hash as a pin string
pub fn pin_from_spki_hash(hash: &str) -> String {
    format!("{}{}\"", PIN_PREFIX, hash)
}

/// Pin string for a DER certificate
pub fn pin_for_certificate(cert_der: &[u8]) -> Result<String> {
    Ok(pin_from_spki_hash(&spki_fingerprint(cert_der)?))
}

/// Live set of trusted pins.
///
/// Clones share the same set, so a replacement is seen by every checker
/// holding a clone on its next check.
#[derive(Debug, Clone, Default)]
pub struct TrustedPinSet {
    pins: Arc<RwLock<Vec<String>>>,
}

impl TrustedPinSet {
    /// Create a set from pin strings
    pub fn new<I, S>(pins: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = Self::default();
        set.replace(pins)?;
        Ok(set)
    }

    /// Set holding [`DEFAULT_API_PINS`]
    pub fn api_defaults() -> Self {
        Self {
            pins: Arc::new(RwLock::new(
                DEFAULT_API_PINS.iter().map(|p| p.to_string()).collect(),
            )),
        }
    }

    /// Check pin syntax (`pin-sha256="<44 base64 chars>"`)
    pub fn validate_pin(pin: &str) -> Result<()> {
        let hash = pin
            .strip_prefix(PIN_PREFIX)
            .and_then(|rest| rest.strip_suffix('"'))
            .ok_or_else(|| Error::Config(format!("Invalid pin format: {}", pin)))?;

        if hash.len() != 44 {
            return Err(Error::Config(format!(
                "Invalid pin format: expected 44 chars, got {}",
                hash.len()
            )));
        }

        let decoded = STANDARD
            .decode(hash)
            .map_err(|e| Error::Config(format!("Invalid pin encoding: {}", e)))?;
        if decoded.len() != 32 {
            return Err(Error::Config(format!(
                "Invalid pin digest length: {}",
                decoded.len()
            )));
        }

        Ok(())
    }

    /// Add a pin
    pub fn add(&self, pin: impl Into<String>) -> Result<()> {
        let pin = pin.into();
        Self::validate_pin(&pin)?;

        let mut pins = self.pins.write();
        if !pins.contains(&pin) {
            debug!("Adding trusted pin {}", pin);
            pins.push(pin);
        }
        Ok(())
    }

    /// Replace every pin at once
    pub fn replace<I, S>(&self, pins: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pins: Vec<String> = pins.into_iter().map(Into::into).collect();
        for pin in &pins {
            Self::validate_pin(pin)?;
        }

        info!("Replacing trusted pin set ({} pins)", pins.len());
        *self.pins.write() = pins;
        Ok(())
    }

    /// Remove a pin; returns whether it was present
    pub fn remove(&self, pin: &str) -> bool {
        let mut pins = self.pins.write();
        let before = pins.len();
        pins.retain(|p| p != pin);
        before != pins.len()
    }

    /// Whether the pin is currently trusted
    pub fn contains(&self, pin: &str) -> bool {
        self.pins.read().iter().any(|p| p == pin)
    }

    /// Copy of the current pins
    pub fn snapshot(&self) -> Vec<String> {
        self.pins.read().clone()
    }

    /// Number of pins
    pub fn len(&self) -> usize {
        self.pins.read().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.pins.read().is_empty()
    }

    /// Export pins as JSON
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(&*self.pins.read())
            .map_err(|e| Error::Config(format!("Failed to export pins: {}", e)))
    }

    /// Import pins from JSON, adding to the current set
    pub fn import(&self, json: &str) -> Result<()> {
        let pins: Vec<String> = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse pins: {}", e)))?;

        for pin in pins {
            self.add(pin)?;
        }

        Ok(())
    }
}
