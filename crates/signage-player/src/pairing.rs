//! Pairing client: exchanges a human-entered code for a device identity.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signage_proto::protocol::DeviceIdentity;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::Backend;

pub const CODE_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("pairing code must be exactly {CODE_LEN} letters or digits")]
    InvalidCodeFormat,
    #[error("no device is registered with this code")]
    CodeNotFound,
    #[error("device is already active")]
    AlreadyActive,
    #[error("a pairing request is already in flight")]
    InProgress,
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("unexpected pairing failure: {0}")]
    Unexpected(String),
}

impl PairingError {
    /// The operator may simply re-submit the same code.
    pub fn is_transient(&self) -> bool {
        matches!(self, PairingError::NetworkFailure(_) | PairingError::InProgress)
    }
}

/// A validated, upper-cased pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    pub fn parse(raw: &str) -> Result<Self, PairingError> {
        let code = raw.trim().to_ascii_uppercase();
        if code.len() != CODE_LEN || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PairingError::InvalidCodeFormat);
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Submits codes to the backend, one request at a time.
#[derive(Clone)]
pub struct PairingClient {
    backend: Arc<dyn Backend>,
    in_flight: Arc<AtomicBool>,
}

impl PairingClient {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn pair(&self, raw_code: &str) -> Result<DeviceIdentity, PairingError> {
        let code = PairingCode::parse(raw_code)?;

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PairingError::InProgress);
        }
        let _guard = InFlightGuard(&self.in_flight);

        info!("Pairing: submitting code {}", code);
        match self.backend.activate(&code).await {
            Ok(identity) => {
                info!(
                    "Pairing: activated device {} ({})",
                    identity.device_id, identity.device_name
                );
                Ok(identity)
            }
            Err(e) => {
                warn!("Pairing: code {} rejected: {}", code, e);
                Err(e)
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
