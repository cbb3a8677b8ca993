//! Session / connection state machine.
//!
//! ```text
//!   Unpaired ──pair──▶ Pairing ──ok──▶ PairedDisconnected ──load──▶ Connected ⇄ Degraded
//!      ▲                  │                                            │          │
//!      └──────fail────────┘                                            │          │
//!      └──────────────────────────── repair ◀──────────────────────────┴──────────┘
//! ```
//!
//! Every pairing attempt and every re-pair starts a new epoch.  Asynchronous
//! results (pairing replies, feed events) carry the epoch they were started
//! under and are dropped when it is no longer current.

use signage_proto::protocol::{ConnectionState, DeviceIdentity, DeviceStatus};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("already paired as {0}")]
    AlreadyPaired(String),
    #[error("a pairing attempt is already running")]
    PairingInProgress,
}

#[derive(Debug, Default)]
pub struct Session {
    state: ConnectionState,
    identity: Option<DeviceIdentity>,
    epoch: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a session from a persisted identity.  It is considered
    /// disconnected until the first load succeeds.
    pub fn restored(identity: DeviceIdentity) -> Self {
        Self {
            state: ConnectionState::PairedDisconnected,
            identity: Some(identity),
            epoch: 1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.into()
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    /// Start a pairing attempt.  Returns its epoch.
    pub fn begin_pairing(&mut self) -> Result<u64, SessionError> {
        match self.state {
            ConnectionState::Unpaired => {
                self.epoch += 1;
                self.transition(ConnectionState::Pairing);
                Ok(self.epoch)
            }
            ConnectionState::Pairing => Err(SessionError::PairingInProgress),
            _ => Err(SessionError::AlreadyPaired(
                self.identity
                    .as_ref()
                    .map(|i| i.device_name.clone())
                    .unwrap_or_default(),
            )),
        }
    }

    /// Returns false when the result belongs to an abandoned attempt.
    pub fn pairing_succeeded(&mut self, epoch: u64, identity: DeviceIdentity) -> bool {
        if !self.is_current(epoch) || self.state != ConnectionState::Pairing {
            return false;
        }
        self.identity = Some(identity);
        self.transition(ConnectionState::PairedDisconnected);
        true
    }

    pub fn pairing_failed(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) || self.state != ConnectionState::Pairing {
            return false;
        }
        self.transition(ConnectionState::Unpaired);
        true
    }

    /// Subscribed and fully reloaded.
    pub fn load_succeeded(&mut self) {
        if matches!(
            self.state,
            ConnectionState::PairedDisconnected | ConnectionState::Degraded
        ) {
            self.transition(ConnectionState::Connected);
        }
    }

    /// The live stream dropped.  Before the first load there is nothing to
    /// degrade from.
    pub fn stream_lost(&mut self) {
        if self.state == ConnectionState::Connected {
            self.transition(ConnectionState::Degraded);
        }
    }

    /// Drop the identity and start over.  Returns the identity that was
    /// dropped, if any.
    pub fn repair(&mut self) -> Option<DeviceIdentity> {
        self.epoch += 1;
        self.transition(ConnectionState::Unpaired);
        self.identity.take()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("Session: {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }
}
