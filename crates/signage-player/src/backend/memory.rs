//! In-process backend.  Drives `--demo-playlist` runs and the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use signage_proto::protocol::{DeviceIdentity, PlaylistRecord};
use tokio::sync::mpsc;

use super::{Backend, BackendError, FrameStream};
use crate::pairing::{PairingCode, PairingError};

struct Registration {
    device_id: String,
    device_name: String,
    active: bool,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Registration>,
    playlists: HashMap<String, Vec<PlaylistRecord>>,
    feeds: HashMap<String, Vec<mpsc::UnboundedSender<Result<String, BackendError>>>>,
    failing_subscribes: usize,
    failing_fetches: usize,
    failing_heartbeats: usize,
    activation_delay: Duration,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    activation_attempts: AtomicUsize,
    subscribes: AtomicUsize,
    fetches: AtomicUsize,
    heartbeats: AtomicUsize,
    offline_marks: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens in a failing test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an inactive device that can be activated with `code`.
    pub fn register_device(&self, code: &str, device_id: &str, device_name: &str) {
        self.lock().devices.insert(
            code.to_ascii_uppercase(),
            Registration {
                device_id: device_id.to_string(),
                device_name: device_name.to_string(),
                active: false,
            },
        );
    }

    pub fn set_playlist(&self, device_id: &str, records: Vec<PlaylistRecord>) {
        self.lock().playlists.insert(device_id.to_string(), records);
    }

    /// Push one raw frame to every open feed of the device.
    pub fn push_frame(&self, device_id: &str, frame: impl Into<String>) {
        let frame = frame.into();
        if let Some(feeds) = self.lock().feeds.get_mut(device_id) {
            feeds.retain(|tx| tx.send(Ok(frame.clone())).is_ok());
        }
    }

    /// End every open feed of the device, as a dropped connection would.
    pub fn drop_feeds(&self, device_id: &str) {
        self.lock().feeds.remove(device_id);
    }

    pub fn open_feeds(&self, device_id: &str) -> usize {
        self.lock()
            .feeds
            .get(device_id)
            .map(|f| f.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.lock().failing_subscribes = n;
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.lock().failing_fetches = n;
    }

    pub fn fail_next_heartbeats(&self, n: usize) {
        self.lock().failing_heartbeats = n;
    }

    /// Hold every activation for `delay` before answering.
    pub fn delay_activations(&self, delay: Duration) {
        self.lock().activation_delay = delay;
    }

    pub fn activation_attempts(&self) -> usize {
        self.activation_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn offline_count(&self) -> usize {
        self.offline_marks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn activate(&self, code: &PairingCode) -> Result<DeviceIdentity, PairingError> {
        self.activation_attempts.fetch_add(1, Ordering::SeqCst);
        // Let a concurrent caller interleave before the check-and-set.
        tokio::task::yield_now().await;
        let delay = self.lock().activation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        let reg = inner
            .devices
            .get_mut(code.as_str())
            .ok_or(PairingError::CodeNotFound)?;
        if reg.active {
            return Err(PairingError::AlreadyActive);
        }
        reg.active = true;
        Ok(DeviceIdentity {
            device_id: reg.device_id.clone(),
            device_name: reg.device_name.clone(),
            pairing_code: code.as_str().to_string(),
        })
    }

    async fn fetch_playlist(
        &self,
        device: &DeviceIdentity,
    ) -> Result<Vec<PlaylistRecord>, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(BackendError::Unavailable("fetch refused".into()));
        }
        Ok(inner
            .playlists
            .get(&device.device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(&self, device: &DeviceIdentity) -> Result<FrameStream, BackendError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        if inner.failing_subscribes > 0 {
            inner.failing_subscribes -= 1;
            return Err(BackendError::Unavailable("subscribe refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .feeds
            .entry(device.device_id.clone())
            .or_default()
            .push(tx);
        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(frames.boxed())
    }

    async fn heartbeat(&self, _device: &DeviceIdentity) -> Result<(), BackendError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        if inner.failing_heartbeats > 0 {
            inner.failing_heartbeats -= 1;
            return Err(BackendError::Unavailable("heartbeat refused".into()));
        }
        Ok(())
    }

    async fn set_offline(&self, device: &DeviceIdentity) -> Result<(), BackendError> {
        self.offline_marks.fetch_add(1, Ordering::SeqCst);
        if let Some(reg) = self
            .lock()
            .devices
            .values_mut()
            .find(|r| r.device_id == device.device_id)
        {
            reg.active = false;
        }
        Ok(())
    }
}
