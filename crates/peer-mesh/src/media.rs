//! Local capture gating and stream handles
//!
//! The capture device is a single process-wide resource. [`MediaGate`]
//! captures it once, shares the resulting [`LocalMediaHandle`] with the
//! session and every active link, and stops it when the last holder is gone.

use crate::error::MediaError;
use crate::participant::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Captured local audio stream shared by every link
#[derive(Debug, Clone)]
pub struct LocalMediaHandle {
    id: String,
    label: String,
    enabled: Arc<AtomicBool>,
}

impl LocalMediaHandle {
    /// Create an enabled handle
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether outgoing audio flows; shared across clones
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl PartialEq for LocalMediaHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalMediaHandle {}

/// Inbound media stream of one remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStreamHandle {
    /// Stream id announced by the remote side
    pub stream_id: String,
    /// Media kind ("audio")
    pub kind: String,
}

impl RemoteStreamHandle {
    /// Create a handle
    pub fn new(stream_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind: kind.into(),
        }
    }
}

/// Source of local audio
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open the device
    async fn capture(&self) -> std::result::Result<LocalMediaHandle, MediaError>;

    /// Close the device
    async fn stop(&self, handle: &LocalMediaHandle);
}

/// Capture device with a fixed outcome, counting calls
#[derive(Debug, Default)]
pub struct StaticCapture {
    failure: Option<MediaError>,
    captures: AtomicUsize,
    stops: AtomicUsize,
}

impl StaticCapture {
    /// A device that always captures successfully
    pub fn working() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A device that always fails with `error`
    pub fn failing(error: MediaError) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(error),
            ..Self::default()
        })
    }

    /// Number of `capture` calls
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for StaticCapture {
    async fn capture(&self) -> std::result::Result<LocalMediaHandle, MediaError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(LocalMediaHandle::new("static microphone")),
        }
    }

    async fn stop(&self, _handle: &LocalMediaHandle) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Something keeping the capture device open
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaHolder {
    /// The joined session itself
    Session,
    /// An active link
    Peer(PeerId),
}

#[derive(Debug, Default)]
struct GateState {
    handle: Option<LocalMediaHandle>,
    holders: HashSet<MediaHolder>,
    muted: bool,
}

/// Reference-counted access to the capture device
///
/// The device stays open while the session or any link holds it.
///
/// ```
/// use peer_mesh::{MediaGate, StaticCapture};
///
/// # tokio_test::block_on(async {
/// let device = StaticCapture::working();
/// let gate = MediaGate::new(device.clone());
/// gate.acquire().await.unwrap();
/// gate.attach("bob").await;
///
/// assert!(!gate.release().await);
/// assert!(gate.detach("bob").await);
/// assert_eq!(device.stop_count(), 1);
/// # });
/// ```
pub struct MediaGate {
    device: Arc<dyn CaptureDevice>,
    state: Mutex<GateState>,
}

impl MediaGate {
    /// Create a gate over `device`; nothing is captured yet
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Create a gate whose first capture starts muted or unmuted
    pub fn with_muted(device: Arc<dyn CaptureDevice>, muted: bool) -> Self {
        Self {
            device,
            state: Mutex::new(GateState {
                muted,
                ..GateState::default()
            }),
        }
    }

    /// Capture the device for the session, or return the existing handle
    ///
    /// The current mute flag is applied to a freshly captured handle.
    pub async fn acquire(&self) -> std::result::Result<LocalMediaHandle, MediaError> {
        let mut state = self.state.lock().await;
        if let Some(handle) = &state.handle {
            let handle = handle.clone();
            state.holders.insert(MediaHolder::Session);
            return Ok(handle);
        }

        let handle = self.device.capture().await.map_err(|e| {
            warn!(error = %e, "Local media capture failed");
            e
        })?;
        handle.set_enabled(!state.muted);
        info!(stream_id = handle.id(), muted = state.muted, "Local media captured");
        state.handle = Some(handle.clone());
        state.holders.insert(MediaHolder::Session);
        Ok(handle)
    }

    /// Register a link as a holder; `None` when nothing is captured
    pub async fn attach(&self, peer_id: &str) -> Option<LocalMediaHandle> {
        let mut state = self.state.lock().await;
        let handle = state.handle.clone()?;
        state.holders.insert(MediaHolder::Peer(peer_id.to_string()));
        Some(handle)
    }

    /// Drop a link's hold; returns `true` if the device was stopped
    pub async fn detach(&self, peer_id: &str) -> bool {
        self.release_holder(MediaHolder::Peer(peer_id.to_string()))
            .await
    }

    /// Drop the session's hold; returns `true` if the device was stopped
    pub async fn release(&self) -> bool {
        self.release_holder(MediaHolder::Session).await
    }

    async fn release_holder(&self, holder: MediaHolder) -> bool {
        let mut state = self.state.lock().await;
        if !state.holders.remove(&holder) || !state.holders.is_empty() {
            return false;
        }
        let Some(handle) = state.handle.take() else {
            return false;
        };
        self.device.stop(&handle).await;
        debug!(stream_id = handle.id(), "Local media released");
        true
    }

    /// Set the mute flag and apply it to the live handle
    pub async fn set_muted(&self, muted: bool) {
        let mut state = self.state.lock().await;
        state.muted = muted;
        if let Some(handle) = &state.handle {
            handle.set_enabled(!muted);
        }
    }

    /// Current mute flag
    pub async fn is_muted(&self) -> bool {
        self.state.lock().await.muted
    }

    /// The live handle, if captured
    pub async fn handle(&self) -> Option<LocalMediaHandle> {
        self.state.lock().await.handle.clone()
    }

    /// Number of current holders
    pub async fn holder_count(&self) -> usize {
        self.state.lock().await.holders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let device = StaticCapture::working();
        let gate = MediaGate::new(device.clone());

        let first = gate.acquire().await.unwrap();
        let second = gate.acquire().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(device.capture_count(), 1);
        assert_eq!(gate.holder_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_waits_for_last_holder() {
        let device = StaticCapture::working();
        let gate = MediaGate::new(device.clone());
        gate.acquire().await.unwrap();
        assert!(gate.attach("bob").await.is_some());
        assert!(gate.attach("carol").await.is_some());

        assert!(!gate.release().await);
        assert!(!gate.detach("bob").await);
        assert_eq!(device.stop_count(), 0);
        assert!(gate.detach("carol").await);
        assert_eq!(device.stop_count(), 1);
        assert!(gate.handle().await.is_none());

        // Unknown holders change nothing
        assert!(!gate.detach("carol").await);
    }

    #[tokio::test]
    async fn test_attach_without_capture() {
        let gate = MediaGate::new(StaticCapture::working());
        assert!(gate.attach("bob").await.is_none());
        assert_eq!(gate.holder_count().await, 0);
    }

    #[tokio::test]
    async fn test_mute_applies_before_and_after_capture() {
        let gate = MediaGate::new(StaticCapture::working());
        gate.set_muted(true).await;
        let handle = gate.acquire().await.unwrap();
        assert!(!handle.is_enabled());

        let attached = gate.attach("bob").await.unwrap();
        gate.set_muted(false).await;
        assert!(handle.is_enabled());
        assert!(attached.is_enabled());
        assert!(!gate.is_muted().await);
    }

    #[tokio::test]
    async fn test_capture_failure_is_typed() {
        let device = StaticCapture::failing(MediaError::DeviceBusy);
        let gate = MediaGate::new(device.clone());
        assert_eq!(gate.acquire().await.unwrap_err(), MediaError::DeviceBusy);
        assert_eq!(gate.holder_count().await, 0);
        // A later attempt tries the device again
        assert!(gate.acquire().await.is_err());
        assert_eq!(device.capture_count(), 2);
    }
}
