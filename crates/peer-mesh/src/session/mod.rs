//! Mesh session: the library surface consumed by the host application
//!
//! A [`MeshSession`] joins one relay session at a time. While joined, a
//! background event loop links every other participant, keeps the links
//! alive and publishes [`MeshEvent`]s on the stream returned by
//! [`MeshSession::take_events`].

mod driver;
mod events;
mod machine;
mod worker;

pub use events::{DisconnectReason, MeshEvent};

use self::driver::{Command, Driver};
use self::machine::MeshCore;
use crate::backend::RtcBackend;
use crate::channels::AppMessage;
use crate::config::MeshConfig;
use crate::media::{CaptureDevice, MediaGate};
use crate::participant::Participant;
use crate::peer::PeerSummary;
use crate::signaling::SignalingTransport;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

struct Joined {
    session_id: String,
    local: Participant,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Peer mesh for one local participant
pub struct MeshSession {
    config: MeshConfig,
    signaling: Arc<dyn SignalingTransport>,
    backend: Arc<dyn RtcBackend>,
    media: Arc<MediaGate>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    joined: tokio::sync::Mutex<Option<Joined>>,
}

impl MeshSession {
    /// Create a session over the given relay, media backend and capture device
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: MeshConfig,
        signaling: Arc<dyn SignalingTransport>,
        backend: Arc<dyn RtcBackend>,
        device: Arc<dyn CaptureDevice>,
    ) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            media: Arc::new(MediaGate::with_muted(device, config.start_muted)),
            config,
            signaling,
            backend,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            joined: tokio::sync::Mutex::new(None),
        })
    }

    /// Take the event stream; `None` after the first call
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events_rx.lock().take()
    }

    /// Join `session_id` as `participant`
    ///
    /// Captures local audio first (when enabled); a capture failure aborts
    /// the join with [`Error::Media`] and nothing is announced.
    #[instrument(skip(self, participant), fields(participant_id = %participant.id))]
    pub async fn join(&self, session_id: &str, participant: Participant) -> Result<()> {
        let mut joined = self.joined.lock().await;
        if let Some(current) = joined.as_ref() {
            return Err(Error::AlreadyJoined(current.session_id.clone()));
        }

        if self.config.audio_enabled {
            self.media.acquire().await?;
        }

        let relay = match self.signaling.connect(session_id, &participant).await {
            Ok(relay) => relay,
            Err(e) => {
                warn!(error = %e, "Failed to connect to relay");
                self.media.release().await;
                return Err(e);
            }
        };

        let core = MeshCore::new(participant.clone(), &self.config);
        let (driver, links, timers) = Driver::new(
            core,
            self.config.clone(),
            Arc::clone(&self.signaling),
            Arc::clone(&self.backend),
            Arc::clone(&self.media),
            self.events_tx.clone(),
        );
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver.run(commands_rx, relay, links, timers));

        info!(session_id, "Joined mesh session");
        *joined = Some(Joined {
            session_id: session_id.to_string(),
            local: participant,
            commands: commands_tx,
            task,
        });
        Ok(())
    }

    /// Leave the current session, closing every link and releasing the device
    #[instrument(skip(self))]
    pub async fn leave(&self) -> Result<()> {
        let Some(current) = self.joined.lock().await.take() else {
            return Err(Error::NotJoined);
        };

        let (reply, done) = oneshot::channel();
        if current.commands.send(Command::Shutdown(reply)).is_ok() {
            let _ = done.await;
        }
        if let Err(e) = current.task.await {
            warn!(error = %e, "Mesh event loop ended abnormally");
        }

        let disconnected = self.signaling.disconnect().await;
        self.media.release().await;
        info!(session_id = %current.session_id, "Left mesh session");
        disconnected
    }

    /// Mute or unmute outgoing audio on every link without renegotiation
    ///
    /// Before joining, this sets the state the next capture starts in.
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        let commands = self.commands().await;
        let Some(commands) = commands else {
            self.media.set_muted(muted).await;
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        commands
            .send(Command::SetMuted { muted, reply })
            .map_err(|_| Error::NotJoined)?;
        done.await.map_err(|_| Error::NotJoined)
    }

    /// Whether outgoing audio is muted
    pub async fn is_muted(&self) -> bool {
        self.media.is_muted().await
    }

    /// Send a chat or drawing message to every participant
    ///
    /// Uses each open data channel and falls back to the relay broadcast for
    /// peers without one. Returns the message as sent, with its id assigned.
    pub async fn send_app_message(&self, message: AppMessage) -> Result<AppMessage> {
        let commands = self.commands().await.ok_or(Error::NotJoined)?;
        let (reply, done) = oneshot::channel();
        commands
            .send(Command::SendApp { message, reply })
            .map_err(|_| Error::NotJoined)?;
        done.await.map_err(|_| Error::NotJoined)?
    }

    /// Send chat text as the local participant
    pub async fn send_text(&self, text: impl Into<String>) -> Result<AppMessage> {
        let local_id = self.local_id().await.ok_or(Error::NotJoined)?;
        self.send_app_message(AppMessage::text(local_id, text)).await
    }

    /// Snapshot of every link; empty when not joined
    pub async fn peers(&self) -> Vec<PeerSummary> {
        let Some(commands) = self.commands().await else {
            return Vec::new();
        };
        let (reply, done) = oneshot::channel();
        if commands.send(Command::Peers(reply)).is_err() {
            return Vec::new();
        }
        done.await.unwrap_or_default()
    }

    /// Whether the session is currently joined
    pub async fn is_joined(&self) -> bool {
        self.joined.lock().await.is_some()
    }

    /// Id of the local participant while joined
    pub async fn local_id(&self) -> Option<String> {
        self.joined
            .lock()
            .await
            .as_ref()
            .map(|joined| joined.local.id.clone())
    }

    /// Configuration in use
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    async fn commands(&self) -> Option<mpsc::UnboundedSender<Command>> {
        self.joined
            .lock()
            .await
            .as_ref()
            .map(|joined| joined.commands.clone())
    }
}
