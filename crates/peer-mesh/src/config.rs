//! Configuration types for the peer mesh

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a [`MeshSession`](crate::MeshSession)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN server URLs handed to the media backend
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum linked peers (default: 10, max: 10)
    pub max_peers: u32,

    /// Label of the per-link data channel (default: "app")
    pub data_channel_label: String,

    /// Data channel mode (default: Reliable)
    pub data_channel_mode: DataChannelMode,

    /// How long an initiator waits for an answer, or a responder for an offer
    pub offer_timeout_ms: u64,

    /// How long a link may stay negotiating once descriptions are complete
    pub connect_timeout_ms: u64,

    /// Reconnection behaviour
    pub reconnect: ReconnectConfig,

    /// Maximum chat text length in characters (default: 500)
    pub max_text_len: usize,

    /// Maximum early candidates held per peer (default: 64)
    pub max_buffered_candidates: usize,

    /// Number of recent message ids remembered for de-duplication
    pub dedupe_window: usize,

    /// Capture local audio on join (default: true)
    pub audio_enabled: bool,

    /// Join with outgoing audio muted (default: false)
    pub start_muted: bool,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Reconnection settings fed to [`ReconnectionPolicy`](crate::ReconnectionPolicy)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum restart attempts before a link is closed (default: 5)
    pub max_attempts: u32,

    /// Backoff curve (default: linear)
    pub backoff: BackoffKind,

    /// Delay unit in milliseconds (default: 3000)
    pub backoff_step_ms: u64,

    /// Upper bound on any single delay (default: 30000)
    pub backoff_max_ms: u64,

    /// Growth factor for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,

    /// Grace period before a `disconnected` link is rechecked (default: 5000)
    pub disconnect_grace_ms: u64,
}

/// Backoff curve between restart attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `step × attempt`
    Linear,
    /// `step × multiplier^(attempt - 1)`
    Exponential,
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    ///
    /// Messages may arrive out of order or be lost.
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for the channel
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for the channel
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,      // Unlimited retransmits
            DataChannelMode::Unreliable => Some(0), // No retransmits
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_peers: 10,
            data_channel_label: "app".to_string(),
            data_channel_mode: DataChannelMode::Reliable,
            offer_timeout_ms: 30_000,
            connect_timeout_ms: 45_000,
            reconnect: ReconnectConfig::default(),
            max_text_len: 500,
            max_buffered_candidates: 64,
            dedupe_window: 256,
            audio_enabled: true,
            start_muted: false,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffKind::Linear,
            backoff_step_ms: 3_000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            disconnect_grace_ms: 5_000,
        }
    }
}

impl MeshConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    ///
    /// The result is validated before it is returned.
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        let config: MeshConfig = serde_json::from_str(json)
            .map_err(|e| crate::Error::InvalidConfig(format!("Malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_peers` is not in range 1-10
    /// - a STUN or TURN URL has the wrong scheme
    /// - a timeout, the backoff step or a buffer size is zero
    /// - `backoff_multiplier` is below 1.0
    /// - `data_channel_label` is empty
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.max_peers == 0 || self.max_peers > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-10, got {}",
                self.max_peers
            )));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "data_channel_label must not be empty".to_string(),
            ));
        }

        if self.offer_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_ms and connect_timeout_ms must be non-zero".to_string(),
            ));
        }

        if self.reconnect.backoff_step_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.backoff_step_ms must be non-zero".to_string(),
            ));
        }

        if self.reconnect.backoff_max_ms < self.reconnect.backoff_step_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnect.backoff_max_ms ({}) must be >= backoff_step_ms ({})",
                self.reconnect.backoff_max_ms, self.reconnect.backoff_step_ms
            )));
        }

        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnect.backoff_multiplier must be >= 1.0, got {}",
                self.reconnect.backoff_multiplier
            )));
        }

        if self.max_text_len == 0 || self.max_buffered_candidates == 0 || self.dedupe_window == 0 {
            return Err(Error::InvalidConfig(
                "max_text_len, max_buffered_candidates and dedupe_window must be non-zero"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Offer/answer wait as a `Duration`
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    /// Connect wait as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Create a configuration preset for same-host sessions
    ///
    /// No STUN or TURN servers, short timeouts and fast retries.
    ///
    /// # Example
    ///
    /// ```
    /// use peer_mesh::config::MeshConfig;
    ///
    /// let config = MeshConfig::localhost();
    /// assert!(config.stun_servers.is_empty());
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn localhost() -> Self {
        Self {
            stun_servers: Vec::new(),
            offer_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            reconnect: ReconnectConfig {
                backoff_step_ms: 500,
                backoff_max_ms: 5_000,
                disconnect_grace_ms: 1_000,
                ..ReconnectConfig::default()
            },
            ..Self::default()
        }
    }

    /// Create a configuration preset optimized for low latency
    ///
    /// Settings:
    /// - Data channel: unreliable mode (lower latency)
    /// - Shorter offer and connect timeouts
    /// - Exponential backoff starting at 500ms
    ///
    /// # Example
    ///
    /// ```
    /// use peer_mesh::config::{BackoffKind, DataChannelMode, MeshConfig};
    ///
    /// let config = MeshConfig::low_latency();
    /// assert_eq!(config.data_channel_mode, DataChannelMode::Unreliable);
    /// assert_eq!(config.reconnect.backoff, BackoffKind::Exponential);
    /// ```
    pub fn low_latency() -> Self {
        Self {
            data_channel_mode: DataChannelMode::Unreliable,
            offer_timeout_ms: 15_000,
            connect_timeout_ms: 20_000,
            reconnect: ReconnectConfig {
                max_attempts: 8,
                backoff: BackoffKind::Exponential,
                backoff_step_ms: 500,
                backoff_max_ms: 10_000,
                backoff_multiplier: 1.5,
                disconnect_grace_ms: 2_000,
            },
            ..Self::default()
        }
    }

    /// Add TURN servers to this configuration
    ///
    /// Useful for chaining with preset methods.
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the maximum number of peers
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Disable local audio capture
    pub fn without_audio(mut self) -> Self {
        self.audio_enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.offer_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(45));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.backoff, BackoffKind::Linear);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(MeshConfig::localhost().validate().is_ok());
        assert!(MeshConfig::low_latency().validate().is_ok());
    }

    #[test]
    fn test_invalid_max_peers_fails() {
        let mut config = MeshConfig::default();
        config.max_peers = 0;
        assert!(config.validate().is_err());

        config.max_peers = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_server_urls_fail() {
        let mut config = MeshConfig::default();
        config.stun_servers = vec!["http://stun.example.com".to_string()];
        assert!(config.validate().is_err());

        let config = MeshConfig::default().with_turn_servers(vec![TurnServerConfig {
            url: "stun:turn.example.com".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        }]);
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_zero_limits_fail() {
        let mut config = MeshConfig::default();
        config.max_buffered_candidates = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.reconnect.backoff_step_ms = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.reconnect.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = MeshConfig::from_json_str(
            r#"{"max_peers": 4, "reconnect": {"max_attempts": 2, "backoff": "exponential"}}"#,
        )
        .unwrap();
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.backoff, BackoffKind::Exponential);
        assert_eq!(config.reconnect.backoff_step_ms, 3_000);
        assert_eq!(config.max_text_len, 500);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(MeshConfig::from_json_str(r#"{"max_peers": 20}"#).is_err());
        assert!(MeshConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_data_channel_mode() {
        assert!(DataChannelMode::Reliable.ordered());
        assert_eq!(DataChannelMode::Reliable.max_retransmits(), None);
        assert!(!DataChannelMode::Unreliable.ordered());
        assert_eq!(DataChannelMode::Unreliable.max_retransmits(), Some(0));
    }
}
