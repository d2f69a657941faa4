use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::Channel;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Rendezvous service WebSocket URL (ws:// or wss://)
    #[serde(default)]
    pub url: String,
    /// Auth token, sent as the `token` query parameter
    pub token: Option<String>,
    /// PEM file with an extra CA to trust for wss:// (self-hosted rendezvous)
    pub tls_ca: Option<String>,
    /// How long to wait for the `connected` ack after a connect-request
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Maximum accepted signaling frame size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
///
/// Without TURN, WebRTC fails behind symmetric NATs on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// One data channel per logical channel
    #[default]
    Dual,
    /// Everything over the control channel with a one-byte type tag
    Multiplexed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub mode: ChannelMode,
    #[serde(default = "default_control_label")]
    pub control_label: String,
    #[serde(default = "default_media_label")]
    pub media_label: String,
    /// How long the data channels may take to open after the answer is applied
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Buffered bytes above which sends are queued
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Buffered bytes at which the queue drains again
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    /// Pending messages per channel before the oldest are dropped
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Consecutive ticks of sent-but-nothing-received before a channel is stagnant (K)
    #[serde(default = "default_stagnation_ticks")]
    pub stagnation_ticks: u32,
    /// Inbound silence after which ticks start counting towards full death (T)
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    /// Consecutive silent ticks past the timeout before a channel is dead (M)
    #[serde(default = "default_silence_ticks")]
    pub silence_ticks: u32,
    /// Channels that get a keepalive ping when the application is idle on them
    #[serde(default = "default_keepalive_channels")]
    pub keepalive_channels: Vec<Channel>,
    /// Keepalive payload (JSON text)
    #[serde(default = "default_keepalive_message")]
    pub keepalive_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the computed backoff (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Failed attempts before giving up (terminal Failed state)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound for one full signaling + negotiation attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Grace period for an ICE `disconnected` state to heal on its own
    #[serde(default = "default_ice_grace_ms")]
    pub ice_grace_ms: u64,
    /// How long to wait for the remote SDP answer
    #[serde(default = "default_answer_timeout_ms")]
    pub answer_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            tls_ca: None,
            ack_timeout_ms: default_ack_timeout_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: ChannelMode::default(),
            control_label: default_control_label(),
            media_label: default_media_label(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            stagnation_ticks: default_stagnation_ticks(),
            silence_timeout_ms: default_silence_timeout_ms(),
            silence_ticks: default_silence_ticks(),
            keepalive_channels: default_keepalive_channels(),
            keepalive_message: default_keepalive_message(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ice_grace_ms: default_ice_grace_ms(),
            answer_timeout_ms: default_answer_timeout_ms(),
        }
    }
}

impl SignalingConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl ChannelConfig {
    /// Data channel label for a logical channel.
    pub fn label(&self, channel: Channel) -> &str {
        match channel {
            Channel::Control => &self.control_label,
            Channel::Media => &self.media_label,
        }
    }

    /// Logical channels that get their own data channel.
    pub fn physical_channels(&self) -> &'static [Channel] {
        match self.mode {
            ChannelMode::Dual => &Channel::ALL,
            ChannelMode::Multiplexed => &[Channel::Control],
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl HealthConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ice_grace(&self) -> Duration {
        Duration::from_millis(self.ice_grace_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the bridge should not start) or
    /// "WARNING:" (advisory, the bridge can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling ---
        let url = self.signaling.url.trim();
        if url.is_empty() {
            issues.push(
                "ERROR: signaling.url is required. Example: wss://signal.example.com/ws"
                    .to_string(),
            );
        } else if !url.starts_with("ws://") && !url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: signaling.url '{}' must start with 'ws://' or 'wss://'.",
                url
            ));
        } else if url.starts_with("ws://") && self.signaling.token.is_some() {
            issues.push(
                "WARNING: signaling.token is sent over plain ws://. Use wss:// outside of local testing."
                    .to_string(),
            );
        }
        if let Some(ca) = &self.signaling.tls_ca
            && !Path::new(ca).exists()
        {
            issues.push(format!("ERROR: signaling.tls_ca '{}' does not exist.", ca));
        }
        if self.signaling.ack_timeout_ms == 0 {
            issues.push("ERROR: signaling.ack_timeout_ms must be > 0.".to_string());
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: ice.turn_urls is set without turn_username/turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }

        // --- Channels ---
        if self.channels.control_label.is_empty() || self.channels.media_label.is_empty() {
            issues.push("ERROR: channel labels must not be empty.".to_string());
        } else if self.channels.mode == ChannelMode::Dual
            && self.channels.control_label == self.channels.media_label
        {
            issues.push(format!(
                "ERROR: channels.control_label and channels.media_label are both '{}'. \
                 Dual mode needs two distinct data channels.",
                self.channels.control_label
            ));
        }

        // --- Flow control ---
        if self.flow.low_watermark >= self.flow.high_watermark {
            issues.push(format!(
                "ERROR: flow.low_watermark ({}) must be below flow.high_watermark ({}).",
                self.flow.low_watermark, self.flow.high_watermark
            ));
        }
        if self.flow.max_queue_depth == 0 {
            issues.push("ERROR: flow.max_queue_depth must be >= 1.".to_string());
        }

        // --- Health ---
        if self.health.tick_interval_ms == 0 {
            issues.push("ERROR: health.tick_interval_ms must be > 0.".to_string());
        }
        if self.health.stagnation_ticks == 0 {
            issues.push("ERROR: health.stagnation_ticks must be >= 1.".to_string());
        }
        if self.health.silence_ticks == 0 {
            issues.push("ERROR: health.silence_ticks must be >= 1.".to_string());
        }
        if self.health.silence_timeout_ms < self.health.tick_interval_ms {
            issues.push(format!(
                "WARNING: health.silence_timeout_ms ({}) is shorter than one tick ({}). \
                 Every tick without inbound traffic will count as silent.",
                self.health.silence_timeout_ms, self.health.tick_interval_ms
            ));
        }
        if !self.health.keepalive_channels.is_empty()
            && self.health.keepalive_message.trim().is_empty()
        {
            issues.push(
                "ERROR: health.keepalive_message must not be empty when keepalive channels are set."
                    .to_string(),
            );
        }

        // --- Reconnect ---
        if self.reconnect.base_delay_ms == 0 {
            issues.push("ERROR: reconnect.base_delay_ms must be > 0.".to_string());
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            issues.push(format!(
                "ERROR: reconnect.max_delay_ms ({}) must be >= reconnect.base_delay_ms ({}).",
                self.reconnect.max_delay_ms, self.reconnect.base_delay_ms
            ));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            issues.push(format!(
                "ERROR: reconnect.jitter must be in [0.0, 1.0), got {}.",
                self.reconnect.jitter
            ));
        }
        if self.reconnect.max_attempts == 0 {
            issues.push("ERROR: reconnect.max_attempts must be >= 1.".to_string());
        }
        if !(5_000..=10_000).contains(&self.reconnect.connect_timeout_ms) {
            issues.push(format!(
                "WARNING: reconnect.connect_timeout_ms is {} ms. Values outside 5000-10000 \
                 either abort healthy handshakes or leave dead attempts hanging.",
                self.reconnect.connect_timeout_ms
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_ack_timeout_ms() -> u64 {
    3_000
}
fn default_max_message_size() -> usize {
    65_536
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_control_label() -> String {
    Channel::Control.default_label().to_string()
}
fn default_media_label() -> String {
    Channel::Media.default_label().to_string()
}
fn default_open_timeout_ms() -> u64 {
    5_000
}
fn default_high_watermark() -> usize {
    1_048_576 // 1 MiB
}
fn default_low_watermark() -> usize {
    65_536 // 64 KiB
}
fn default_max_queue_depth() -> usize {
    500
}
fn default_tick_interval_ms() -> u64 {
    10_000
}
fn default_stagnation_ticks() -> u32 {
    2
}
fn default_silence_timeout_ms() -> u64 {
    20_000
}
fn default_silence_ticks() -> u32 {
    2
}
fn default_keepalive_channels() -> Vec<Channel> {
    vec![Channel::Control]
}
fn default_keepalive_message() -> String {
    r#"{"type":"ping"}"#.to_string()
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.1
}
fn default_max_attempts() -> u32 {
    10
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_ice_grace_ms() -> u64 {
    5_000
}
fn default_answer_timeout_ms() -> u64 {
    5_000
}
