//! Public types for the pult-realtime crate.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio_tungstenite::tungstenite;

/// Lifecycle state of the shared socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Join state of a single [`Channel`](crate::Channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    NotJoined,
    /// A join was requested but the frame has not reached an open connection yet.
    Joining,
    Joined,
}

/// Timing knobs for the connection driver.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Base of the exponential reconnect backoff.
    pub reconnect_base_delay: Duration,
    /// Upper bound for a single reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Consecutive failed attempts after which reconnection stops.
    pub max_reconnect_attempts: u32,
    /// Interval between heartbeat frames while the connection is open.
    pub heartbeat_interval: Duration,
    /// Timeout applied to a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(1_000),
            max_reconnect_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP(S) base URL of the API. `ws://`/`wss://` URLs are accepted as-is.
    pub url: String,
    /// Bearer token, sent as the `token` query parameter.
    pub token: String,
    /// Extra headers sent with the WebSocket upgrade request.
    pub headers: HashMap<String, String>,
    /// Timing overrides. Defaults to [`TimingConfig::default`].
    pub timing: Option<TimingConfig>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            headers: HashMap::new(),
            timing: None,
        }
    }
}

/// Per-channel options, announced to the server in the join frame.
///
/// Options only take effect when the channel is first created; asking the
/// client for an existing channel with different options keeps the first
/// ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelOptions {
    pub broadcast: BroadcastOptions,
    pub presence: PresenceOptions,
    /// Database schema used for change-notification filters.
    #[serde(skip)]
    pub schema: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            broadcast: BroadcastOptions::default(),
            presence: PresenceOptions::default(),
            schema: "public".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadcastOptions {
    /// Echo broadcasts sent by this client back to it.
    #[serde(rename = "self")]
    pub echo_self: bool,
    /// Ask the server to acknowledge broadcasts.
    pub ack: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceOptions {
    /// Key identifying this client in presence state. Empty lets the server pick one.
    pub key: String,
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connect attempt timed out")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No Tokio runtime available to drive the connection")]
    NoRuntime,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
