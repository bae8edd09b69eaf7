//! Realtime client for Pult: many pub/sub channels over one WebSocket.
//!
//! Implements the Phoenix-style frame protocol spoken by the Pult realtime
//! server: JSON text frames of `{topic, event, payload, ref}`.
//!
//! # Features
//! - One shared socket for every channel, opened lazily on first subscribe
//! - Automatic reconnect with capped exponential backoff
//! - Channels with bindings rejoin after every reconnect
//! - Row-change, broadcast and presence bindings with wildcard matching
//! - Heartbeat frames while the connection is open
//!
//! Sends are fire-and-forget. Frames sent while the connection is not open
//! are dropped; nothing is buffered or replayed.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pult_realtime::Error> {
//! use pult_realtime::{ChangeEvent, ClientConfig, RealtimeClient};
//!
//! let client = RealtimeClient::new(ClientConfig::new("https://api.pult.dev", "token"))?;
//! let orders = client.channel("orders");
//! orders.on(ChangeEvent::Insert, "orders", |row| {
//!     println!("new order: {row}");
//! });
//! orders.subscribe();
//! # Ok(())
//! # }
//! ```

mod backoff;
mod channel;
mod client;
mod connection;
mod dispatch;
pub mod protocol;
mod registry;
pub mod transport;
mod types;

pub use channel::{Callback, Channel};
pub use client::RealtimeClient;
pub use protocol::{BindingKey, ChangeEvent, Frame, PresencePhase};
pub use transport::{Endpoint, Link, Transport, WsTransport};
pub use types::{
    BroadcastOptions, ChannelOptions, ClientConfig, ConnectionState, Error, JoinState,
    PresenceOptions, TimingConfig,
};
