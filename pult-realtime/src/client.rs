//! Public entry point: [`RealtimeClient`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use url::Url;

use crate::Error;
use crate::channel::Channel;
use crate::connection::{Command, Driver};
use crate::protocol::Frame;
use crate::registry::Registry;
use crate::transport::{Endpoint, Transport, WsTransport, derive_endpoint};
use crate::types::{ChannelOptions, ClientConfig, ConnectionState};

type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Client for the realtime socket.
///
/// All channels share one connection, driven by a background task spawned on
/// the current Tokio runtime. Clones share the same connection; the task
/// exits once every clone has been dropped.
///
/// Sending is fire-and-forget: frames sent while the connection is not open
/// are dropped, and nothing is replayed after a reconnect.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    shared: Mutex<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    endpoint: Endpoint,
}

struct Shared {
    state: ConnectionState,
    /// Bumped on every successful open.
    generation: u64,
    registry: Registry,
    on_open: Vec<LifecycleCallback>,
    on_close: Vec<LifecycleCallback>,
    on_error: Vec<ErrorCallback>,
}

impl RealtimeClient {
    /// Create a client that connects over WebSocket.
    ///
    /// Must be called from within a Tokio runtime. No connection is opened
    /// until [`connect`](Self::connect) or [`Channel::subscribe`] is called.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Self::with_transport(config, Arc::new(WsTransport))
    }

    /// Create a client that opens connections through `transport`.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let endpoint = derive_endpoint(&config.url, &config.token, &config.headers)?;
        let timing = config.timing.unwrap_or_default();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            shared: Mutex::new(Shared {
                state: ConnectionState::Closed,
                generation: 0,
                registry: Registry::default(),
                on_open: Vec::new(),
                on_close: Vec::new(),
                on_error: Vec::new(),
            }),
            commands: commands_tx,
            endpoint: endpoint.clone(),
        });

        let driver = Driver::new(
            Arc::downgrade(&inner),
            commands_rx,
            transport,
            endpoint,
            timing,
        );
        runtime.spawn(driver.run());

        Ok(Self { inner })
    }

    /// Open the connection. A no-op while open or connecting.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Close the connection and disable automatic reconnection until the next
    /// successful open. Cancels a pending reconnect and stops heartbeats.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Close the connection without reconnecting. Unlike
    /// [`disconnect`](Self::disconnect), a later failed [`connect`](Self::connect)
    /// still retries with backoff.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.shared().state
    }

    /// The socket URL, including the token query parameter.
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint.url
    }

    /// Channel for `name` with default options.
    pub fn channel(&self, name: &str) -> Channel {
        self.channel_with(name, ChannelOptions::default())
    }

    /// Channel for `name`, created with `options` if it does not exist yet.
    ///
    /// An existing channel is returned unchanged; `options` are ignored for it.
    pub fn channel_with(&self, name: &str, options: ChannelOptions) -> Channel {
        let mut shared = self.inner.shared();
        let (channel, created) = shared.registry.get_or_insert_with(name, || {
            Channel::new(name, options.clone(), Arc::downgrade(&self.inner))
        });
        if created {
            tracing::debug!(topic = name, "Channel created");
        } else if channel.options() != &options {
            tracing::debug!(topic = name, "Channel exists, ignoring new options");
        }
        channel
    }

    /// Remove the channel for `name`. Disconnects when no channel is left.
    pub fn remove_channel(&self, name: &str) {
        let (removed, empty) = {
            let mut shared = self.inner.shared();
            let removed = shared.registry.remove(name).is_some();
            (removed, shared.registry.is_empty())
        };
        if removed && empty {
            tracing::info!("Last channel removed, disconnecting");
            self.inner.disconnect();
        }
    }

    /// Topics of all registered channels, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.inner.shared().registry.topics()
    }

    /// Called after every successful open, once channels have rejoined.
    pub fn on_open<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.shared().on_open.push(Arc::new(callback));
    }

    /// Called whenever an open connection closes, for any reason.
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.shared().on_close.push(Arc::new(callback));
    }

    /// Called for failed connect attempts and transport errors.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.shared().on_error.push(Arc::new(callback));
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared();
        f.debug_struct("RealtimeClient")
            .field("host", &self.inner.endpoint.url.host_str())
            .field("state", &shared.state)
            .field("channels", &shared.registry.topics())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared state, used by channels and the driver
// ---------------------------------------------------------------------------

impl ClientInner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            tracing::warn!("Connection driver is gone");
            return false;
        }
        true
    }

    pub(crate) fn connect(&self) {
        {
            let mut shared = self.shared();
            if matches!(
                shared.state,
                ConnectionState::Open | ConnectionState::Connecting
            ) {
                return;
            }
            shared.state = ConnectionState::Connecting;
        }
        self.command(Command::Connect);
    }

    /// Marks the connection `Closing` before the driver acts, so a
    /// `connect()` issued right after queues a fresh attempt behind the close.
    pub(crate) fn disconnect(&self) {
        self.mark_closing();
        self.command(Command::Disconnect);
    }

    pub(crate) fn close(&self) {
        self.mark_closing();
        self.command(Command::Close);
    }

    /// Queue `frame` for the open connection. Returns `false`, dropping the
    /// frame, when the connection is not open.
    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        let generation = {
            let shared = self.shared();
            if shared.state != ConnectionState::Open {
                tracing::debug!(
                    topic = %frame.topic,
                    event = %frame.event,
                    state = ?shared.state,
                    "Connection not open, dropping frame"
                );
                return false;
            }
            shared.generation
        };
        self.command(Command::Send { frame, generation })
    }

    pub(crate) fn lookup(&self, topic: &str) -> Option<Channel> {
        self.shared().registry.get(topic)
    }

    /// Unregister `channel` if it is still the live instance for its topic.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let (removed, empty) = {
            let mut shared = self.shared();
            let removed = shared.registry.remove_instance(channel);
            (removed, shared.registry.is_empty())
        };
        if removed && empty {
            tracing::info!("Last channel removed, disconnecting");
            self.disconnect();
        }
    }

    // -----------------------------------------------------------------------
    // Driver transitions
    // -----------------------------------------------------------------------

    pub(crate) fn is_live(&self) -> bool {
        matches!(
            self.shared().state,
            ConnectionState::Open | ConnectionState::Connecting
        )
    }

    pub(crate) fn mark_connecting(&self) {
        self.shared().state = ConnectionState::Connecting;
    }

    pub(crate) fn mark_closing(&self) {
        let mut shared = self.shared();
        if shared.state != ConnectionState::Closed {
            shared.state = ConnectionState::Closing;
        }
    }

    /// Transition to Open. Returns the new generation and the channels that
    /// should rejoin.
    pub(crate) fn mark_open(&self) -> (u64, Vec<Channel>) {
        let mut shared = self.shared();
        shared.state = ConnectionState::Open;
        shared.generation += 1;
        (shared.generation, shared.registry.channels())
    }

    /// Transition to Closed and reset every channel's join state. Returns the
    /// close callbacks for the caller to run.
    pub(crate) fn mark_closed(&self) -> Vec<LifecycleCallback> {
        let (channels, callbacks) = {
            let mut shared = self.shared();
            shared.state = ConnectionState::Closed;
            (shared.registry.channels(), shared.on_close.clone())
        };
        for channel in &channels {
            channel.reset_join();
        }
        callbacks
    }

    pub(crate) fn open_callbacks(&self) -> Vec<LifecycleCallback> {
        self.shared().on_open.clone()
    }

    pub(crate) fn error_callbacks(&self) -> Vec<ErrorCallback> {
        self.shared().on_error.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
