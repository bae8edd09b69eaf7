//! Per-topic channel: join state machine, binding table, and outbound
//! message composition.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

use crate::client::ClientInner;
use crate::protocol::{self, BindingKey, ChangeEvent, Frame, PresencePhase};
use crate::types::{ChannelOptions, JoinState};

/// Callback invoked with the payload of a matching inbound event.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle to a topic on the shared connection.
///
/// Handles are cheap to clone; clones refer to the same channel. The channel
/// keeps only a weak reference to its client, so holding a `Channel` does not
/// keep the connection alive.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    topic: String,
    options: ChannelOptions,
    client: Weak<ClientInner>,
    core: Mutex<ChannelCore>,
}

struct ChannelCore {
    join_state: JoinState,
    /// Set by `subscribe`, cleared by `unsubscribe`. Only subscribed channels rejoin.
    subscribed: bool,
    bindings: HashMap<BindingKey, Vec<Callback>>,
}

impl Channel {
    pub(crate) fn new(topic: &str, options: ChannelOptions, client: Weak<ClientInner>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                topic: topic.to_string(),
                options,
                client,
                core: Mutex::new(ChannelCore {
                    join_state: JoinState::NotJoined,
                    subscribed: false,
                    bindings: HashMap::new(),
                }),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub fn join_state(&self) -> JoinState {
        self.core().join_state
    }

    /// Total number of bound callbacks across all keys.
    pub fn binding_count(&self) -> usize {
        self.core().bindings.values().map(Vec::len).sum()
    }

    // -----------------------------------------------------------------------
    // Bindings
    // -----------------------------------------------------------------------

    /// Bind a callback to row changes of `event` on `table`.
    ///
    /// Use [`ChangeEvent::All`] for every change category and
    /// [`protocol::ANY_TABLE`] (`"*"`) for every table.
    pub fn on<F>(&self, event: ChangeEvent, table: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let key = BindingKey::Change {
            event,
            table: table.into(),
        };
        self.bind(key, Arc::new(callback));
    }

    pub fn on_broadcast<F>(&self, event: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bind(BindingKey::Broadcast(event.into()), Arc::new(callback));
    }

    pub fn on_presence<F>(&self, phase: PresencePhase, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bind(BindingKey::Presence(phase), Arc::new(callback));
    }

    fn bind(&self, key: BindingKey, callback: Callback) {
        tracing::debug!(topic = %self.topic(), key = %key, "Binding callback");
        self.core().bindings.entry(key).or_default().push(callback);
    }

    // -----------------------------------------------------------------------
    // Join state machine
    // -----------------------------------------------------------------------

    /// Open the connection if needed and join this topic.
    ///
    /// A no-op while already joined or joining, and for a handle that is no
    /// longer registered with its client. When the connection is not open
    /// yet, the channel stays `Joining` and the join frame goes out once the
    /// connection opens.
    pub fn subscribe(&self) {
        let Some(client) = self.client() else {
            tracing::warn!(topic = %self.topic(), "Client dropped, cannot subscribe");
            return;
        };
        if !self.is_registered(&client) {
            tracing::warn!(
                topic = %self.topic(),
                "Channel was removed from its client, cannot subscribe"
            );
            return;
        }
        client.connect();
        {
            let mut core = self.core();
            core.subscribed = true;
            if matches!(core.join_state, JoinState::Joined | JoinState::Joining) {
                tracing::debug!(topic = %self.topic(), state = ?core.join_state, "Already joined");
                return;
            }
            core.join_state = JoinState::Joining;
        }
        self.send_join(&client);
    }

    /// Leave the topic and remove the channel from its client.
    ///
    /// No `leave` is sent when another channel has since been registered for
    /// the same topic.
    pub fn unsubscribe(&self) {
        let client = self.client();
        if let Some(client) = &client {
            let replaced = client
                .lookup(self.topic())
                .is_some_and(|current| current != *self);
            if replaced {
                tracing::debug!(topic = %self.topic(), "Topic has a newer channel, not leaving");
            } else {
                client.send_frame(protocol::leave_frame(self.topic()));
            }
        }
        {
            let mut core = self.core();
            core.subscribed = false;
            core.join_state = JoinState::NotJoined;
        }
        tracing::info!(topic = %self.topic(), "Channel unsubscribed");
        if let Some(client) = client {
            client.remove_channel(self);
        }
    }

    /// Re-announce the join after a fresh open.
    ///
    /// Only subscribed channels send a frame, and only when they have bindings
    /// or a join still pending from before the connection opened.
    pub(crate) fn rejoin(&self, client: &ClientInner) {
        {
            let mut core = self.core();
            if !core.subscribed {
                return;
            }
            if core.bindings.is_empty() && core.join_state != JoinState::Joining {
                return;
            }
            core.join_state = JoinState::Joining;
        }
        self.send_join(client);
    }

    /// Join state does not survive the physical connection. A pending join
    /// is kept and goes out on the next open.
    pub(crate) fn reset_join(&self) {
        let mut core = self.core();
        if core.join_state == JoinState::Joined {
            core.join_state = JoinState::NotJoined;
        }
    }

    fn send_join(&self, client: &ClientInner) {
        let frame = protocol::join_frame(self.topic(), self.join_config());
        let sent = client.send_frame(frame);
        let mut core = self.core();
        if sent && core.join_state == JoinState::Joining {
            // No join reply is awaited.
            core.join_state = JoinState::Joined;
            tracing::info!(topic = %self.topic(), "Channel joined");
        } else if !sent {
            tracing::debug!(topic = %self.topic(), "Connection not open, join deferred");
        }
    }

    /// Join `config`: channel options plus the change filters of every change binding.
    fn join_config(&self) -> Value {
        let options = &self.inner.options;
        let mut filters: Vec<(ChangeEvent, String)> = self
            .core()
            .bindings
            .keys()
            .filter_map(|key| match key {
                BindingKey::Change { event, table } => Some((*event, table.clone())),
                _ => None,
            })
            .collect();
        filters.sort();

        let changes: Vec<Value> = filters
            .into_iter()
            .map(|(event, table)| {
                serde_json::json!({
                    "event": event.as_str(),
                    "schema": options.schema,
                    "table": table,
                })
            })
            .collect();

        let mut config = serde_json::to_value(options).unwrap_or_default();
        if let Value::Object(map) = &mut config {
            map.insert("postgres_changes".to_string(), Value::Array(changes));
        }
        config
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send a custom event on this topic. Dropped if the connection is not open.
    pub fn send(&self, event: impl Into<String>, payload: Value) {
        self.forward(Frame::new(self.topic(), event, payload));
    }

    /// Relay `payload` to every subscriber of this topic under `event`.
    pub fn broadcast(&self, event: &str, payload: Value) {
        self.forward(protocol::broadcast_frame(self.topic(), event, payload));
    }

    /// Announce this client's presence metadata on the topic.
    pub fn track(&self, meta: Value) {
        self.forward(protocol::track_frame(self.topic(), meta));
    }

    fn forward(&self, frame: Frame) {
        match self.client() {
            Some(client) => {
                client.send_frame(frame);
            }
            None => {
                tracing::debug!(topic = %self.topic(), event = %frame.event, "Client dropped, discarding frame");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Invoke every callback bound under a key the event `name` reaches, in
    /// key order and then registration order. Returns the number of
    /// invocations.
    pub(crate) fn handle_event(&self, name: &str, payload: &Value) -> usize {
        let callbacks: Vec<Callback> = {
            let core = self.core();
            BindingKey::for_frame(name, payload)
                .iter()
                .filter_map(|key| core.bindings.get(key))
                .flatten()
                .cloned()
                .collect()
        };
        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn core(&self) -> MutexGuard<'_, ChannelCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Option<Arc<ClientInner>> {
        self.inner.client.upgrade()
    }

    fn is_registered(&self, client: &ClientInner) -> bool {
        client.lookup(self.topic()).as_ref() == Some(self)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("join_state", &self.join_state())
            .field("bindings", &self.binding_count())
            .finish()
    }
}
