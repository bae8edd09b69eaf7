//! Connection driver: owns the socket, the reconnect timer and the heartbeat.
//!
//! One driver task runs per client. Every state change of the physical
//! connection happens on this task, so inbound dispatch, rejoin and
//! reconnect never race each other.

use std::future::pending;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::Error;
use crate::backoff::ReconnectPolicy;
use crate::client::ClientInner;
use crate::dispatch;
use crate::protocol::{Frame, encode_frame, heartbeat_frame};
use crate::transport::{Endpoint, Link, Transport};
use crate::types::TimingConfig;

/// Requests from client and channel handles to the driver.
pub(crate) enum Command {
    Connect,
    /// `generation` is the open connection the frame was accepted for.
    Send {
        frame: Frame,
        generation: u64,
    },
    Close,
    Disconnect,
}

type PendingConnect = BoxFuture<'static, Result<Link, Error>>;

pub(crate) struct Driver {
    client: Weak<ClientInner>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    timing: TimingConfig,
    policy: ReconnectPolicy,
    link: Option<Link>,
    /// Generation of `link`, as assigned by the client on open.
    link_generation: Option<u64>,
    pending: Option<PendingConnect>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    heartbeat_ref: u64,
}

impl Driver {
    pub(crate) fn new(
        client: Weak<ClientInner>,
        commands: mpsc::UnboundedReceiver<Command>,
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        timing: TimingConfig,
    ) -> Self {
        Self {
            client,
            commands,
            transport,
            endpoint,
            policy: ReconnectPolicy::new(&timing),
            timing,
            link: None,
            link_generation: None,
            pending: None,
            reconnect_at: None,
            heartbeat: None,
            heartbeat_ref: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::debug!("Client dropped, connection driver exiting");
                        self.shutdown().await;
                        return;
                    }
                },

                result = poll_pending(&mut self.pending) => {
                    self.pending = None;
                    self.on_connect_result(result).await;
                }

                frame = next_inbound(&mut self.link) => {
                    self.on_inbound(frame).await;
                }

                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.on_reconnect_timer();
                }

                _ = tick_opt(&mut self.heartbeat) => {
                    self.send_heartbeat().await;
                }
            }
        }
    }

    fn client(&self) -> Option<Arc<ClientInner>> {
        self.client.upgrade()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            // A Connect queued behind a Close/Disconnect finds no link here and
            // starts a fresh attempt.
            Command::Connect => {
                if self.link.is_some() || self.pending.is_some() {
                    tracing::trace!("Already connected or connecting");
                    return;
                }
                self.start_connect();
            }
            Command::Send { frame, generation } => {
                if self.link.is_none() || self.link_generation != Some(generation) {
                    tracing::debug!(
                        topic = %frame.topic,
                        event = %frame.event,
                        "Dropping frame queued for a previous connection"
                    );
                    return;
                }
                self.write(&frame).await;
            }
            Command::Close => self.close().await,
            Command::Disconnect => {
                self.policy.exhaust();
                self.close().await;
            }
        }
    }

    fn start_connect(&mut self) {
        self.reconnect_at = None;
        if let Some(client) = self.client() {
            client.mark_connecting();
        }
        tracing::info!(
            host = self.endpoint.url.host_str().unwrap_or_default(),
            attempt = self.policy.attempts(),
            "Connecting"
        );

        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        let timeout = self.timing.connect_timeout;
        self.pending = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, transport.connect(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            }
        }));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    async fn on_connect_result(&mut self, result: Result<Link, Error>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.policy.reset();
                self.reconnect_at = None;
                self.start_heartbeat();

                let Some(client) = self.client() else {
                    return;
                };
                let (generation, channels) = client.mark_open();
                self.link_generation = Some(generation);
                tracing::info!(channels = channels.len(), generation, "Connected");
                for channel in &channels {
                    channel.rejoin(&client);
                }
                for callback in client.open_callbacks() {
                    callback();
                }
            }
            Err(e) => {
                tracing::warn!(attempt = self.policy.attempts(), "Connect attempt failed: {e}");
                self.report_error(&e);
                self.connection_lost().await;
            }
        }
    }

    async fn on_inbound(&mut self, frame: Option<Result<String, Error>>) {
        match frame {
            Some(Ok(text)) => {
                if let Some(client) = self.client() {
                    dispatch::route(&text, |topic| client.lookup(topic));
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Transport error: {e}");
                self.report_error(&e);
                self.connection_lost().await;
            }
            None => {
                tracing::info!("Socket closed by peer");
                self.connection_lost().await;
            }
        }
    }

    /// The socket went away without the caller asking for it.
    async fn connection_lost(&mut self) {
        self.stop_heartbeat();
        let was_open = self.link.is_some();
        self.link_generation = None;
        if let Some(mut link) = self.link.take() {
            let _ = link.sink.close().await;
        }
        if let Some(client) = self.client() {
            let callbacks = client.mark_closed();
            if was_open {
                for callback in callbacks {
                    callback();
                }
            }
        }

        match self.policy.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = self.policy.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                tracing::warn!(
                    attempts = self.policy.attempts(),
                    "Reconnect attempts exhausted, staying closed"
                );
            }
        }
    }

    fn on_reconnect_timer(&mut self) {
        if self.link.is_some() || self.pending.is_some() {
            return;
        }
        if self.client().is_some_and(|c| c.is_live()) {
            tracing::debug!("Connection already live, skipping scheduled reconnect");
            return;
        }
        self.start_connect();
    }

    /// Caller-initiated close. Cancels any pending reconnect and connect attempt.
    async fn close(&mut self) {
        self.reconnect_at = None;
        self.pending = None;
        self.stop_heartbeat();

        let client = self.client();
        if let Some(client) = &client {
            client.mark_closing();
        }
        let was_open = self.link.is_some();
        self.link_generation = None;
        if let Some(mut link) = self.link.take() {
            let _ = link.sink.close().await;
            tracing::info!("Connection closed");
        }
        if let Some(client) = client {
            let callbacks = client.mark_closed();
            if was_open {
                for callback in callbacks {
                    callback();
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.pending = None;
        self.stop_heartbeat();
        self.link_generation = None;
        if let Some(mut link) = self.link.take() {
            let _ = link.sink.close().await;
        }
    }

    fn report_error(&self, error: &Error) {
        if let Some(client) = self.client() {
            for callback in client.error_callbacks() {
                callback(error);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    async fn write(&mut self, frame: &Frame) {
        let text = match encode_frame(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(topic = %frame.topic, "Failed to encode frame: {e}");
                return;
            }
        };
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let result = link.sink.send(text).await;
        if let Err(e) = result {
            tracing::warn!(topic = %frame.topic, "Failed to write frame: {e}");
            self.report_error(&e);
            self.connection_lost().await;
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    fn start_heartbeat(&mut self) {
        let period = self.timing.heartbeat_interval;
        if self.heartbeat.is_some() || period.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
    }

    async fn send_heartbeat(&mut self) {
        self.heartbeat_ref += 1;
        tracing::trace!(reference = self.heartbeat_ref, "Sending heartbeat");
        self.write(&heartbeat_frame(self.heartbeat_ref)).await;
    }
}

// ---------------------------------------------------------------------------
// Optional select! branches
// ---------------------------------------------------------------------------

async fn poll_pending(pending_connect: &mut Option<PendingConnect>) -> Result<Link, Error> {
    match pending_connect {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_inbound(link: &mut Option<Link>) -> Option<Result<String, Error>> {
    match link {
        Some(link) => link.stream.next().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
