//! Socket transport: endpoint derivation and the WebSocket implementation of
//! [`Transport`].

use std::collections::HashMap;
use std::pin::Pin;

use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use url::Url;

use crate::Error;

/// Path appended to the base URL to reach the realtime socket.
pub const SOCKET_PATH: &str = "websocket";

/// Outbound half of a connected socket. Items are encoded frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
/// Inbound half of a connected socket. The stream ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

/// One physical connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Where and how to open the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

/// Opens physical connections for the connection driver.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, Error>;
}

// ---------------------------------------------------------------------------
// Endpoint derivation
// ---------------------------------------------------------------------------

/// Build the socket endpoint from an HTTP(S) base URL.
///
/// `http` becomes `ws`, `https` becomes `wss`, `/websocket` is appended to the
/// path and a non-empty token is carried as the `token` query parameter.
pub fn derive_endpoint(
    base: &str,
    token: &str,
    headers: &HashMap<String, String>,
) -> Result<Endpoint, Error> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::UnsupportedScheme(scheme.to_string()))?;

    let path = format!("{}/{SOCKET_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    if !token.is_empty() {
        url.query_pairs_mut().append_pair("token", token);
    }

    let mut headers: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.sort();
    Ok(Endpoint { url, headers })
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// [`Transport`] backed by `tokio-tungstenite`. Frames travel as text messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, Error> {
        let mut request = endpoint.url.as_str().into_client_request()?;
        for (name, value) in &endpoint.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidHeader(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws.split();

        let sink = write.with(|text: String| {
            future::ready(Ok::<_, Error>(tungstenite::Message::Text(text.into())))
        });
        let stream = read.filter_map(|frame| {
            future::ready(match frame {
                Ok(tungstenite::Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(tungstenite::Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!("Dropping non-UTF-8 binary frame");
                        None
                    }
                },
                // Ping/pong are answered by tungstenite; close ends the stream.
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory transport for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;

    /// Server side of one accepted mock connection.
    pub(crate) struct MockPeer {
        /// Frames written by the client.
        pub outbound: mpsc::UnboundedReceiver<String>,
        /// Frames (or errors) delivered to the client. Dropping it closes the link.
        pub inbound: mpsc::UnboundedSender<Result<String, Error>>,
    }

    impl MockPeer {
        pub(crate) async fn next_frame(&mut self) -> Option<crate::protocol::Frame> {
            let text = self.outbound.recv().await?;
            crate::protocol::decode_frame(&text).ok()
        }

        pub(crate) fn push(&self, text: &str) {
            let _ = self.inbound.send(Ok(text.to_string()));
        }
    }

    pub(crate) struct MockTransport {
        refuse: AtomicBool,
        /// Connect attempts never complete while set.
        stall: AtomicBool,
        connects: Mutex<Vec<Instant>>,
        peers: mpsc::UnboundedSender<MockPeer>,
    }

    impl MockTransport {
        pub(crate) fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                refuse: AtomicBool::new(false),
                stall: AtomicBool::new(false),
                connects: Mutex::new(Vec::new()),
                peers: tx,
            };
            (std::sync::Arc::new(transport), rx)
        }

        pub(crate) fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        pub(crate) fn set_stall(&self, stall: bool) {
            self.stall.store(stall, Ordering::SeqCst);
        }

        pub(crate) fn connect_times(&self) -> Vec<Instant> {
            self.connects.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, _endpoint: &Endpoint) -> Result<Link, Error> {
            self.connects.lock().unwrap().push(Instant::now());
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::Transport("connection refused".to_string()));
            }
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<String, Error>>();
            let _ = self.peers.send(MockPeer {
                outbound: out_rx,
                inbound: in_tx,
            });

            let sink = futures_util::sink::unfold(out_tx, |tx, text: String| async move {
                tx.send(text).map_err(|_| Error::ConnectionClosed)?;
                Ok::<_, Error>(tx)
            });
            let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Link {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
    }
}
