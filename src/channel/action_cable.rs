//! ActionCable transport for the notification channel.
//!
//! Handshake sequence:
//! 1. WebSocket upgrade with `Authorization: Bearer <token>` and `Origin`
//! 2. Wait for `{"type":"welcome"}`
//! 3. `{"command":"subscribe","identifier":"{\"channel\":\"NotificationsChannel\"}"}`
//! 4. Wait for `confirm_subscription` (or `reject_subscription`)
//!
//! After confirmation a message loop task owns the socket until the link is
//! dropped, the server goes away, or no traffic (including the server's
//! 3-second ActionCable pings) arrives within the stale timeout.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message};

use super::{
    ChannelConnector, ChannelError, ChannelEvent, ChannelLink, ChannelSink, OutboundMessage,
};
use crate::constants::{CONNECTION_STALE_TIMEOUT, HEALTH_CHECK_INTERVAL};
use crate::keyring::Credential;

/// ActionCable disconnect reason used for revoked credentials.
const REASON_UNAUTHORIZED: &str = "unauthorized";

/// Opens ActionCable subscriptions to the notifications channel.
#[derive(Debug, Clone)]
pub struct CableConnector {
    cable_url: String,
    channel_name: String,
}

impl CableConnector {
    /// Connector for `cable_url` (e.g. `wss://host/cable`).
    pub fn new(cable_url: impl Into<String>, channel_name: impl Into<String>) -> Self {
        Self {
            cable_url: cable_url.into(),
            channel_name: channel_name.into(),
        }
    }

    fn build_request(
        &self,
        credential: &Credential,
    ) -> Result<tungstenite::handshake::client::Request, ChannelError> {
        let mut request = self
            .cable_url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::ConnectionFailed(format!("Invalid cable URL: {e}")))?;

        let authorization = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| ChannelError::Unauthorized("token is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", authorization);

        // ActionCable checks Origin against allowed_request_origins.
        if let Some(origin) = origin_for(&request) {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                request.headers_mut().insert("Origin", value);
            }
        }

        Ok(request)
    }
}

/// `http(s)://host[:port]` for a `ws(s)://` request.
fn origin_for(request: &tungstenite::handshake::client::Request) -> Option<String> {
    let uri = request.uri();
    let scheme = match uri.scheme_str()? {
        "wss" | "https" => "https",
        _ => "http",
    };
    Some(format!("{scheme}://{}", uri.authority()?))
}

/// Channel identifier JSON, itself sent as a string.
pub fn channel_identifier(channel_name: &str) -> String {
    serde_json::json!({ "channel": channel_name }).to_string()
}

/// Subscribe command for `identifier`.
pub fn subscribe_command(identifier: &str) -> String {
    serde_json::json!({
        "command": "subscribe",
        "identifier": identifier,
    })
    .to_string()
}

/// Perform command wrapping an outbound message.
pub fn perform_command(identifier: &str, message: &OutboundMessage) -> String {
    serde_json::json!({
        "command": "message",
        "identifier": identifier,
        "data": message.to_data().to_string(),
    })
    .to_string()
}

/// Parsed ActionCable frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CableFrame {
    /// Connection accepted.
    Welcome,
    /// Server keepalive.
    Ping,
    /// Subscription accepted.
    Confirmed,
    /// Subscription refused.
    Rejected,
    /// Server is closing the connection.
    Disconnect {
        /// Server-supplied reason, if any.
        reason: Option<String>,
    },
    /// Channel broadcast.
    Event {
        /// Event name.
        name: String,
        /// Event payload (`Null` if absent).
        payload: serde_json::Value,
    },
    /// Anything else (unparseable, or a broadcast without an event name).
    Other,
}

impl CableFrame {
    /// Parse a text frame.
    ///
    /// Broadcasts use `{"message":{"event":..,"data":..}}`; `type` and
    /// `payload` are accepted as aliases.
    pub fn parse(text: &str) -> Self {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
            return Self::Other;
        };

        match json.get("type").and_then(|t| t.as_str()) {
            Some("welcome") => return Self::Welcome,
            Some("ping") => return Self::Ping,
            Some("confirm_subscription") => return Self::Confirmed,
            Some("reject_subscription") => return Self::Rejected,
            Some("disconnect") => {
                return Self::Disconnect {
                    reason: json
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .map(ToString::to_string),
                }
            }
            _ => {}
        }

        let Some(message) = json.get("message") else {
            return Self::Other;
        };
        let name = message
            .get("event")
            .or_else(|| message.get("type"))
            .and_then(|n| n.as_str());
        match name {
            Some(name) => Self::Event {
                name: name.to_string(),
                payload: message
                    .get("data")
                    .or_else(|| message.get("payload"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            },
            None => Self::Other,
        }
    }
}

/// Map a failed upgrade to a channel error, separating auth rejections.
fn classify_connect_error(err: tungstenite::Error) -> ChannelError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                ChannelError::Unauthorized(format!("handshake returned HTTP {status}"))
            } else {
                ChannelError::ConnectionFailed(format!("handshake returned HTTP {status}"))
            }
        }
        other => ChannelError::ConnectionFailed(other.to_string()),
    }
}

fn disconnect_error(reason: Option<String>) -> ChannelError {
    match reason.as_deref() {
        Some(REASON_UNAUTHORIZED) => ChannelError::Unauthorized("server disconnect: unauthorized".into()),
        Some(other) => ChannelError::ConnectionFailed(format!("server disconnect: {other}")),
        None => ChannelError::ConnectionFailed("server disconnect".into()),
    }
}

#[async_trait]
impl ChannelConnector for CableConnector {
    async fn open(
        &self,
        credential: Credential,
        sink: ChannelSink,
    ) -> Result<ChannelLink, ChannelError> {
        let session = sink.session();
        let request = self.build_request(&credential)?;

        log::info!("[Connection] Connecting to {} (session {session})", self.cable_url);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify_connect_error)?;

        let (mut ws_sink, mut ws_stream_rx) = ws_stream.split();

        wait_for_welcome(&mut ws_sink, &mut ws_stream_rx).await?;

        let identifier = channel_identifier(&self.channel_name);
        ws_sink
            .send(Message::Text(subscribe_command(&identifier)))
            .await
            .map_err(|e| ChannelError::ConnectionFailed(format!("subscribe failed: {e}")))?;
        log::debug!("[Connection] Sent subscribe for {}", self.channel_name);

        wait_for_confirmation(&mut ws_sink, &mut ws_stream_rx).await?;
        log::info!("[Connection] Subscription confirmed (session {session})");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            run_message_loop(
                &identifier,
                &mut ws_sink,
                &mut ws_stream_rx,
                outbound_rx,
                shutdown_rx,
                &sink,
            )
            .await;
        });

        Ok(ChannelLink::new(session, outbound_tx, shutdown_tx))
    }

    fn endpoint(&self) -> String {
        self.cable_url.clone()
    }
}

/// Wait for the ActionCable welcome message after connecting.
async fn wait_for_welcome<S, St>(ws_sink: &mut S, ws_stream_rx: &mut St) -> Result<(), ChannelError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = ws_stream_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match CableFrame::parse(&text) {
                CableFrame::Welcome => {
                    log::debug!("[Connection] Received welcome");
                    return Ok(());
                }
                CableFrame::Disconnect { reason } => return Err(disconnect_error(reason)),
                _ => {}
            },
            Ok(Message::Ping(data)) => {
                let _ = ws_sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                return Err(ChannelError::ConnectionFailed("closed before welcome".into()));
            }
            Err(e) => {
                return Err(ChannelError::ConnectionFailed(format!(
                    "error waiting for welcome: {e}"
                )));
            }
            _ => {}
        }
    }

    Err(ChannelError::ConnectionFailed("stream ended before welcome".into()))
}

/// Wait for the server to confirm or reject the subscription.
async fn wait_for_confirmation<S, St>(
    ws_sink: &mut S,
    ws_stream_rx: &mut St,
) -> Result<(), ChannelError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = ws_stream_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match CableFrame::parse(&text) {
                CableFrame::Confirmed => return Ok(()),
                CableFrame::Rejected => {
                    return Err(ChannelError::Unauthorized("subscription rejected".into()));
                }
                CableFrame::Disconnect { reason } => return Err(disconnect_error(reason)),
                _ => {}
            },
            Ok(Message::Ping(data)) => {
                let _ = ws_sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                return Err(ChannelError::ConnectionFailed(
                    "closed before subscription confirmed".into(),
                ));
            }
            Err(e) => {
                return Err(ChannelError::ConnectionFailed(format!(
                    "error waiting for confirmation: {e}"
                )));
            }
            _ => {}
        }
    }

    Err(ChannelError::ConnectionFailed(
        "stream ended before subscription confirmed".into(),
    ))
}

/// Inner message loop for one subscribed connection.
///
/// Returns after emitting exactly one terminal event (`Closed` or
/// `Rejected`), or silently when the link is dropped or the sink's
/// receiver is gone.
async fn run_message_loop<S, St>(
    identifier: &str,
    ws_sink: &mut S,
    ws_stream_rx: &mut St,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    sink: &ChannelSink,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut last_activity = Instant::now();
    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let closed = |reason: String| {
        log::info!("[Connection] Session {} closed: {reason}", sink.session());
        let _ = sink.emit(ChannelEvent::Closed { reason });
    };

    loop {
        tokio::select! {
            msg = ws_stream_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        match CableFrame::parse(&text) {
                            CableFrame::Event { name, payload } => {
                                log::debug!("[Connection] Received '{name}'");
                                if !sink.emit(ChannelEvent::Message { event: name, payload }) {
                                    log::debug!("[Connection] Event receiver dropped");
                                    let _ = ws_sink.close().await;
                                    return;
                                }
                            }
                            CableFrame::Rejected => {
                                log::warn!("[Connection] Subscription revoked by server");
                                let _ = sink.emit(ChannelEvent::Rejected {
                                    reason: "subscription rejected".into(),
                                });
                                return;
                            }
                            CableFrame::Disconnect { reason } => {
                                match disconnect_error(reason) {
                                    ChannelError::Unauthorized(reason) => {
                                        log::warn!("[Connection] Server revoked session: {reason}");
                                        let _ = sink.emit(ChannelEvent::Rejected { reason });
                                    }
                                    other => closed(other.to_string()),
                                }
                                return;
                            }
                            CableFrame::Ping | CableFrame::Welcome | CableFrame::Confirmed => {}
                            CableFrame::Other => {
                                log::trace!("[Connection] Unhandled frame: {text}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                            closed(format!("pong failed: {e}"));
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        closed("closed by server".into());
                        return;
                    }
                    Some(Err(e)) => {
                        closed(format!("websocket error: {e}"));
                        return;
                    }
                    None => {
                        closed("stream ended".into());
                        return;
                    }
                    Some(Ok(_)) => {
                        last_activity = Instant::now();
                    }
                }
            }

            Some(message) = outbound_rx.recv() => {
                let action = message.action();
                if let Err(e) = ws_sink.send(Message::Text(perform_command(identifier, &message))).await {
                    closed(format!("send '{action}' failed: {e}"));
                    return;
                }
                log::debug!("[Connection] Sent '{action}'");
            }

            _ = health.tick() => {
                if last_activity.elapsed() > CONNECTION_STALE_TIMEOUT {
                    let _ = ws_sink.close().await;
                    closed(format!(
                        "no traffic for {}s",
                        CONNECTION_STALE_TIMEOUT.as_secs()
                    ));
                    return;
                }
            }

            _ = &mut shutdown_rx => {
                log::debug!("[Connection] Closing session {}", sink.session());
                let _ = ws_sink.close().await;
                return;
            }
        }
    }
}
