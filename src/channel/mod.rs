//! Persistent notification channel abstraction.
//!
//! A [`ChannelConnector`] opens one long-lived link to the notification
//! service, presenting the bearer token during the handshake. Inbound
//! events flow back through a [`ChannelSink`] tagged with the
//! [`SessionId`] of the attempt that produced them, so the sync core can
//! drop anything belonging to a torn-down session. Outbound messages go
//! through the returned [`ChannelLink`].
//!
//! ```text
//! ChannelConnector (trait)
//!     └── CableConnector (ActionCable over tokio-tungstenite)
//!             ├── handshake: Authorization: Bearer <token>
//!             ├── subscribe NotificationsChannel
//!             └── message loop task ──► ChannelSink ──► sync core
//! ```

pub mod action_cable;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::keyring::Credential;
use crate::notification::{Notification, NotificationPreferences};

pub use action_cable::CableConnector;

/// Identity of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state of the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    #[default]
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Subscribed and receiving events.
    Connected,
    /// Last attempt or link failed; retried on the next reconciliation tick.
    Failed(String),
}

impl ConnectionState {
    /// `true` only for [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Errors from opening or running a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Transport or protocol failure. Transient.
    ConnectionFailed(String),
    /// Server rejected the credential.
    Unauthorized(String),
    /// Attempt exceeded the connect timeout.
    Timeout,
    /// Link closed.
    Closed,
}

impl ChannelError {
    /// `true` when the credential itself was rejected.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Unauthorized(msg) => write!(f, "Credential rejected: {msg}"),
            Self::Timeout => write!(f, "Connection attempt timed out"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Raw event delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Named server event with its JSON payload.
    Message {
        /// Event name, e.g. `notification-pushed`.
        event: String,
        /// Event payload.
        payload: serde_json::Value,
    },
    /// Link dropped; the session is over.
    Closed {
        /// Human-readable cause.
        reason: String,
    },
    /// Server revoked the session because the credential is invalid.
    Rejected {
        /// Human-readable cause.
        reason: String,
    },
}

/// Typed inbound event routed to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A new notification.
    NotificationPushed(Notification),
    /// Authoritative unread count.
    UnreadCount(u32),
}

/// Why an inbound event was not routed.
#[derive(Debug)]
pub enum EventDecodeError {
    /// Event name is not one this client understands.
    Unrecognized(String),
    /// Known event with a payload that does not parse.
    InvalidPayload {
        /// Event name.
        event: String,
        /// Parser message.
        reason: String,
    },
}

impl std::fmt::Display for EventDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unrecognized(name) => write!(f, "Unrecognized event '{name}'"),
            Self::InvalidPayload { event, reason } => {
                write!(f, "Invalid payload for '{event}': {reason}")
            }
        }
    }
}

impl std::error::Error for EventDecodeError {}

/// Inbound event name for pushed notifications.
pub const EVENT_NOTIFICATION_PUSHED: &str = "notification-pushed";
/// Inbound event name for authoritative unread counts.
pub const EVENT_UNREAD_COUNT: &str = "unread-count";

#[derive(Deserialize)]
struct UnreadCountPayload {
    unread_count: i64,
}

impl InboundEvent {
    /// Decode a named event.
    pub fn decode(event: &str, payload: serde_json::Value) -> Result<Self, EventDecodeError> {
        let invalid = |e: serde_json::Error| EventDecodeError::InvalidPayload {
            event: event.to_string(),
            reason: e.to_string(),
        };

        match event {
            EVENT_NOTIFICATION_PUSHED => serde_json::from_value::<Notification>(payload)
                .map(Self::NotificationPushed)
                .map_err(invalid),
            EVENT_UNREAD_COUNT => {
                let count = match payload {
                    serde_json::Value::Number(ref n) => {
                        n.as_i64().ok_or_else(|| EventDecodeError::InvalidPayload {
                            event: event.to_string(),
                            reason: format!("unread count {n} is not an integer"),
                        })?
                    }
                    other => serde_json::from_value::<UnreadCountPayload>(other)
                        .map_err(invalid)?
                        .unread_count,
                };
                Ok(Self::UnreadCount(
                    u32::try_from(count.max(0)).unwrap_or(u32::MAX),
                ))
            }
            other => Err(EventDecodeError::Unrecognized(other.to_string())),
        }
    }
}

/// Best-effort outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Current device position.
    LocationUpdate {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
    /// Notification preference object.
    Preferences(NotificationPreferences),
}

impl OutboundMessage {
    /// Server action name.
    pub fn action(&self) -> &'static str {
        match self {
            Self::LocationUpdate { .. } => "update-location",
            Self::Preferences(_) => "update-notification-preferences",
        }
    }

    /// Action body including the `action` key.
    pub fn to_data(&self) -> serde_json::Value {
        match self {
            Self::LocationUpdate {
                latitude,
                longitude,
            } => serde_json::json!({
                "action": self.action(),
                "latitude": latitude,
                "longitude": longitude,
            }),
            Self::Preferences(preferences) => serde_json::json!({
                "action": self.action(),
                "preferences": preferences,
            }),
        }
    }
}

type DeliverFn = dyn Fn(SessionId, ChannelEvent) -> bool + Send + Sync;

/// Where a transport delivers events for one session.
#[derive(Clone)]
pub struct ChannelSink {
    session: SessionId,
    deliver: Arc<DeliverFn>,
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSink")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ChannelSink {
    /// Sink that hands every event to `deliver`.
    pub fn new(
        session: SessionId,
        deliver: impl Fn(SessionId, ChannelEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            session,
            deliver: Arc::new(deliver),
        }
    }

    /// Session this sink belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Deliver an event. Returns `false` once the receiver is gone.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        (self.deliver)(self.session, event)
    }
}

/// Handle to an open link. Dropping it closes the link.
#[derive(Debug)]
pub struct ChannelLink {
    session: SessionId,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ChannelLink {
    /// Wrap the transport's outbound queue and shutdown signal.
    pub fn new(
        session: SessionId,
        outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
        shutdown_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            session,
            outbound_tx,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Session this link belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queue a message for the transport. Returns `false` if the link is gone.
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.outbound_tx.send(message).is_ok()
    }

    /// Signal the transport to close. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens persistent notification links.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a link authenticated with `credential`.
    ///
    /// Resolves once the link is ready to receive events. Events for the
    /// link must be delivered through `sink` only.
    async fn open(
        &self,
        credential: Credential,
        sink: ChannelSink,
    ) -> Result<ChannelLink, ChannelError>;

    /// Endpoint description for diagnostics.
    fn endpoint(&self) -> String;
}
