//! Notification sync core.
//!
//! One tokio task owns every piece of mutable state and drains a single
//! unbounded channel of [`CoreMsg`]. Each message runs to completion before
//! the next, so pushes, token ticks, REST results and user actions are
//! applied strictly in arrival order. Anything that has to wait (connect,
//! REST) runs in a spawned task and posts its result back as an
//! [`InternalEvent`].
//!
//! # Staleness
//!
//! - Channel traffic and connect results carry a [`SessionId`]; the
//!   [`ConnectionManager`] drops anything from a superseded session.
//! - REST results carry the credential generation they were issued under.
//!   The generation is bumped whenever the credential appears, disappears or
//!   is rejected, and results from an older generation are dropped.

pub mod alerts;
pub(crate) mod connection;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::api::{ApiError, NotificationsApi, RefreshSnapshot};
use crate::channel::{
    ChannelError, ChannelEvent, ChannelLink, ConnectionState, InboundEvent, OutboundMessage,
    SessionId,
};
use crate::notification::{Notification, NotificationId, NotificationPreferences};
use crate::token_watcher::{TokenChange, TokenWatcher};

use alerts::LocalAlertBridge;
use connection::{ChannelOutcome, ConnectOutcome, ConnectionManager};
use store::NotificationStore;

/// State projection published after every core message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSnapshot {
    /// Notifications, newest first.
    pub notifications: Arc<Vec<Notification>>,
    /// Unread counter.
    pub unread_count: u32,
    /// Channel connection state.
    pub connection: ConnectionState,
    /// Whether a credential is currently known.
    pub has_credential: bool,
}

impl SyncSnapshot {
    /// `true` when the channel is connected.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// `true` once a known credential has an attempt outcome.
    ///
    /// Never true for the default snapshot published before the first
    /// credential check.
    pub fn is_settled(&self) -> bool {
        self.has_credential && self.connection != ConnectionState::Connecting
    }
}

/// Diagnostic snapshot returned by `test_connection`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Connection state, rendered.
    pub state: String,
    /// Whether the channel is connected.
    pub is_connected: bool,
    /// Whether a credential is currently known.
    pub has_credential: bool,
    /// Active (or pending) session.
    pub session: Option<u64>,
    /// Connection attempts since start.
    pub connection_attempts: u64,
    /// Unread counter.
    pub unread_count: u32,
    /// Collection size.
    pub notification_count: usize,
    /// Most recent connection failure.
    pub last_error: Option<String>,
    /// Time of the most recent successful connection.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Channel endpoint.
    pub cable_url: String,
    /// App presence as seen by the alert bridge.
    pub foreground: bool,
}

/// User-facing error raised when a user-initiated operation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAlert {
    /// Short headline.
    pub title: String,
    /// Error detail.
    pub message: String,
}

/// Server mutation that was applied optimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mutation {
    MarkRead(NotificationId),
    MarkAllRead,
    Delete(NotificationId),
}

impl Mutation {
    fn failure_title(self) -> &'static str {
        match self {
            Self::MarkRead(_) => "Couldn't mark notification as read",
            Self::MarkAllRead => "Couldn't mark notifications as read",
            Self::Delete(_) => "Couldn't delete notification",
        }
    }
}

impl std::fmt::Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MarkRead(id) => write!(f, "mark-read {id}"),
            Self::MarkAllRead => write!(f, "mark-all-read"),
            Self::Delete(id) => write!(f, "delete {id}"),
        }
    }
}

/// Requests from the public surface.
#[derive(Debug)]
pub(crate) enum SyncAction {
    MarkAsRead(NotificationId),
    MarkAllAsRead,
    Delete(NotificationId),
    Refresh,
    UpdateLocation { latitude: f64, longitude: f64 },
    UpdatePreferences(NotificationPreferences),
    Connect,
    Disconnect,
    SetForeground(bool),
    Diagnostics(oneshot::Sender<Diagnostics>),
    Shutdown,
}

/// Results and ticks produced inside the crate.
#[derive(Debug)]
pub(crate) enum InternalEvent {
    TokenTick,
    ConnectFinished {
        session: SessionId,
        result: Result<ChannelLink, ChannelError>,
    },
    Channel {
        session: SessionId,
        event: ChannelEvent,
    },
    RefreshFinished {
        generation: u64,
        user_initiated: bool,
        result: Result<RefreshSnapshot, ApiError>,
    },
    MutationFinished {
        generation: u64,
        mutation: Mutation,
        result: Result<(), ApiError>,
    },
}

/// Everything the core loop consumes.
#[derive(Debug)]
pub(crate) enum CoreMsg {
    Action(SyncAction),
    Internal(InternalEvent),
}

/// Collaborators and settings handed to the core.
pub(crate) struct CoreParts {
    pub watcher: TokenWatcher,
    pub connection: ConnectionManager,
    pub alerts: LocalAlertBridge,
    pub api: Arc<dyn NotificationsApi>,
    pub page_size: u32,
    pub core_tx: mpsc::UnboundedSender<CoreMsg>,
    pub snapshot_tx: watch::Sender<SyncSnapshot>,
    pub alert_tx: mpsc::UnboundedSender<UserAlert>,
}

/// Single owner of sync state.
pub(crate) struct SyncCore {
    watcher: TokenWatcher,
    connection: ConnectionManager,
    store: NotificationStore,
    alerts: LocalAlertBridge,
    api: Arc<dyn NotificationsApi>,
    page_size: u32,
    generation: u64,
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    alert_tx: mpsc::UnboundedSender<UserAlert>,
}

impl SyncCore {
    pub(crate) fn new(parts: CoreParts) -> Self {
        Self {
            watcher: parts.watcher,
            connection: parts.connection,
            store: NotificationStore::new(),
            alerts: parts.alerts,
            api: parts.api,
            page_size: parts.page_size,
            generation: 0,
            core_tx: parts.core_tx,
            snapshot_tx: parts.snapshot_tx,
            alert_tx: parts.alert_tx,
        }
    }

    /// Drain messages until shutdown.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CoreMsg>) {
        log::info!("[Notifications] Sync core started");
        self.on_token_tick();
        self.publish();

        while let Some(msg) = rx.recv().await {
            match msg {
                CoreMsg::Action(SyncAction::Shutdown) => break,
                CoreMsg::Action(action) => self.handle_action(action),
                CoreMsg::Internal(event) => self.handle_internal(event),
            }
            self.publish();
        }

        self.connection.disconnect();
        self.publish();
        log::info!("[Notifications] Sync core stopped");
    }

    fn handle_action(&mut self, action: SyncAction) {
        match action {
            SyncAction::MarkAsRead(id) => {
                self.store.mark_read(id);
                self.push_mutation(Mutation::MarkRead(id));
            }
            SyncAction::MarkAllAsRead => {
                self.store.mark_all_read();
                self.push_mutation(Mutation::MarkAllRead);
            }
            SyncAction::Delete(id) => {
                self.store.remove(id);
                self.push_mutation(Mutation::Delete(id));
            }
            SyncAction::Refresh => self.refresh(true),
            SyncAction::UpdateLocation {
                latitude,
                longitude,
            } => {
                if !valid_coordinates(latitude, longitude) {
                    log::warn!("[Connection] Ignoring invalid location {latitude},{longitude}");
                    return;
                }
                self.connection.send(OutboundMessage::LocationUpdate {
                    latitude,
                    longitude,
                });
            }
            SyncAction::UpdatePreferences(preferences) => {
                self.connection.send(OutboundMessage::Preferences(preferences));
            }
            SyncAction::Connect => match self.watcher.current().cloned() {
                Some(credential) => self.connection.connect(credential),
                None => log::info!("[Connection] No credential, not connecting"),
            },
            SyncAction::Disconnect => self.connection.disconnect(),
            SyncAction::SetForeground(foreground) => self.alerts.set_foreground(foreground),
            SyncAction::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            SyncAction::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::TokenTick => self.on_token_tick(),
            InternalEvent::ConnectFinished { session, result } => {
                match self.connection.on_connect_finished(session, result) {
                    ConnectOutcome::Connected(early) => {
                        self.refresh(false);
                        for event in early {
                            self.on_channel_event(session, event);
                        }
                    }
                    ConnectOutcome::Rejected(reason) => self.invalidate_credential(&reason),
                    ConnectOutcome::Failed | ConnectOutcome::Stale => {}
                }
            }
            InternalEvent::Channel { session, event } => self.on_channel_event(session, event),
            InternalEvent::RefreshFinished {
                generation,
                user_initiated,
                result,
            } => {
                if generation != self.generation {
                    log::debug!("[Notifications] Discarding refresh from old session");
                    return;
                }
                match result {
                    Ok(snapshot) => self
                        .store
                        .replace_all(snapshot.notifications, snapshot.unread_count),
                    Err(e) if e.is_auth_failure() => self.invalidate_credential(&e.to_string()),
                    Err(e) if user_initiated => {
                        log::warn!("[Notifications] Refresh failed: {e}");
                        self.raise_alert("Couldn't refresh notifications", &e);
                    }
                    Err(e) => log::warn!("[Notifications] Background refresh failed: {e}"),
                }
            }
            InternalEvent::MutationFinished {
                generation,
                mutation,
                result,
            } => {
                if generation != self.generation {
                    return;
                }
                match result {
                    Ok(()) => log::debug!("[Notifications] {mutation} accepted"),
                    Err(e) if e.is_auth_failure() => self.invalidate_credential(&e.to_string()),
                    Err(e) => {
                        // No rollback; the next authoritative refresh reconciles.
                        log::warn!("[Notifications] {mutation} rejected: {e}");
                        self.raise_alert(mutation.failure_title(), &e);
                    }
                }
            }
        }
    }

    fn on_channel_event(&mut self, session: SessionId, event: ChannelEvent) {
        match self.connection.on_channel_event(session, event) {
            ChannelOutcome::Inbound(InboundEvent::NotificationPushed(notification)) => {
                if self.store.apply_push(notification.clone()) {
                    self.alerts.on_push(&notification);
                }
            }
            ChannelOutcome::Inbound(InboundEvent::UnreadCount(count)) => {
                self.store.set_unread_count(count);
            }
            ChannelOutcome::Rejected(reason) => self.invalidate_credential(&reason),
            ChannelOutcome::Lost | ChannelOutcome::Ignored => {}
        }
    }

    fn on_token_tick(&mut self) {
        match self.watcher.check() {
            TokenChange::Appeared(_) => {
                self.generation += 1;
                // A replaced token belongs to a different session.
                self.connection.disconnect();
                self.store.clear();
            }
            TokenChange::Disappeared => {
                self.generation += 1;
                self.connection.disconnect();
                self.connection.forget_rejected();
                self.store.clear();
            }
            TokenChange::Unchanged => {}
        }
        self.connection.reconcile(self.watcher.current());
    }

    fn invalidate_credential(&mut self, reason: &str) {
        log::warn!("[Notifications] Credential rejected: {reason}");
        self.generation += 1;
        if let Some(credential) = self.watcher.current().cloned() {
            self.connection.mark_rejected(credential);
        }
        self.connection.disconnect();
        self.store.clear();
        self.watcher.store().invalidate(reason);
    }

    fn refresh(&mut self, user_initiated: bool) {
        let Some(credential) = self.watcher.current().cloned() else {
            log::info!("[Notifications] No credential, skipping refresh");
            return;
        };
        let api = Arc::clone(&self.api);
        let core_tx = self.core_tx.clone();
        let generation = self.generation;
        let limit = self.page_size;
        tokio::spawn(async move {
            let result = api.refresh(&credential, limit).await;
            let _ = core_tx.send(CoreMsg::Internal(InternalEvent::RefreshFinished {
                generation,
                user_initiated,
                result,
            }));
        });
    }

    fn push_mutation(&mut self, mutation: Mutation) {
        let Some(credential) = self.watcher.current().cloned() else {
            log::info!("[Notifications] No credential, {mutation} applied locally only");
            return;
        };
        let api = Arc::clone(&self.api);
        let core_tx = self.core_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = match mutation {
                Mutation::MarkRead(id) => api.mark_read(&credential, id).await,
                Mutation::MarkAllRead => api.mark_all_read(&credential).await,
                Mutation::Delete(id) => api.delete(&credential, id).await,
            };
            let _ = core_tx.send(CoreMsg::Internal(InternalEvent::MutationFinished {
                generation,
                mutation,
                result,
            }));
        });
    }

    fn raise_alert(&self, title: &str, error: &ApiError) {
        let _ = self.alert_tx.send(UserAlert {
            title: title.to_string(),
            message: error.to_string(),
        });
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            state: self.connection.state().to_string(),
            is_connected: self.connection.is_connected(),
            has_credential: self.watcher.current().is_some(),
            session: self.connection.session().map(|s| s.0),
            connection_attempts: self.connection.attempts(),
            unread_count: self.store.unread_count(),
            notification_count: self.store.len(),
            last_error: self.connection.last_error().map(ToString::to_string),
            last_connected_at: self.connection.last_connected_at(),
            cable_url: self.connection.endpoint(),
            foreground: self.alerts.is_foreground(),
        }
    }

    fn publish(&self) {
        let store = self.store.snapshot();
        let next = SyncSnapshot {
            notifications: store.notifications,
            unread_count: store.unread_count,
            connection: self.connection.state().clone(),
            has_credential: self.watcher.current().is_some(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn valid_coordinates(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}
