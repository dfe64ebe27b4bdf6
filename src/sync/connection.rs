//! Connection lifecycle for the notification channel.
//!
//! The manager is owned by the sync core and reconciled on every token
//! tick. It never awaits: a connection attempt runs in a spawned task that
//! posts [`InternalEvent::ConnectFinished`] back to the core, and the
//! transport delivers channel events as [`InternalEvent::Channel`]. Both are
//! tagged with a [`SessionId`]; results for a session that is no longer
//! pending or active are dropped. Events for the pending session can beat
//! its `ConnectFinished` through the core queue; they are held on the
//! attempt and handed back with the `Connected` outcome.
//!
//! There is no exponential backoff: a failed attempt leaves the state at
//! `Failed` and the next reconcile tick tries again. A rejected credential
//! is remembered and not retried until a different one shows up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{CoreMsg, InternalEvent};
use crate::channel::{
    ChannelConnector, ChannelError, ChannelEvent, ChannelLink, ChannelSink, ConnectionState,
    InboundEvent, OutboundMessage, SessionId,
};
use crate::keyring::Credential;

/// What the core should do after a connect attempt resolves.
#[derive(Debug, PartialEq)]
pub(crate) enum ConnectOutcome {
    /// Link is up; refresh authoritative state, then replay events the
    /// transport delivered before the link was installed.
    Connected(Vec<ChannelEvent>),
    /// Transient failure; retried on a later tick.
    Failed,
    /// Credential rejected during the handshake.
    Rejected(String),
    /// Result belonged to a superseded attempt.
    Stale,
}

/// What the core should do with a channel event.
#[derive(Debug, PartialEq)]
pub(crate) enum ChannelOutcome {
    /// Route to the store.
    Inbound(InboundEvent),
    /// Link dropped; retried on a later tick.
    Lost,
    /// Server revoked the credential.
    Rejected(String),
    /// Stale session, undecodable or unknown event.
    Ignored,
}

struct Attempt {
    session: SessionId,
    credential: Credential,
    early: Vec<ChannelEvent>,
}

struct ActiveLink {
    link: ChannelLink,
    credential: Credential,
}

/// Owns the single persistent connection.
pub(crate) struct ConnectionManager {
    connector: Arc<dyn ChannelConnector>,
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    connect_timeout: Duration,
    state: ConnectionState,
    next_session: u64,
    pending: Option<Attempt>,
    active: Option<ActiveLink>,
    rejected: Option<Credential>,
    last_error: Option<String>,
    last_connected_at: Option<DateTime<Utc>>,
    opened: u64,
}

impl ConnectionManager {
    pub(crate) fn new(
        connector: Arc<dyn ChannelConnector>,
        core_tx: mpsc::UnboundedSender<CoreMsg>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            core_tx,
            connect_timeout,
            state: ConnectionState::Disconnected,
            next_session: 0,
            pending: None,
            active: None,
            rejected: None,
            last_error: None,
            last_connected_at: None,
            opened: 0,
        }
    }

    /// Bring the connection in line with credential presence.
    pub(crate) fn reconcile(&mut self, credential: Option<&Credential>) {
        match credential {
            Some(credential) => {
                if matches!(
                    self.state,
                    ConnectionState::Disconnected | ConnectionState::Failed(_)
                ) {
                    self.connect(credential.clone());
                }
            }
            None => {
                if self.state != ConnectionState::Disconnected {
                    log::info!("[Connection] Credential gone, disconnecting");
                    self.disconnect();
                }
            }
        }
    }

    /// Start one connection attempt.
    ///
    /// No-op while an attempt is in flight, a link is open, or `credential`
    /// was already rejected.
    pub(crate) fn connect(&mut self, credential: Credential) {
        if self.pending.is_some() || self.active.is_some() {
            log::debug!("[Connection] Already {}, not connecting again", self.state);
            return;
        }
        if self.rejected.as_ref() == Some(&credential) {
            log::debug!("[Connection] Credential was rejected, waiting for a new one");
            return;
        }

        self.next_session += 1;
        let session = SessionId(self.next_session);
        self.state = ConnectionState::Connecting;
        self.pending = Some(Attempt {
            session,
            credential: credential.clone(),
            early: Vec::new(),
        });
        self.opened += 1;
        log::info!(
            "[Connection] Opening session {session} to {}",
            self.connector.endpoint()
        );

        let events_tx = self.core_tx.clone();
        let sink = ChannelSink::new(session, move |session, event| {
            events_tx
                .send(CoreMsg::Internal(InternalEvent::Channel { session, event }))
                .is_ok()
        });

        let connector = Arc::clone(&self.connector);
        let core_tx = self.core_tx.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.open(credential, sink)).await
            {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout),
            };
            // Core gone means shutdown; the link (if any) closes on drop.
            let _ = core_tx.send(CoreMsg::Internal(InternalEvent::ConnectFinished {
                session,
                result,
            }));
        });
    }

    /// Apply the result of a connect attempt.
    pub(crate) fn on_connect_finished(
        &mut self,
        session: SessionId,
        result: Result<ChannelLink, ChannelError>,
    ) -> ConnectOutcome {
        let attempt = match self.pending.take() {
            Some(attempt) if attempt.session == session => attempt,
            other => {
                self.pending = other;
                log::debug!("[Connection] Discarding result of stale session {session}");
                // Dropping a stale link closes it.
                return ConnectOutcome::Stale;
            }
        };

        match result {
            Ok(link) => {
                log::info!("[Connection] Connected (session {session})");
                self.state = ConnectionState::Connected;
                self.active = Some(ActiveLink {
                    link,
                    credential: attempt.credential,
                });
                self.last_error = None;
                self.last_connected_at = Some(Utc::now());
                ConnectOutcome::Connected(attempt.early)
            }
            Err(e) if e.is_auth_failure() => {
                log::warn!("[Connection] Session {session} rejected: {e}");
                self.fail(e.to_string());
                self.rejected = Some(attempt.credential);
                ConnectOutcome::Rejected(e.to_string())
            }
            Err(e) => {
                log::warn!("[Connection] Session {session} failed: {e} (retrying on next tick)");
                self.fail(e.to_string());
                ConnectOutcome::Failed
            }
        }
    }

    /// Route a transport event.
    pub(crate) fn on_channel_event(
        &mut self,
        session: SessionId,
        event: ChannelEvent,
    ) -> ChannelOutcome {
        if let Some(attempt) = self.pending.as_mut().filter(|p| p.session == session) {
            log::debug!("[Connection] Holding event for session {session} until connected");
            attempt.early.push(event);
            return ChannelOutcome::Ignored;
        }
        if self.active.as_ref().map(|a| a.link.session()) != Some(session) {
            log::debug!("[Connection] Dropping event from stale session {session}");
            return ChannelOutcome::Ignored;
        }

        match event {
            ChannelEvent::Message { event, payload } => {
                match InboundEvent::decode(&event, payload) {
                    Ok(inbound) => ChannelOutcome::Inbound(inbound),
                    Err(e) => {
                        log::warn!("[Connection] {e}");
                        ChannelOutcome::Ignored
                    }
                }
            }
            ChannelEvent::Closed { reason } => {
                log::warn!("[Connection] Lost session {session}: {reason}");
                self.active = None;
                self.fail(reason);
                ChannelOutcome::Lost
            }
            ChannelEvent::Rejected { reason } => {
                log::warn!("[Connection] Session {session} revoked: {reason}");
                if let Some(active) = self.active.take() {
                    self.rejected = Some(active.credential);
                }
                self.fail(reason.clone());
                ChannelOutcome::Rejected(reason)
            }
        }
    }

    /// Close any connection or attempt. Idempotent.
    pub(crate) fn disconnect(&mut self) {
        if let Some(attempt) = self.pending.take() {
            log::debug!("[Connection] Abandoning attempt {}", attempt.session);
        }
        if let Some(mut active) = self.active.take() {
            log::info!("[Connection] Closing session {}", active.link.session());
            active.link.close();
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Never retry `credential` until a different one appears.
    pub(crate) fn mark_rejected(&mut self, credential: Credential) {
        self.rejected = Some(credential);
    }

    /// Allow a previously rejected credential once it has been cleared
    /// from storage and stored again.
    pub(crate) fn forget_rejected(&mut self) {
        if self.rejected.take().is_some() {
            log::debug!("[Connection] Cleared rejected credential");
        }
    }

    /// Best-effort send; logged no-op when not connected.
    pub(crate) fn send(&self, message: OutboundMessage) -> bool {
        match &self.active {
            Some(active) if self.state.is_connected() => {
                let action = message.action();
                if active.link.send(message) {
                    true
                } else {
                    log::warn!("[Connection] Link closed, dropped '{action}'");
                    false
                }
            }
            _ => {
                log::info!("[Connection] Not connected, dropped '{}'", message.action());
                false
            }
        }
    }

    fn fail(&mut self, reason: String) {
        self.last_error = Some(reason.clone());
        self.state = ConnectionState::Failed(reason);
    }

    pub(crate) fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Active session, else the pending one.
    pub(crate) fn session(&self) -> Option<SessionId> {
        self.active
            .as_ref()
            .map(|a| a.link.session())
            .or_else(|| self.pending.as_ref().map(|p| p.session))
    }

    pub(crate) fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        self.last_connected_at
    }

    pub(crate) fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Attempts started so far.
    pub(crate) fn attempts(&self) -> u64 {
        self.opened
    }
}
