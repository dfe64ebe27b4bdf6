//! Public handle consumed by UI code.
//!
//! [`NotificationClient`] spawns the sync core plus a token tick task and
//! exposes cheap reads (served from the latest published
//! [`SyncSnapshot`]) and fire-and-forget actions. Reads never wait on the
//! core; actions are applied in the order they were issued.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use roadsign_notify::{keyring, Config, NotificationClient};
//!
//! let config = Config::load()?;
//! let client = NotificationClient::from_config(&config, keyring::default_store()?)?;
//! let mut updates = client.subscribe();
//! while updates.changed().await.is_ok() {
//!     println!("unread: {}", updates.borrow().unread_count);
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::{NotificationsApi, RestNotificationsApi};
use crate::channel::{CableConnector, ChannelConnector};
use crate::config::Config;
use crate::constants;
use crate::keyring::CredentialStore;
use crate::notification::{Notification, NotificationId, NotificationPreferences};
use crate::sync::alerts::{AlertScheduler, DeviceInfo, HostDevice, LocalAlertBridge, LogAlertScheduler};
use crate::sync::connection::ConnectionManager;
use crate::sync::{
    CoreMsg, CoreParts, Diagnostics, InternalEvent, SyncAction, SyncCore, SyncSnapshot, UserAlert,
};
use crate::token_watcher::TokenWatcher;

/// Wires collaborators into a [`NotificationClient`].
pub struct NotificationClientBuilder {
    credentials: Arc<dyn CredentialStore>,
    connector: Option<Arc<dyn ChannelConnector>>,
    api: Option<Arc<dyn NotificationsApi>>,
    device: Arc<dyn DeviceInfo>,
    scheduler: Arc<dyn AlertScheduler>,
    token_poll_interval: Duration,
    connect_timeout: Duration,
    page_size: u32,
}

impl std::fmt::Debug for NotificationClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationClientBuilder")
            .field("has_connector", &self.connector.is_some())
            .field("has_api", &self.api.is_some())
            .field("token_poll_interval", &self.token_poll_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl NotificationClientBuilder {
    /// Builder reading the credential from `credentials`.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            connector: None,
            api: None,
            device: Arc::new(HostDevice),
            scheduler: Arc::new(LogAlertScheduler),
            token_poll_interval: constants::TOKEN_POLL_INTERVAL,
            connect_timeout: constants::CONNECT_TIMEOUT,
            page_size: constants::DEFAULT_PAGE_SIZE,
        }
    }

    /// Channel transport.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// REST client.
    #[must_use]
    pub fn api(mut self, api: Arc<dyn NotificationsApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Device capability collaborator (default: physical host).
    #[must_use]
    pub fn device(mut self, device: Arc<dyn DeviceInfo>) -> Self {
        self.device = device;
        self
    }

    /// Local alert scheduler (default: log).
    #[must_use]
    pub fn alert_scheduler(mut self, scheduler: Arc<dyn AlertScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Credential check / reconcile cadence.
    #[must_use]
    pub fn token_poll_interval(mut self, interval: Duration) -> Self {
        self.token_poll_interval = interval;
        self
    }

    /// Bound on each connection attempt.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Page size for authoritative refreshes.
    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Spawn the sync core. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<NotificationClient> {
        let connector = self.connector.context("No channel connector configured")?;
        let api = self.api.context("No notifications API configured")?;

        let (core_tx, core_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::default());
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();

        let core = SyncCore::new(CoreParts {
            watcher: TokenWatcher::new(self.credentials),
            connection: ConnectionManager::new(connector, core_tx.clone(), self.connect_timeout),
            alerts: LocalAlertBridge::new(self.device, self.scheduler),
            api,
            page_size: self.page_size,
            core_tx: core_tx.clone(),
            snapshot_tx,
            alert_tx,
        });
        let core_task = tokio::spawn(core.run(core_rx));
        let tick_task = spawn_token_ticks(core_tx.clone(), self.token_poll_interval);

        Ok(NotificationClient {
            core_tx,
            snapshot_rx,
            alert_rx: Some(alert_rx),
            core_task: Some(core_task),
            tick_task,
        })
    }
}

/// Post a token tick every `period` until the core goes away.
fn spawn_token_ticks(core_tx: mpsc::UnboundedSender<CoreMsg>, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        // The core checks the token once at startup.
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if core_tx
                .send(CoreMsg::Internal(InternalEvent::TokenTick))
                .is_err()
            {
                break;
            }
        }
    })
}

/// Handle to a running notification sync core.
///
/// Dropping the handle stops the core.
#[derive(Debug)]
pub struct NotificationClient {
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    snapshot_rx: watch::Receiver<SyncSnapshot>,
    alert_rx: Option<mpsc::UnboundedReceiver<UserAlert>>,
    core_task: Option<JoinHandle<()>>,
    tick_task: JoinHandle<()>,
}

impl NotificationClient {
    /// Start building a client around `credentials`.
    pub fn builder(credentials: Arc<dyn CredentialStore>) -> NotificationClientBuilder {
        NotificationClientBuilder::new(credentials)
    }

    /// Client wired to the ActionCable channel and REST API from `config`.
    pub fn from_config(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let api = RestNotificationsApi::new(&config.server_url, config.request_timeout())
            .context("Failed to create HTTP client")?;
        let connector = CableConnector::new(config.effective_cable_url(), config.channel_name.clone());

        Self::builder(credentials)
            .connector(Arc::new(connector))
            .api(Arc::new(api))
            .token_poll_interval(config.token_poll_interval())
            .connect_timeout(config.connect_timeout())
            .page_size(config.page_size)
            .build()
    }

    fn dispatch(&self, action: SyncAction) {
        if self.core_tx.send(CoreMsg::Action(action)).is_err() {
            log::warn!("[Notifications] Sync core has stopped, action dropped");
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Notifications, newest first.
    pub fn notifications(&self) -> Arc<Vec<Notification>> {
        Arc::clone(&self.snapshot_rx.borrow().notifications)
    }

    /// Unread counter.
    pub fn unread_count(&self) -> u32 {
        self.snapshot_rx.borrow().unread_count
    }

    /// Whether the channel is connected.
    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().is_connected()
    }

    /// Receiver notified with a full snapshot on every change.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_rx.clone()
    }

    /// User-facing error alerts. Yields the receiver once.
    pub fn take_alert_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<UserAlert>> {
        self.alert_rx.take()
    }

    /// Mark one notification read (optimistic).
    pub fn mark_as_read(&self, id: NotificationId) {
        self.dispatch(SyncAction::MarkAsRead(id));
    }

    /// Mark every notification read (optimistic).
    pub fn mark_all_as_read(&self) {
        self.dispatch(SyncAction::MarkAllAsRead);
    }

    /// Delete one notification (optimistic).
    pub fn delete_notification(&self, id: NotificationId) {
        self.dispatch(SyncAction::Delete(id));
    }

    /// Fetch the authoritative list and unread count.
    pub fn refresh_notifications(&self) {
        self.dispatch(SyncAction::Refresh);
    }

    /// Report the device position. Dropped when not connected.
    pub fn update_location(&self, latitude: f64, longitude: f64) {
        self.dispatch(SyncAction::UpdateLocation {
            latitude,
            longitude,
        });
    }

    /// Send notification preferences. Dropped when not connected.
    pub fn update_notification_preferences(&self, preferences: NotificationPreferences) {
        self.dispatch(SyncAction::UpdatePreferences(preferences));
    }

    /// Connect now instead of waiting for the next tick.
    pub fn connect(&self) {
        self.dispatch(SyncAction::Connect);
    }

    /// Close the channel. The next tick reconnects while a credential exists.
    pub fn disconnect(&self) {
        self.dispatch(SyncAction::Disconnect);
    }

    /// Forward app foreground/background transitions.
    pub fn set_foreground(&self, foreground: bool) {
        self.dispatch(SyncAction::SetForeground(foreground));
    }

    /// Diagnostic snapshot from the core.
    pub async fn test_connection(&self) -> Result<Diagnostics> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.core_tx
            .send(CoreMsg::Action(SyncAction::Diagnostics(reply_tx)))
            .ok()
            .context("Sync core has stopped")?;
        reply_rx.await.context("Sync core has stopped")
    }

    /// Stop the core and wait for it to close the channel.
    pub async fn shutdown(mut self) {
        let _ = self.core_tx.send(CoreMsg::Action(SyncAction::Shutdown));
        self.tick_task.abort();
        if let Some(task) = self.core_task.take() {
            if let Err(e) = task.await {
                log::warn!("[Notifications] Sync core ended abnormally: {e}");
            }
        }
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        if self.core_task.is_some() {
            let _ = self.core_tx.send(CoreMsg::Action(SyncAction::Shutdown));
        }
        self.tick_task.abort();
    }
}
