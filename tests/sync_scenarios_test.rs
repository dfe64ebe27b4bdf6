//! End-to-end scenarios for the sync core, driven through the public
//! `NotificationClient` with scripted channel and REST collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use roadsign_notify::api::{ApiError, NotificationsApi};
use roadsign_notify::channel::{
    ChannelConnector, ChannelError, ChannelEvent, ChannelLink, ChannelSink, ConnectionState,
    OutboundMessage,
};
use roadsign_notify::keyring::{Credential, CredentialStore, MemoryCredentialStore};
use roadsign_notify::sync::alerts::{AlertError, AlertScheduler, LocalAlert};
use roadsign_notify::{Notification, NotificationClient, NotificationId, SyncSnapshot};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Notify};

// ============================================================================
// Scripted collaborators
// ============================================================================

/// Channel connector that opens instantly and hands the sinks to the test.
#[derive(Default)]
struct ScriptedConnector {
    opens: AtomicUsize,
    fail_with: Mutex<Option<ChannelError>>,
    /// Delivered through the sink before the next `open` returns.
    early: Mutex<Vec<ChannelEvent>>,
    sinks: Mutex<Vec<ChannelSink>>,
    outbound: Mutex<Vec<mpsc::UnboundedReceiver<OutboundMessage>>>,
    shutdowns: Mutex<Vec<oneshot::Receiver<()>>>,
}

impl ScriptedConnector {
    fn last_sink(&self) -> ChannelSink {
        self.sinks.lock().unwrap().last().cloned().expect("no session opened")
    }

    fn push(&self, event: &str, payload: serde_json::Value) {
        self.last_sink().emit(ChannelEvent::Message {
            event: event.to_string(),
            payload,
        });
    }
}

#[async_trait]
impl ChannelConnector for ScriptedConnector {
    async fn open(
        &self,
        _credential: Credential,
        sink: ChannelSink,
    ) -> Result<ChannelLink, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.outbound.lock().unwrap().push(outbound_rx);
        self.shutdowns.lock().unwrap().push(shutdown_rx);
        let early: Vec<ChannelEvent> = self.early.lock().unwrap().drain(..).collect();
        for event in early {
            sink.emit(event);
        }
        let session = sink.session();
        self.sinks.lock().unwrap().push(sink);
        Ok(ChannelLink::new(session, outbound_tx, shutdown_tx))
    }

    fn endpoint(&self) -> String {
        "scripted://cable".into()
    }
}

/// In-memory REST collaborator.
#[derive(Default)]
struct FakeApi {
    list: Mutex<Vec<Notification>>,
    unread: Mutex<u32>,
    fail_mutations: Mutex<Option<ApiError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    fetches: AtomicUsize,
    mutations: Mutex<Vec<String>>,
}

impl FakeApi {
    fn serve(&self, list: Vec<Notification>, unread: u32) {
        *self.list.lock().unwrap() = list;
        *self.unread.lock().unwrap() = unread;
    }

    fn mutation_result(&self, call: String) -> Result<(), ApiError> {
        self.mutations.lock().unwrap().push(call);
        match self.fail_mutations.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NotificationsApi for FakeApi {
    async fn fetch_page(
        &self,
        _credential: &Credential,
        _page: u32,
        _limit: u32,
    ) -> Result<Vec<Notification>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let list = self.list.lock().unwrap().clone();
        Ok(list)
    }

    async fn unread_count(&self, _credential: &Credential) -> Result<u32, ApiError> {
        let unread = *self.unread.lock().unwrap();
        Ok(unread)
    }

    async fn mark_read(&self, _credential: &Credential, id: NotificationId) -> Result<(), ApiError> {
        self.mutation_result(format!("read {id}"))
    }

    async fn mark_all_read(&self, _credential: &Credential) -> Result<(), ApiError> {
        self.mutation_result("read-all".into())
    }

    async fn delete(&self, _credential: &Credential, id: NotificationId) -> Result<(), ApiError> {
        self.mutation_result(format!("delete {id}"))
    }
}

#[derive(Default)]
struct RecordingScheduler {
    alerts: Mutex<Vec<LocalAlert>>,
}

impl AlertScheduler for RecordingScheduler {
    fn schedule_now(&self, alert: LocalAlert) -> Result<(), AlertError> {
        self.alerts.lock().unwrap().push(alert);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    store: MemoryCredentialStore,
    connector: Arc<ScriptedConnector>,
    api: Arc<FakeApi>,
    scheduler: Arc<RecordingScheduler>,
    client: NotificationClient,
    updates: watch::Receiver<SyncSnapshot>,
}

fn harness(store: MemoryCredentialStore) -> Harness {
    let connector = Arc::new(ScriptedConnector::default());
    let api = Arc::new(FakeApi::default());
    let scheduler = Arc::new(RecordingScheduler::default());
    let client = NotificationClient::builder(Arc::new(store.clone()))
        .connector(connector.clone())
        .api(api.clone())
        .alert_scheduler(scheduler.clone())
        .token_poll_interval(Duration::from_millis(50))
        .connect_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let updates = client.subscribe();
    Harness {
        store,
        connector,
        api,
        scheduler,
        client,
        updates,
    }
}

fn note(id: i64, is_read: bool) -> Notification {
    serde_json::from_value(json!({
        "id": id,
        "title": format!("Sign {id}"),
        "description": "Reported",
        "severity": "medium",
        "is_read": is_read,
        "created_at": "2026-03-01T08:00:00Z",
    }))
    .unwrap()
}

async fn wait_for(
    updates: &mut watch::Receiver<SyncSnapshot>,
    what: &str,
    predicate: impl FnMut(&SyncSnapshot) -> bool,
) -> SyncSnapshot {
    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("sync core stopped")
        .clone()
}

fn ids(snapshot: &SyncSnapshot) -> Vec<i64> {
    snapshot.notifications.iter().map(|n| n.id).collect()
}

/// Start with a token, wait for the connection and the first refresh.
///
/// `list` must be non-empty so the refresh is observable.
async fn connected_harness(list: Vec<Notification>, unread: u32) -> Harness {
    let mut h = harness(MemoryCredentialStore::with_token("tok"));
    h.api.serve(list.clone(), unread);
    let expected: Vec<i64> = list.iter().map(|n| n.id).collect();
    wait_for(&mut h.updates, "connected + refreshed", |s| {
        s.is_connected() && ids(s) == expected && s.unread_count == unread
    })
    .await;
    h
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_credential_appears_connects_and_applies_unread_count() {
    let mut h = harness(MemoryCredentialStore::new());
    h.api.serve(Vec::new(), 1);

    assert!(!h.client.is_connected());
    h.store.set(&Credential::new("tok")).unwrap();

    wait_for(&mut h.updates, "refresh after connect", |s| {
        s.is_connected() && s.unread_count == 1
    })
    .await;

    h.connector.push("unread-count", json!({"unread_count": 3}));
    let snapshot = wait_for(&mut h.updates, "unread 3", |s| s.unread_count == 3).await;
    assert!(snapshot.has_credential);
    assert_eq!(h.client.unread_count(), 3);
}

#[tokio::test]
async fn test_push_prepends_to_refreshed_list() {
    let mut h = connected_harness(vec![note(5, false), note(4, false), note(3, false)], 3).await;

    h.connector.push("notification-pushed", serde_json::to_value(note(6, false)).unwrap());
    let snapshot = wait_for(&mut h.updates, "push applied", |s| s.notifications.len() == 4).await;

    assert_eq!(ids(&snapshot), vec![6, 5, 4, 3]);
    assert_eq!(snapshot.unread_count, 4);
    assert_eq!(h.scheduler.alerts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_push_is_ignored_and_not_alerted_twice() {
    let mut h = connected_harness(vec![note(1, false)], 1).await;

    h.connector.push("notification-pushed", serde_json::to_value(note(2, false)).unwrap());
    wait_for(&mut h.updates, "first push", |s| s.notifications.len() == 2).await;

    let mut changed = note(2, false);
    changed.title = "Changed".into();
    h.connector.push("notification-pushed", serde_json::to_value(changed).unwrap());
    h.client.test_connection().await.unwrap();

    let snapshot = h.client.snapshot();
    assert_eq!(ids(&snapshot), vec![2, 1]);
    assert_eq!(snapshot.notifications[0].title, "Sign 2");
    assert_eq!(snapshot.unread_count, 2);
    assert_eq!(h.scheduler.alerts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_event_is_ignored() {
    let h = connected_harness(vec![note(1, false)], 1).await;

    h.connector.push("sign-approved", json!({"id": 1}));
    h.connector.push("notification-pushed", json!({"title": "missing id"}));
    let diagnostics = h.client.test_connection().await.unwrap();

    assert!(diagnostics.is_connected);
    assert_eq!(diagnostics.notification_count, 1);
    assert_eq!(diagnostics.unread_count, 1);
}

#[tokio::test]
async fn test_mark_all_as_read() {
    let mut h = connected_harness(vec![note(3, false), note(2, false), note(1, false)], 3).await;

    h.client.mark_all_as_read();
    let snapshot = wait_for(&mut h.updates, "all read", |s| s.unread_count == 0).await;

    assert!(snapshot.notifications.iter().all(|n| n.is_read));
    h.client.test_connection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*h.api.mutations.lock().unwrap(), vec!["read-all".to_string()]);
}

#[tokio::test]
async fn test_mark_as_read_and_delete_are_optimistic() {
    let mut h = connected_harness(vec![note(2, false), note(1, true)], 1).await;

    h.client.mark_as_read(2);
    wait_for(&mut h.updates, "marked read", |s| s.unread_count == 0).await;

    h.client.delete_notification(1);
    let snapshot = wait_for(&mut h.updates, "deleted", |s| s.notifications.len() == 1).await;
    assert_eq!(ids(&snapshot), vec![2]);
    assert_eq!(snapshot.unread_count, 0);
}

#[tokio::test]
async fn test_rejected_mutation_alerts_without_rollback() {
    let mut h = connected_harness(vec![note(1, false)], 1).await;
    *h.api.fail_mutations.lock().unwrap() = Some(ApiError::Status {
        status: 500,
        message: String::new(),
    });
    let mut alerts = h.client.take_alert_receiver().unwrap();
    assert!(h.client.take_alert_receiver().is_none());

    h.client.mark_as_read(1);
    wait_for(&mut h.updates, "optimistic read", |s| s.unread_count == 0).await;

    let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.title, "Couldn't mark notification as read");
    assert!(alert.message.contains("500"));

    let snapshot = h.client.snapshot();
    assert!(snapshot.notifications[0].is_read);
    assert_eq!(snapshot.unread_count, 0);
}

#[tokio::test]
async fn test_logout_disconnects_and_discards_late_events() {
    let mut h = connected_harness(vec![note(1, false)], 1).await;
    let old_sink = h.connector.last_sink();

    h.store.remove().unwrap();
    let snapshot = wait_for(&mut h.updates, "logged out", |s| !s.has_credential).await;
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert!(snapshot.notifications.is_empty());
    assert_eq!(snapshot.unread_count, 0);

    let shutdown = h.connector.shutdowns.lock().unwrap().pop().unwrap();
    assert!(shutdown.await.is_ok());

    old_sink.emit(ChannelEvent::Message {
        event: "notification-pushed".into(),
        payload: serde_json::to_value(note(9, false)).unwrap(),
    });
    old_sink.emit(ChannelEvent::Message {
        event: "unread-count".into(),
        payload: json!({"unread_count": 4}),
    });
    let diagnostics = h.client.test_connection().await.unwrap();

    assert_eq!(diagnostics.notification_count, 0);
    assert_eq!(diagnostics.unread_count, 0);
    assert!(!diagnostics.has_credential);
    assert!(h.scheduler.alerts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_handshake_invalidates_credential() {
    let mut h = harness(MemoryCredentialStore::new());
    *h.connector.fail_with.lock().unwrap() =
        Some(ChannelError::Unauthorized("handshake returned HTTP 401".into()));

    h.store.set(&Credential::new("expired")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.store.get().unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("credential was never invalidated");
    wait_for(&mut h.updates, "credential dropped", |s| !s.has_credential).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.connector.opens.load(Ordering::SeqCst), 1);

    *h.connector.fail_with.lock().unwrap() = None;
    h.store.set(&Credential::new("fresh")).unwrap();
    wait_for(&mut h.updates, "reconnected", SyncSnapshot::is_connected).await;
    assert_eq!(h.connector.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_same_token_stored_again_after_rejection_reconnects() {
    let mut h = harness(MemoryCredentialStore::new());
    *h.connector.fail_with.lock().unwrap() =
        Some(ChannelError::Unauthorized("handshake returned HTTP 401".into()));

    h.store.set(&Credential::new("tok")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.store.get().unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("credential was never invalidated");
    wait_for(&mut h.updates, "credential dropped", |s| !s.has_credential).await;

    *h.connector.fail_with.lock().unwrap() = None;
    h.store.set(&Credential::new("tok")).unwrap();
    wait_for(&mut h.updates, "reconnected", SyncSnapshot::is_connected).await;
    assert_eq!(h.connector.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_events_during_handshake_are_not_lost() {
    let mut h = harness(MemoryCredentialStore::new());
    // Keep the post-connect refresh in flight so it cannot replace the push.
    *h.api.gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    *h.connector.early.lock().unwrap() = vec![
        ChannelEvent::Message {
            event: "notification-pushed".into(),
            payload: serde_json::to_value(note(42, false)).unwrap(),
        },
        ChannelEvent::Closed {
            reason: "server went away".into(),
        },
    ];

    h.store.set(&Credential::new("tok")).unwrap();
    let snapshot = wait_for(&mut h.updates, "early push applied", |s| ids(s) == vec![42]).await;
    assert_eq!(snapshot.unread_count, 1);

    // The early close must not leave a dead link reporting connected.
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.connector.opens.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed link was never replaced");
    wait_for(&mut h.updates, "reconnected", SyncSnapshot::is_connected).await;
}

#[tokio::test]
async fn test_transient_failure_retries_on_tick() {
    let mut h = harness(MemoryCredentialStore::new());
    *h.connector.fail_with.lock().unwrap() =
        Some(ChannelError::ConnectionFailed("refused".into()));

    h.store.set(&Credential::new("tok")).unwrap();
    wait_for(&mut h.updates, "failed", |s| {
        matches!(s.connection, ConnectionState::Failed(_))
    })
    .await;
    assert_eq!(h.store.get().unwrap(), Some(Credential::new("tok")));

    *h.connector.fail_with.lock().unwrap() = None;
    wait_for(&mut h.updates, "connected", SyncSnapshot::is_connected).await;
    assert!(h.connector.opens.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_late_refresh_after_logout_is_discarded() {
    let store = MemoryCredentialStore::new();
    let mut h = harness(store);
    let gate = Arc::new(Notify::new());
    *h.api.gate.lock().unwrap() = Some(gate.clone());
    h.api.serve(vec![note(1, false)], 1);

    h.store.set(&Credential::new("tok")).unwrap();
    wait_for(&mut h.updates, "connected", SyncSnapshot::is_connected).await;
    while h.api.fetches.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.store.remove().unwrap();
    wait_for(&mut h.updates, "logged out", |s| !s.has_credential).await;

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let diagnostics = h.client.test_connection().await.unwrap();
    assert_eq!(diagnostics.notification_count, 0);
    assert_eq!(diagnostics.unread_count, 0);
}

#[tokio::test]
async fn test_location_update_only_sent_when_connected() {
    let mut h = harness(MemoryCredentialStore::new());

    h.client.update_location(45.0, -122.0);
    h.client.test_connection().await.unwrap();
    assert!(h.connector.outbound.lock().unwrap().is_empty());

    h.store.set(&Credential::new("tok")).unwrap();
    wait_for(&mut h.updates, "connected", SyncSnapshot::is_connected).await;

    h.client.update_location(45.0, -122.0);
    h.client.update_location(500.0, 0.0);
    let mut prefs = serde_json::Map::new();
    prefs.insert("radius_km".into(), json!(10));
    h.client.update_notification_preferences(prefs.clone());
    h.client.test_connection().await.unwrap();

    let mut outbound = h.connector.outbound.lock().unwrap().pop().unwrap();
    assert_eq!(
        outbound.try_recv().unwrap(),
        OutboundMessage::LocationUpdate {
            latitude: 45.0,
            longitude: -122.0
        }
    );
    assert_eq!(outbound.try_recv().unwrap(), OutboundMessage::Preferences(prefs));
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_manual_disconnect_reconnects_on_next_tick() {
    let mut h = connected_harness(vec![note(1, true)], 0).await;

    h.client.disconnect();
    wait_for(&mut h.updates, "disconnected", |s| {
        s.connection == ConnectionState::Disconnected
    })
    .await;
    wait_for(&mut h.updates, "reconnected", SyncSnapshot::is_connected).await;
    assert_eq!(h.connector.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_background_push_skips_local_alert() {
    let mut h = connected_harness(vec![note(100, true)], 0).await;

    h.client.set_foreground(false);
    h.connector.push("notification-pushed", serde_json::to_value(note(1, false)).unwrap());
    wait_for(&mut h.updates, "push", |s| s.notifications.len() == 2).await;
    assert!(h.scheduler.alerts.lock().unwrap().is_empty());

    h.client.set_foreground(true);
    h.connector.push("notification-pushed", serde_json::to_value(note(2, false)).unwrap());
    wait_for(&mut h.updates, "push", |s| s.notifications.len() == 3).await;
    let alerts = h.scheduler.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, "Sign 2");
}

#[tokio::test]
async fn test_diagnostics_snapshot() {
    let h = connected_harness(vec![note(1, false)], 1).await;

    let diagnostics = h.client.test_connection().await.unwrap();
    assert_eq!(diagnostics.state, "connected");
    assert!(diagnostics.is_connected);
    assert!(diagnostics.has_credential);
    assert_eq!(diagnostics.session, Some(1));
    assert_eq!(diagnostics.connection_attempts, 1);
    assert_eq!(diagnostics.notification_count, 1);
    assert_eq!(diagnostics.cable_url, "scripted://cable");
    assert!(diagnostics.last_connected_at.is_some());
    assert!(diagnostics.last_error.is_none());
    assert!(diagnostics.foreground);
}

#[tokio::test]
async fn test_shutdown_closes_link() {
    let h = connected_harness(vec![note(1, true)], 0).await;
    let shutdown = h.connector.shutdowns.lock().unwrap().pop().unwrap();

    h.client.shutdown().await;
    assert!(shutdown.await.is_ok());
}
