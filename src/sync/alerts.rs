//! Immediate local alerts for pushed notifications.
//!
//! Alerts are only raised on a physical device while the app is in the
//! foreground. The bridge reads notifications; it never mutates the store.

use std::sync::Arc;

use crate::notification::Notification;

/// Platform alert payload.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAlert {
    /// Alert title.
    pub title: String,
    /// Alert body.
    pub body: String,
    /// Opaque data forwarded to the tap handler.
    pub data: serde_json::Value,
}

impl From<&Notification> for LocalAlert {
    fn from(n: &Notification) -> Self {
        Self {
            title: n.title.clone(),
            body: n.description.clone(),
            data: n.data.clone(),
        }
    }
}

/// Alert scheduling failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    /// User revoked alert permission.
    PermissionDenied,
    /// Platform scheduler refused the alert.
    Platform(String),
}

impl std::fmt::Display for AlertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "Alert permission denied"),
            Self::Platform(msg) => write!(f, "Alert scheduling failed: {msg}"),
        }
    }
}

impl std::error::Error for AlertError {}

/// Device capability query.
pub trait DeviceInfo: Send + Sync {
    /// `false` on simulators/emulators, which cannot show local alerts.
    fn is_physical_device(&self) -> bool;
}

/// Platform local-alert scheduler.
pub trait AlertScheduler: Send + Sync {
    /// Show `alert` immediately.
    fn schedule_now(&self, alert: LocalAlert) -> Result<(), AlertError>;
}

/// Desktop/headless host: always a physical device.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDevice;

impl DeviceInfo for HostDevice {
    fn is_physical_device(&self) -> bool {
        true
    }
}

/// Scheduler that writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertScheduler;

impl AlertScheduler for LogAlertScheduler {
    fn schedule_now(&self, alert: LocalAlert) -> Result<(), AlertError> {
        log::info!("[Alerts] {}: {}", alert.title, alert.body);
        Ok(())
    }
}

/// Turns pushes into local alerts.
pub struct LocalAlertBridge {
    device: Arc<dyn DeviceInfo>,
    scheduler: Arc<dyn AlertScheduler>,
    foreground: bool,
}

impl std::fmt::Debug for LocalAlertBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAlertBridge")
            .field("foreground", &self.foreground)
            .finish_non_exhaustive()
    }
}

impl LocalAlertBridge {
    /// Bridge starting in the foreground.
    pub fn new(device: Arc<dyn DeviceInfo>, scheduler: Arc<dyn AlertScheduler>) -> Self {
        Self {
            device,
            scheduler,
            foreground: true,
        }
    }

    /// Record app presence.
    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    /// Whether the app is currently foregrounded.
    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    /// Schedule an alert for a newly inserted push.
    ///
    /// Returns `true` if an alert was scheduled.
    pub fn on_push(&self, notification: &Notification) -> bool {
        if !self.foreground {
            log::debug!("[Alerts] App in background, skipping alert {}", notification.id);
            return false;
        }
        if !self.device.is_physical_device() {
            log::debug!("[Alerts] Not a physical device, skipping alert {}", notification.id);
            return false;
        }
        match self.scheduler.schedule_now(LocalAlert::from(notification)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Alerts] Failed to schedule alert {}: {e}", notification.id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Device(bool);

    impl DeviceInfo for Device {
        fn is_physical_device(&self) -> bool {
            self.0
        }
    }

    #[derive(Default)]
    struct Recorder {
        alerts: Mutex<Vec<LocalAlert>>,
        fail: bool,
    }

    impl AlertScheduler for Recorder {
        fn schedule_now(&self, alert: LocalAlert) -> Result<(), AlertError> {
            if self.fail {
                return Err(AlertError::PermissionDenied);
            }
            self.alerts.lock().unwrap().push(alert);
            Ok(())
        }
    }

    fn note() -> Notification {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "title": "Detour",
            "description": "Bridge closed",
            "data": {"sign_id": 4},
            "created_at": "2026-03-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn test_alert_on_physical_foreground_device() {
        let recorder = Arc::new(Recorder::default());
        let bridge = LocalAlertBridge::new(Arc::new(Device(true)), recorder.clone());
        assert!(bridge.on_push(&note()));

        let alerts = recorder.alerts.lock().unwrap();
        assert_eq!(
            alerts[0],
            LocalAlert {
                title: "Detour".into(),
                body: "Bridge closed".into(),
                data: serde_json::json!({"sign_id": 4}),
            }
        );
    }

    #[test]
    fn test_no_alert_on_simulator() {
        let recorder = Arc::new(Recorder::default());
        let bridge = LocalAlertBridge::new(Arc::new(Device(false)), recorder.clone());
        assert!(!bridge.on_push(&note()));
        assert!(recorder.alerts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_alert_in_background() {
        let recorder = Arc::new(Recorder::default());
        let mut bridge = LocalAlertBridge::new(Arc::new(Device(true)), recorder.clone());
        bridge.set_foreground(false);
        assert!(!bridge.on_push(&note()));

        bridge.set_foreground(true);
        assert!(bridge.on_push(&note()));
        assert_eq!(recorder.alerts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_scheduler_failure_is_swallowed() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let bridge = LocalAlertBridge::new(Arc::new(Device(true)), recorder);
        assert!(!bridge.on_push(&note()));
    }
}
