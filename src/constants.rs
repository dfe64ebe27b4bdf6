//! Application-wide constants for roadsign-notify.
//!
//! Centralizes timing and protocol constants so the sync layer, the
//! transports and the tests agree on the same values.
//!
//! # Categories
//!
//! - **Timing**: reconciliation cadence, connect and request timeouts
//! - **Channel**: ActionCable names and health checks
//! - **Server**: REST defaults

use std::time::Duration;

// ============================================================================
// Timing
// ============================================================================

/// Interval between credential checks.
///
/// Every tick also reconciles the connection, so this doubles as the
/// reconnect delay after a failed attempt.
pub const TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on a single connection attempt (handshake + subscription).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client request timeout for REST calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Channel
// ============================================================================

/// ActionCable channel carrying notification events.
pub const NOTIFICATIONS_CHANNEL: &str = "NotificationsChannel";

/// Path of the ActionCable endpoint relative to the server origin.
pub const CABLE_PATH: &str = "/cable";

/// A link with no inbound frame for this long is considered dead.
///
/// ActionCable pings every 3 seconds, so this tolerates several lost pings.
pub const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(15);

/// How often the message loop checks link staleness.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Server
// ============================================================================

/// Default REST base URL.
pub const DEFAULT_SERVER_URL: &str = "https://api.roadsign-report.app";

/// Page size used by authoritative refreshes.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
