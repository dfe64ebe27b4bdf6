//! Roadsign Notify - realtime notification sync for the road-sign reporting
//! client.
//!
//! Keeps a local "notifications + unread count" view consistent across a
//! server-pushed ActionCable channel, authoritative REST refreshes, the
//! login/logout lifecycle of the bearer token, and local alert delivery.
//!
//! # Architecture
//!
//! Everything mutable lives in one sync core task fed by a single channel:
//!
//! - **TokenWatcher** - polls the credential store, reports appear/disappear
//! - **ConnectionManager** - owns the single channel link, reconciles it
//!   against credential presence on every tick
//! - **NotificationStore** - ordered, de-duplicated list plus unread counter
//! - **LocalAlertBridge** - immediate local alerts for pushes
//! - **NotificationClient** - handle for UI code (snapshots + actions)
//!
//! # Modules
//!
//! - [`channel`] - channel abstraction and the ActionCable transport
//! - [`api`] - REST client for the notifications resource
//! - [`sync`] - the core loop, connection manager, store and alert bridge
//! - [`client`] - public handle and builder
//! - [`config`] - configuration loading/saving
//! - [`keyring`] - credential storage

pub mod api;
pub mod channel;
pub mod client;
pub mod config;
pub mod constants;
pub mod display;
pub mod env;
pub mod keyring;
pub mod notification;
pub mod sync;
pub mod token_watcher;

// Re-export commonly used types
pub use api::{ApiError, NotificationsApi, RestNotificationsApi};
pub use channel::{CableConnector, ChannelConnector, ChannelError, ConnectionState};
pub use client::{NotificationClient, NotificationClientBuilder};
pub use config::Config;
pub use keyring::{Credential, CredentialStore};
pub use notification::{Notification, NotificationId, NotificationPreferences, Severity};
pub use sync::{Diagnostics, SyncSnapshot, UserAlert};
