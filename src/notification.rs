//! Notification data model shared by the REST client, the push channel and
//! the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Server-assigned notification identifier. Unique and never reused.
pub type NotificationId = i64;

/// Hazard severity, ordered from least to most urgent.
///
/// Unknown or missing values fall back to [`Severity::BASELINE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "Option<String>")]
pub enum Severity {
    /// Informational.
    #[default]
    Low,
    /// Worth a look.
    Medium,
    /// Needs attention soon.
    High,
    /// Immediate danger.
    Critical,
}

impl Severity {
    /// Severity assumed for unknown tags.
    pub const BASELINE: Severity = Severity::Low;

    /// Wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl From<Option<String>> for Severity {
    fn from(tag: Option<String>) -> Self {
        match tag.as_deref().map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("low") => Self::Low,
            Some("medium") => Self::Medium,
            Some("high") => Self::High,
            Some("critical") => Self::Critical,
            _ => Self::BASELINE,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A road-sign notification as delivered by REST or the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Server-assigned identity.
    pub id: NotificationId,
    /// Short headline.
    #[serde(default)]
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub description: String,
    /// Open category tag (e.g. `"roadwork"`, `"missing_sign"`).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Free-text location.
    #[serde(default)]
    pub location: String,
    /// Optional latitude.
    #[serde(default, deserialize_with = "lenient_coordinate")]
    pub latitude: Option<f64>,
    /// Optional longitude.
    #[serde(default, deserialize_with = "lenient_coordinate")]
    pub longitude: Option<f64>,
    /// Urgency.
    #[serde(default)]
    pub severity: Severity,
    /// Opaque type-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Read flag.
    #[serde(default)]
    pub is_read: bool,
    /// Creation time, used for day grouping and relative time.
    pub created_at: DateTime<Utc>,
}

/// Accept coordinates as JSON numbers or numeric strings.
///
/// Decimal columns frequently arrive as strings; anything unparseable maps
/// to `None` rather than failing the whole notification.
fn lenient_coordinate<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite()))
}

/// Notification preferences forwarded verbatim to the server.
pub type NotificationPreferences = serde_json::Map<String, serde_json::Value>;
