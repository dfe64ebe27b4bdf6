//! Presentation helpers over `created_at`: relative time and calendar-day
//! grouping for notification lists.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};

use crate::notification::Notification;

/// Notifications sharing one calendar day, in collection order.
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup<'a> {
    /// Calendar day in the grouping offset.
    pub day: NaiveDate,
    /// Entries created on that day.
    pub items: Vec<&'a Notification>,
}

/// Short relative age such as `"5m ago"`.
///
/// Anything a week or older renders as the calendar date. Timestamps in the
/// future (clock skew) render as `"just now"`.
pub fn relative_time(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(created_at);
    let minutes = age.num_minutes();
    if minutes < 1 {
        return "just now".to_string();
    }
    if minutes < 60 {
        return format!("{minutes}m ago");
    }
    let hours = age.num_hours();
    if hours < 24 {
        return format!("{hours}h ago");
    }
    let days = age.num_days();
    if days < 7 {
        return format!("{days}d ago");
    }
    created_at.format("%Y-%m-%d").to_string()
}

/// Group an ordered collection by calendar day in `offset`.
///
/// Consecutive entries on the same day share a group, so a newest-first
/// collection yields newest-first groups.
pub fn group_by_day(items: &[Notification], offset: FixedOffset) -> Vec<DayGroup<'_>> {
    let mut groups: Vec<DayGroup<'_>> = Vec::new();
    for item in items {
        let day = item.created_at.with_timezone(&offset).date_naive();
        match groups.last_mut() {
            Some(group) if group.day == day => group.items.push(item),
            _ => groups.push(DayGroup {
                day,
                items: vec![item],
            }),
        }
    }
    groups
}

/// Section header for a day: `"Today"`, `"Yesterday"` or e.g. `"Mon, Jan 5"`.
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        return "Today".to_string();
    }
    if today.pred_opt() == Some(day) {
        return "Yesterday".to_string();
    }
    if day.year() == today.year() {
        day.format("%a, %b %-d").to_string()
    } else {
        day.format("%a, %b %-d %Y").to_string()
    }
}
