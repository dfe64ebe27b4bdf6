//! Notification collection and unread counter.
//!
//! The list is newest first and unique by id. The counter is normally
//! maintained locally, but any authoritative count (REST refresh or an
//! `unread-count` push) overwrites it.

use std::collections::HashSet;
use std::sync::Arc;

use crate::notification::{Notification, NotificationId};

/// Immutable view handed to the public surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Notifications, newest first.
    pub notifications: Arc<Vec<Notification>>,
    /// Unread counter.
    pub unread_count: u32,
}

/// Owned by the sync core; mutated only from the core loop.
#[derive(Debug, Default)]
pub struct NotificationStore {
    items: Arc<Vec<Notification>>,
    ids: HashSet<NotificationId>,
    unread: u32,
}

impl NotificationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a server list and its unread count.
    ///
    /// Duplicate ids keep their first occurrence.
    pub fn replace_all(&mut self, list: Vec<Notification>, authoritative_unread: u32) {
        let mut ids = HashSet::with_capacity(list.len());
        let items: Vec<Notification> = list.into_iter().filter(|n| ids.insert(n.id)).collect();
        log::debug!(
            "[Notifications] Replaced collection ({} items, unread {authoritative_unread})",
            items.len()
        );
        self.items = Arc::new(items);
        self.ids = ids;
        self.unread = authoritative_unread;
    }

    /// Prepend a pushed notification.
    ///
    /// Returns `false` without touching anything if the id is already known.
    pub fn apply_push(&mut self, notification: Notification) -> bool {
        if !self.ids.insert(notification.id) {
            log::debug!("[Notifications] Ignoring duplicate push {}", notification.id);
            return false;
        }
        if !notification.is_read {
            self.unread = self.unread.saturating_add(1);
        }
        Arc::make_mut(&mut self.items).insert(0, notification);
        true
    }

    /// Authoritative counter overwrite.
    pub fn set_unread_count(&mut self, count: u32) {
        self.unread = count;
    }

    /// Mark one entry read. Returns `true` if it was unread.
    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        if !self.ids.contains(&id) {
            return false;
        }
        let items = Arc::make_mut(&mut self.items);
        match items.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.is_read => {
                n.is_read = true;
                self.unread = self.unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Mark every entry read and zero the counter.
    pub fn mark_all_read(&mut self) {
        if self.items.iter().any(|n| !n.is_read) {
            for n in Arc::make_mut(&mut self.items).iter_mut() {
                n.is_read = true;
            }
        }
        self.unread = 0;
    }

    /// Remove one entry, returning it.
    pub fn remove(&mut self, id: NotificationId) -> Option<Notification> {
        if !self.ids.remove(&id) {
            return None;
        }
        let items = Arc::make_mut(&mut self.items);
        let index = items.iter().position(|n| n.id == id)?;
        let removed = items.remove(index);
        if !removed.is_read {
            self.unread = self.unread.saturating_sub(1);
        }
        Some(removed)
    }

    /// Drop everything (logout).
    pub fn clear(&mut self) {
        self.items = Arc::new(Vec::new());
        self.ids.clear();
        self.unread = 0;
    }

    /// Look up an entry.
    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Current unread counter.
    pub fn unread_count(&self) -> u32 {
        self.unread
    }

    /// Cheap immutable view.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            notifications: Arc::clone(&self.items),
            unread_count: self.unread,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: i64, is_read: bool) -> Notification {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "title": format!("n{id}"),
            "is_read": is_read,
            "created_at": "2026-03-01T00:00:00Z",
        }))
        .unwrap()
    }

    fn ids(store: &NotificationStore) -> Vec<i64> {
        store.snapshot().notifications.iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_distinct_pushes_are_newest_first() {
        let mut store = NotificationStore::new();
        for id in 1..=5 {
            assert!(store.apply_push(note(id, false)));
        }
        assert_eq!(ids(&store), vec![5, 4, 3, 2, 1]);
        assert_eq!(store.unread_count(), 5);
    }

    #[test]
    fn test_duplicate_push_changes_nothing() {
        let mut store = NotificationStore::new();
        store.apply_push(note(1, false));

        let mut changed = note(1, false);
        changed.title = "different".into();
        assert!(!store.apply_push(changed));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1).unwrap().title, "n1");
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_push_onto_refreshed_list() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![note(5, false), note(4, false), note(3, true)], 2);
        store.apply_push(note(6, false));
        assert_eq!(ids(&store), vec![6, 5, 4, 3]);
        assert_eq!(store.unread_count(), 3);
    }

    #[test]
    fn test_replace_all_uses_authoritative_count() {
        let mut store = NotificationStore::new();
        store.apply_push(note(1, false));
        store.replace_all(vec![note(2, false), note(3, false)], 9);
        assert_eq!(ids(&store), vec![2, 3]);
        assert_eq!(store.unread_count(), 9);
    }

    #[test]
    fn test_replace_all_collapses_duplicates() {
        let mut store = NotificationStore::new();
        let mut second = note(1, true);
        second.title = "second".into();
        store.replace_all(vec![note(1, false), note(2, false), second], 2);
        assert_eq!(ids(&store), vec![1, 2]);
        assert_eq!(store.get(1).unwrap().title, "n1");
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![note(1, false), note(2, false)], 2);

        assert!(store.mark_read(1));
        assert_eq!(store.unread_count(), 1);
        assert!(!store.mark_read(1));
        assert_eq!(store.unread_count(), 1);
        assert!(!store.mark_read(42));
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_counter_floors_at_zero() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![note(1, false), note(2, false)], 0);
        assert!(store.mark_read(1));
        assert_eq!(store.unread_count(), 0);
        assert!(store.remove(2).is_some());
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_mark_all_read() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![note(3, false), note(2, false), note(1, false)], 3);
        store.mark_all_read();
        assert!(store.snapshot().notifications.iter().all(|n| n.is_read));
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_remove_decrements_only_for_unread() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![note(2, true), note(1, false)], 1);

        assert_eq!(store.remove(2).map(|n| n.id), Some(2));
        assert_eq!(store.unread_count(), 1);
        assert_eq!(store.remove(1).map(|n| n.id), Some(1));
        assert_eq!(store.unread_count(), 0);
        assert!(store.remove(1).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_removed_id_can_be_pushed_again() {
        let mut store = NotificationStore::new();
        store.apply_push(note(1, false));
        store.remove(1);
        assert!(store.apply_push(note(1, false)));
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_set_unread_count_overwrites() {
        let mut store = NotificationStore::new();
        store.apply_push(note(1, false));
        store.set_unread_count(3);
        assert_eq!(store.unread_count(), 3);
        store.set_unread_count(0);
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutation() {
        let mut store = NotificationStore::new();
        store.apply_push(note(1, false));
        let before = store.snapshot();
        store.mark_read(1);
        store.apply_push(note(2, false));

        assert_eq!(before.notifications.len(), 1);
        assert!(!before.notifications[0].is_read);
        assert_eq!(before.unread_count, 1);
    }

    #[test]
    fn test_clear() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![note(1, false)], 1);
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.unread_count(), 0);
        assert!(store.apply_push(note(1, false)));
    }
}
