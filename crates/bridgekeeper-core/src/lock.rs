//! Async lock table keyed by resource id.
//!
//! Members are held per id inside a group; a group acquisition blocks new
//! members and waits for the ones inside to drain. No FIFO order.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Holder {
    token: u64,
    acquired_at: DateTime<Utc>,
    group: Option<String>,
}

#[derive(Debug, Default)]
struct GroupState {
    pending: bool,
    held: Option<Holder>,
}

#[derive(Debug, Default)]
struct Table {
    ids: HashMap<String, Holder>,
    groups: HashMap<String, GroupState>,
}

impl Table {
    fn group_blocked(&self, group: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|g| g.pending || g.held.is_some())
    }

    fn members_of(&self, group: &str) -> usize {
        self.ids
            .values()
            .filter(|h| h.group.as_deref() == Some(group))
            .count()
    }
}

struct Shared {
    table: Mutex<Table>,
    released: Notify,
    next_token: AtomicU64,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn holder(&self, group: Option<&str>) -> Holder {
        Holder {
            token: self.next_token.fetch_add(1, Ordering::Relaxed) + 1,
            acquired_at: Utc::now(),
            group: group.map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Key {
    Id(String),
    Group(String),
}

/// Diagnostics view of one hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub id: String,
    pub group: Option<String>,
    /// True for a whole-group hold, in which case `id` is the group name.
    pub is_group: bool,
    pub owner: u64,
    pub acquired_at: DateTime<Utc>,
}

/// Owned hold on an id or group. Dropping it releases the hold.
pub struct LockGuard {
    shared: Arc<Shared>,
    key: Key,
    token: u64,
}

impl LockGuard {
    pub fn id(&self) -> &str {
        match &self.key {
            Key::Id(id) | Key::Group(id) => id,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut table = self.shared.table();
        match &self.key {
            Key::Id(id) => match table.ids.get(id) {
                Some(h) if h.token == self.token => {
                    table.ids.remove(id);
                }
                Some(h) => warn!(
                    "stale release of {id}: token {} does not own it (held by {})",
                    self.token, h.token
                ),
                None => warn!("stale release of {id}: not held"),
            },
            Key::Group(group) => {
                let owned = table
                    .groups
                    .get(group)
                    .and_then(|g| g.held.as_ref())
                    .is_some_and(|h| h.token == self.token);
                if owned {
                    table.groups.remove(group);
                } else {
                    warn!("stale release of group {group} by token {}", self.token);
                }
            }
        }
        drop(table);
        self.shared.released.notify_waiters();
    }
}

/// Clears a group's pending mark if the acquisition is abandoned half-way.
struct PendingMark<'a> {
    shared: &'a Shared,
    group: &'a str,
    armed: bool,
}

impl Drop for PendingMark<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = self.shared.table();
        if let Some(g) = table.groups.get_mut(self.group) {
            g.pending = false;
            if g.held.is_none() {
                table.groups.remove(self.group);
            }
        }
        drop(table);
        self.shared.released.notify_waiters();
    }
}

/// In-memory table of held resource ids. Not re-entrant.
#[derive(Clone)]
pub struct ResourceLock {
    shared: Arc<Shared>,
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLock {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                released: Notify::new(),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    fn guard(&self, key: Key, token: u64) -> LockGuard {
        LockGuard {
            shared: Arc::clone(&self.shared),
            key,
            token,
        }
    }

    fn try_take(&self, id: &str, group: Option<&str>) -> Option<LockGuard> {
        let mut table = self.shared.table();
        if table.ids.contains_key(id) {
            return None;
        }
        if group.is_some_and(|g| table.group_blocked(g)) {
            return None;
        }
        let holder = self.shared.holder(group);
        let token = holder.token;
        table.ids.insert(id.to_owned(), holder);
        drop(table);
        debug!("lock {id} acquired (token {token})");
        Some(self.guard(Key::Id(id.to_owned()), token))
    }

    async fn wait_take(&self, id: &str, group: Option<&str>) -> LockGuard {
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.shared.released.notified();
            if let Some(guard) = self.try_take(id, group) {
                return guard;
            }
            released.await;
        }
    }

    /// Wait until `id` is free and take it.
    pub async fn acquire(&self, id: &str) -> LockGuard {
        self.wait_take(id, None).await
    }

    /// Take `id` if it is free right now.
    pub fn try_acquire(&self, id: &str) -> Option<LockGuard> {
        self.try_take(id, None)
    }

    /// Wait until `id` is free and its group is not held or pending.
    pub async fn acquire_member(&self, group: &str, id: &str) -> LockGuard {
        self.wait_take(id, Some(group)).await
    }

    pub fn try_acquire_member(&self, group: &str, id: &str) -> Option<LockGuard> {
        self.try_take(id, Some(group))
    }

    /// Exclude every member of `group`, including members that try to enter
    /// while this call waits for the current ones to finish.
    pub async fn acquire_group(&self, group: &str) -> LockGuard {
        loop {
            let released = self.shared.released.notified();
            {
                let mut table = self.shared.table();
                let state = table.groups.entry(group.to_owned()).or_default();
                if !state.pending && state.held.is_none() {
                    state.pending = true;
                    break;
                }
            }
            released.await;
        }

        let mut mark = PendingMark {
            shared: &self.shared,
            group,
            armed: true,
        };
        loop {
            let released = self.shared.released.notified();
            {
                let mut table = self.shared.table();
                if table.members_of(group) == 0 {
                    let holder = self.shared.holder(None);
                    let token = holder.token;
                    let state = table.groups.entry(group.to_owned()).or_default();
                    state.pending = false;
                    state.held = Some(holder);
                    mark.armed = false;
                    drop(table);
                    debug!("group lock {group} acquired (token {token})");
                    return self.guard(Key::Group(group.to_owned()), token);
                }
            }
            released.await;
        }
    }

    /// Whether `group` is held or about to be.
    pub fn is_group_locked(&self, group: &str) -> bool {
        self.shared.table().group_blocked(group)
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.shared.table().ids.contains_key(id)
    }

    /// Run `action` while holding `id`. The hold is released whatever the
    /// action returns.
    pub async fn with_lock<F, T>(&self, id: &str, action: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(id).await;
        action.await
    }

    pub fn snapshot(&self) -> Vec<LockInfo> {
        let table = self.shared.table();
        let mut out: Vec<LockInfo> = table
            .ids
            .iter()
            .map(|(id, h)| LockInfo {
                id: id.clone(),
                group: h.group.clone(),
                is_group: false,
                owner: h.token,
                acquired_at: h.acquired_at,
            })
            .collect();
        out.extend(table.groups.iter().filter_map(|(name, g)| {
            g.held.as_ref().map(|h| LockInfo {
                id: name.clone(),
                group: None,
                is_group: true,
                owner: h.token,
                acquired_at: h.acquired_at,
            })
        }));
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
