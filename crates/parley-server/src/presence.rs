//! Presence Registry: who is reachable right now, and through which
//! connection.
//!
//! The registry is process-local and starts empty. It knows nothing about
//! storage; the router pairs every bind/unbind with the durable
//! `is_online`/`last_seen` bookkeeping and the `presence.changed` broadcast.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use parley_shared::protocol::ServerEvent;
use parley_shared::types::{ConnectionId, UserId};

/// The sending half of one client connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
        }
    }

    /// A fresh handle plus the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a reply to this connection's own request, waiting for room if
    /// the queue is full. Returns `false` only if the connection is gone.
    pub async fn reply(&self, event: ServerEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(connection = %self.id, "reply to closed connection");
                false
            }
        }
    }

    /// Queue an event without waiting. Returns `false` if the connection is
    /// gone or its queue is full; the caller treats that as unreachable.
    pub fn push(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    connection = %self.id,
                    event = event.name(),
                    "outbound queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection = %self.id, "push to closed connection");
                false
            }
        }
    }
}

#[derive(Debug)]
struct PresenceEntry {
    handle: ConnectionHandle,
    connected_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

/// A snapshot of one binding, for admin views.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PresenceInfo {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    entries: DashMap<UserId, PresenceEntry>,
    /// Serializes connect/disconnect handling per user.
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive right to change `user`'s presence. Other users proceed in
    /// parallel.
    pub async fn lock(&self, user: UserId) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(user).or_default().clone();
        lock.lock_owned().await
    }

    /// Forget `user`'s lock once nobody holds or awaits it and the user has
    /// no binding. Call after dropping the guard from [`Self::lock`].
    pub fn release(&self, user: UserId) {
        self.locks.remove_if(&user, |_, lock| {
            Arc::strong_count(lock) == 1 && !self.entries.contains_key(&user)
        });
    }

    /// Bind `user` to `handle`, replacing (and returning) any stale binding.
    pub fn bind(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let now = Utc::now();
        self.entries
            .insert(
                user,
                PresenceEntry {
                    handle,
                    connected_at: now,
                    last_active: now,
                },
            )
            .map(|old| old.handle)
    }

    /// Remove the binding only if it still belongs to `connection`. A newer
    /// connection that replaced it is left alone.
    pub fn unbind(&self, user: UserId, connection: ConnectionId) -> bool {
        self.entries
            .remove_if(&user, |_, entry| entry.handle.id == connection)
            .is_some()
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.entries.contains_key(&user)
    }

    pub fn route(&self, user: UserId) -> Option<ConnectionHandle> {
        self.entries.get(&user).map(|entry| entry.handle.clone())
    }

    /// Record client activity on the live binding.
    pub fn touch(&self, user: UserId) {
        if let Some(mut entry) = self.entries.get_mut(&user) {
            entry.last_active = Utc::now();
        }
    }

    /// Push to `user` if reachable.
    pub fn push(&self, user: UserId, event: ServerEvent) -> bool {
        match self.route(user) {
            Some(handle) => handle.push(event),
            None => false,
        }
    }

    /// Push the same event to every reachable user in `users`. Returns how
    /// many accepted it.
    pub fn broadcast(&self, users: &[UserId], event: &ServerEvent) -> usize {
        users
            .iter()
            .filter(|user| self.push(**user, event.clone()))
            .count()
    }

    pub fn online_among(&self, users: &[UserId]) -> Vec<UserId> {
        users
            .iter()
            .copied()
            .filter(|user| self.is_online(*user))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PresenceInfo> {
        let mut out: Vec<PresenceInfo> = self
            .entries
            .iter()
            .map(|entry| PresenceInfo {
                user_id: *entry.key(),
                connection_id: entry.handle.id,
                connected_at: entry.connected_at,
                last_active: entry.last_active,
            })
            .collect();
        out.sort_by_key(|info| info.connected_at);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
