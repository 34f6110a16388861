//! Typing Coordinator.
//!
//! Each `(conversation, user)` fact carries a generation number. Every
//! `start` stamps a new generation and arms a timer for it; when the timer
//! fires it only clears the entry if the generation is unchanged, so a
//! refresh or an explicit stop makes older timers harmless. Notifications
//! are emitted on transitions only and consumed by [`run_fanout`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use parley_shared::protocol::ServerEvent;
use parley_shared::types::{ConversationId, UserId};
use parley_store::StoreHandle;

use crate::presence::PresenceRegistry;

type TypingKey = (ConversationId, UserId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingChange {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

pub struct TypingCoordinator {
    entries: Arc<DashMap<TypingKey, u64>>,
    generation: AtomicU64,
    timeout: Duration,
    changes: mpsc::UnboundedSender<TypingChange>,
}

impl TypingCoordinator {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<TypingChange>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            timeout,
            changes,
        };
        (coordinator, rx)
    }

    /// Record that `user` is typing and (re)arm the expiry timer. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, conversation: &ConversationId, user: UserId) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let key = (conversation.clone(), user);
        let previous = self.entries.insert(key.clone(), generation);

        if previous.is_none() {
            emit(&self.changes, &key, true);
        }

        let entries = Arc::clone(&self.entries);
        let changes = self.changes.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if entries.remove_if(&key, |_, g| *g == generation).is_some() {
                tracing::debug!(
                    conversation = %key.0,
                    user = %key.1,
                    "typing indicator expired"
                );
                emit(&changes, &key, false);
            }
        });
    }

    /// Clear the fact now. Returns `false` if `user` was not typing.
    pub fn stop(&self, conversation: &ConversationId, user: UserId) -> bool {
        let key = (conversation.clone(), user);
        if self.entries.remove(&key).is_some() {
            emit(&self.changes, &key, false);
            true
        } else {
            false
        }
    }

    /// Clear every conversation `user` is typing in. Used on disconnect.
    pub fn stop_all(&self, user: UserId) -> Vec<ConversationId> {
        let keys: Vec<TypingKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().1 == user)
            .map(|entry| entry.key().clone())
            .collect();

        keys.into_iter()
            .filter(|key| self.entries.remove(key).is_some())
            .map(|key| {
                emit(&self.changes, &key, false);
                key.0
            })
            .collect()
    }

    pub fn is_typing(&self, conversation: &ConversationId, user: UserId) -> bool {
        self.entries.contains_key(&(conversation.clone(), user))
    }

}

fn emit(changes: &mpsc::UnboundedSender<TypingChange>, key: &TypingKey, is_typing: bool) {
    let change = TypingChange {
        conversation_id: key.0.clone(),
        user_id: key.1,
        is_typing,
    };
    if changes.send(change).is_err() {
        tracing::debug!("typing fan-out worker is gone");
    }
}

/// Deliver typing changes to the other participants of each conversation.
/// Runs until every coordinator handle is dropped.
pub async fn run_fanout(
    mut changes: mpsc::UnboundedReceiver<TypingChange>,
    store: StoreHandle,
    presence: Arc<PresenceRegistry>,
) {
    while let Some(change) = changes.recv().await {
        let audience = match change.conversation_id.direct_pair() {
            Some((a, b)) => vec![a, b],
            None => {
                let id = change.conversation_id.clone();
                match store.run(move |db| db.participants(&id)).await {
                    Ok(participants) => participants,
                    Err(e) => {
                        tracing::warn!(
                            conversation = %change.conversation_id,
                            error = %e,
                            "could not load typing audience"
                        );
                        continue;
                    }
                }
            }
        };

        let others: Vec<UserId> = audience
            .into_iter()
            .filter(|user| *user != change.user_id)
            .collect();
        let event = ServerEvent::TypingChanged {
            conversation_id: change.conversation_id,
            user_id: change.user_id,
            is_typing: change.is_typing,
        };
        presence.broadcast(&others, &event);
    }
    tracing::debug!("typing fan-out stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::ConnectionHandle;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn conversation() -> ConversationId {
        ConversationId::new_group()
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_stop_expires() {
        let (typing, mut rx) = TypingCoordinator::new(TIMEOUT);
        let conv = conversation();
        let user = UserId::new();

        typing.start(&conv, user);
        assert!(rx.recv().await.unwrap().is_typing);
        assert!(typing.is_typing(&conv, user));

        tokio::time::sleep(TIMEOUT + Duration::from_millis(10)).await;
        let change = rx.recv().await.unwrap();
        assert!(!change.is_typing);
        assert_eq!(change.user_id, user);
        assert!(!typing.is_typing(&conv, user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rearms_and_notifies_once() {
        let (typing, mut rx) = TypingCoordinator::new(TIMEOUT);
        let conv = conversation();
        let user = UserId::new();

        typing.start(&conv, user);
        tokio::time::sleep(TIMEOUT / 2).await;
        typing.start(&conv, user);
        tokio::time::sleep(TIMEOUT / 2 + Duration::from_millis(10)).await;

        // The first timer fired but found a newer generation.
        assert!(typing.is_typing(&conv, user));
        assert!(rx.recv().await.unwrap().is_typing);
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(TIMEOUT).await;
        assert!(!rx.recv().await.unwrap().is_typing);
        assert!(!typing.is_typing(&conv, user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_disarms_timer() {
        let (typing, mut rx) = TypingCoordinator::new(TIMEOUT);
        let conv = conversation();
        let user = UserId::new();

        typing.start(&conv, user);
        assert!(typing.stop(&conv, user));
        assert!(!typing.stop(&conv, user));

        assert!(rx.recv().await.unwrap().is_typing);
        assert!(!rx.recv().await.unwrap().is_typing);

        tokio::time::sleep(TIMEOUT * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_clears_every_conversation() {
        let (typing, mut rx) = TypingCoordinator::new(TIMEOUT);
        let (c1, c2) = (conversation(), conversation());
        let user = UserId::new();
        let other = UserId::new();

        typing.start(&c1, user);
        typing.start(&c2, user);
        typing.start(&c1, other);
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let mut cleared = typing.stop_all(user);
        cleared.sort();
        let mut expected = vec![c1.clone(), c2.clone()];
        expected.sort();
        assert_eq!(cleared, expected);
        assert!(typing.is_typing(&c1, other));
        assert!(!typing.is_typing(&c1, user));
        assert!(!typing.is_typing(&c2, user));

        assert!(!rx.recv().await.unwrap().is_typing);
        assert!(!rx.recv().await.unwrap().is_typing);
    }

    #[tokio::test]
    async fn test_fanout_skips_the_typist() {
        let store = StoreHandle::open_in_memory().unwrap();
        let presence = Arc::new(PresenceRegistry::new());
        let (a, b) = (UserId::new(), UserId::new());
        let conv = ConversationId::direct(a, b).unwrap();

        let (ha, mut rx_a) = ConnectionHandle::channel(8);
        let (hb, mut rx_b) = ConnectionHandle::channel(8);
        presence.bind(a, ha);
        presence.bind(b, hb);

        let (typing, changes) = TypingCoordinator::new(TIMEOUT);
        let worker = tokio::spawn(run_fanout(changes, store, Arc::clone(&presence)));

        typing.start(&conv, a);
        let event = rx_b.recv().await.unwrap();
        assert_eq!(
            event,
            ServerEvent::TypingChanged {
                conversation_id: conv.clone(),
                user_id: a,
                is_typing: true,
            }
        );
        assert!(rx_a.try_recv().is_err());

        drop(typing);
        worker.await.unwrap();
    }
}
