//! Conversation Router: the engine behind every client intent.
//!
//! The router owns no state of its own. It is built once at startup from
//! the store handle, the presence registry, the typing coordinator and the
//! status tracker, and shared behind an `Arc` by every connection task.
//!
//! Sending is persist-then-fan-out: all checks and the append happen inside
//! one store closure, so a message that fails validation, access or block
//! checks leaves nothing behind, and nothing is pushed to anyone before the
//! append has committed.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use parley_shared::constants::MAX_HISTORY_LIMIT;
use parley_shared::protocol::{ChatMessage, SendIntent, SendTarget, ServerEvent};
use parley_shared::types::{
    ConnectionId, ConversationId, FileRef, MessageId, MessageKind, MessageStatus, UserId,
};
use parley_shared::ChatError;
use parley_store::{
    Conversation, ConversationSummary, Database, NewMessage, StatusTransition, StoreHandle,
};

use crate::moderation::ModerationHook;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::tracker::StatusTracker;
use crate::typing::TypingCoordinator;

const MAX_CLIENT_REF_LEN: usize = 128;

/// A persisted message plus the receipts its fan-out moved to
/// `delivered`, not yet reported to the sender.
#[derive(Debug)]
pub struct Submitted {
    pub message: ChatMessage,
    pub deliveries: Vec<StatusTransition>,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_message_len: usize,
    pub history_page_limit: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_message_len: parley_shared::constants::MAX_MESSAGE_LEN,
            history_page_limit: parley_shared::constants::DEFAULT_HISTORY_LIMIT,
        }
    }
}

pub struct ConversationRouter {
    store: StoreHandle,
    presence: Arc<PresenceRegistry>,
    typing: Arc<TypingCoordinator>,
    tracker: StatusTracker,
    moderation: Option<Arc<ModerationHook>>,
    settings: RouterSettings,
}

impl ConversationRouter {
    pub fn new(
        store: StoreHandle,
        presence: Arc<PresenceRegistry>,
        typing: Arc<TypingCoordinator>,
        settings: RouterSettings,
    ) -> Self {
        let tracker = StatusTracker::new(store.clone(), Arc::clone(&presence));
        Self {
            store,
            presence,
            typing,
            tracker,
            moderation: None,
            settings,
        }
    }

    pub fn with_moderation(mut self, hook: ModerationHook) -> Self {
        self.moderation = Some(Arc::new(hook));
        self
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Bind `user` to a fresh connection, replacing any stale binding, and
    /// announce it to everyone sharing a conversation with them.
    ///
    /// Returns the peers that are online right now.
    pub async fn mark_online(
        &self,
        user: UserId,
        handle: ConnectionHandle,
    ) -> Result<Vec<UserId>, ChatError> {
        let guard = self.presence.lock(user).await;

        let at = Utc::now();
        let peers = match self
            .store
            .run(move |db| -> Result<_, ChatError> {
                if db.find_user(user)?.is_none() {
                    return Err(ChatError::AccessDenied(format!("unknown user {user}")));
                }
                db.set_online(user, true, at)?;
                Ok(db.conversation_peers(user)?)
            })
            .await
        {
            Ok(peers) => peers,
            Err(e) => {
                drop(guard);
                self.presence.release(user);
                return Err(e);
            }
        };

        let connection = handle.id();
        if let Some(stale) = self.presence.bind(user, handle) {
            tracing::debug!(
                user = %user,
                stale = %stale.id(),
                "replaced stale connection"
            );
        }
        tracing::info!(user = %user, connection = %connection, "user online");

        self.presence.broadcast(
            &peers,
            &ServerEvent::PresenceChanged {
                user_id: user,
                online: true,
                last_seen: None,
            },
        );
        Ok(self.presence.online_among(&peers))
    }

    /// Drop `connection`'s binding, stamp `last_seen`, clear the user's
    /// typing indicators and announce the transition.
    ///
    /// Returns `false` without side effects when the binding already
    /// belongs to a newer connection.
    pub async fn mark_offline(
        &self,
        user: UserId,
        connection: ConnectionId,
    ) -> Result<bool, ChatError> {
        let guard = self.presence.lock(user).await;

        if !self.presence.unbind(user, connection) {
            return Ok(false);
        }
        self.typing.stop_all(user);

        let at = Utc::now();
        let stored = self
            .store
            .run(move |db| {
                db.set_online(user, false, at)?;
                db.conversation_peers(user)
            })
            .await;
        if let Ok(peers) = &stored {
            tracing::info!(user = %user, connection = %connection, "user offline");
            self.presence.broadcast(
                peers,
                &ServerEvent::PresenceChanged {
                    user_id: user,
                    online: false,
                    last_seen: Some(at),
                },
            );
        }
        drop(guard);
        self.presence.release(user);
        stored?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Persist a message, fan it out and report deliveries to the sender.
    ///
    /// The returned message is the acknowledgement: it carries the durable
    /// id, order key and server timestamp. Recipients that are reachable
    /// get `message.sent` and have their receipts moved to `delivered`
    /// before this returns. Unreachable recipients stay at `sent` until
    /// they load history.
    ///
    /// Callers that write their own acknowledgement to the sender's
    /// connection use [`Self::submit`] and [`Self::report_deliveries`]
    /// instead, so the sender sees the ack before any delivery notice.
    pub async fn send_message(&self, intent: SendIntent) -> Result<ChatMessage, ChatError> {
        let submitted = self.submit(intent).await?;
        self.report_deliveries(&submitted.deliveries);
        Ok(submitted.message)
    }

    /// Everything [`Self::send_message`] does except telling the sender
    /// about deliveries.
    pub async fn submit(&self, intent: SendIntent) -> Result<Submitted, ChatError> {
        validate(&intent, &self.settings)?;

        let SendIntent {
            sender_id,
            target,
            content,
            kind,
            file,
            client_ref,
        } = intent;

        let appended = self
            .store
            .run(move |db| -> Result<_, ChatError> {
                if db.find_user(sender_id)?.is_none() {
                    return Err(ChatError::AccessDenied(format!("unknown sender {sender_id}")));
                }
                let conversation_id = resolve_target(db, sender_id, target)?;
                Ok(db.append(&NewMessage {
                    conversation_id,
                    sender_id,
                    content,
                    kind,
                    file,
                    client_ref,
                })?)
            })
            .await?;

        if appended.duplicate {
            tracing::debug!(
                message = %appended.message.id,
                sender = %sender_id,
                "resend matched an earlier message, skipping fan-out"
            );
            return Ok(Submitted {
                message: appended.message,
                deliveries: Vec::new(),
            });
        }

        let message = appended.message;
        tracing::info!(
            message = %message.id,
            conversation = %message.conversation_id,
            sender = %sender_id,
            recipients = appended.recipients.len(),
            "message persisted"
        );

        let deliveries = self.fan_out(&message, &appended.recipients).await;
        if let Some(hook) = &self.moderation {
            hook.spawn_scan(message.clone());
        }
        Ok(Submitted {
            message,
            deliveries,
        })
    }

    /// Send the sender one `message.delivered` per recipient reached.
    pub fn report_deliveries(&self, deliveries: &[StatusTransition]) {
        self.tracker.notify_all(deliveries);
    }

    async fn fan_out(&self, message: &ChatMessage, recipients: &[UserId]) -> Vec<StatusTransition> {
        let pushed = ServerEvent::MessageSent {
            message: message.clone(),
        };
        let mut reached = Vec::new();
        for recipient in recipients {
            if self.presence.push(*recipient, pushed.clone()) {
                reached.push(*recipient);
            } else {
                tracing::debug!(
                    message = %message.id,
                    recipient = %recipient,
                    "recipient unreachable, leaving at sent"
                );
            }
        }

        let updated = ServerEvent::ConversationUpdated {
            conversation_id: message.conversation_id.clone(),
            last_message_id: message.id,
            last_activity: message.created_at,
        };
        self.presence.push(message.sender_id, updated.clone());
        self.presence.broadcast(recipients, &updated);

        if reached.is_empty() {
            return Vec::new();
        }
        match self
            .tracker
            .record(message.id, reached, MessageStatus::Delivered)
            .await
        {
            Ok(transitions) => transitions,
            Err(e) => {
                // The message is durable; history reconciles the receipts.
                tracing::warn!(message = %message.id, error = %e, "failed to record delivery");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // History and receipts
    // ------------------------------------------------------------------

    /// A page of history, oldest first, that also acknowledges what it
    /// shows: every returned message addressed to `user` is marked read and
    /// each sender hears about it. Viewing an already-read page changes
    /// nothing and emits nothing.
    ///
    /// A direct conversation that includes `user` but has no messages yet
    /// yields an empty page; any other unknown or foreign conversation is
    /// `AccessDenied`.
    pub async fn load_history(
        &self,
        conversation: &ConversationId,
        user: UserId,
        limit: Option<u32>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let limit = limit
            .unwrap_or(self.settings.history_page_limit)
            .clamp(1, MAX_HISTORY_LIMIT);
        let id = conversation.clone();

        let (page, transitions) = self
            .store
            .run(move |db| -> Result<_, ChatError> {
                match db.get_conversation(&id)? {
                    Some(c) if c.has_participant(user) => {}
                    None if id.counterpart(user).is_some() => {
                        return Ok((Vec::new(), Vec::new()));
                    }
                    _ => return Err(not_a_participant(&id)),
                }

                let page = db.query_range(&id, before, limit)?;
                let unread: Vec<MessageId> = page
                    .iter()
                    .filter(|m| m.sender_id != user && m.status < MessageStatus::Read)
                    .map(|m| m.id)
                    .collect();
                let transitions = db.mark_read(user, &unread)?;
                let page = if transitions.is_empty() {
                    page
                } else {
                    db.query_range(&id, before, limit)?
                };
                Ok((page, transitions))
            })
            .await?;

        if !transitions.is_empty() {
            tracing::debug!(
                conversation = %conversation,
                reader = %user,
                count = transitions.len(),
                "history marked read"
            );
        }
        self.tracker.notify_all(&transitions);
        Ok(page)
    }

    /// Mark a single message read by `user`. Returns whether the receipt
    /// moved; marking twice, or marking one's own message, is a no-op.
    pub async fn mark_read(&self, message_id: MessageId, user: UserId) -> Result<bool, ChatError> {
        let transition = self
            .store
            .run(move |db| -> Result<_, ChatError> {
                let message = db.get_message(message_id)?;
                if !db.is_participant(&message.conversation_id, user)? {
                    return Err(not_a_participant(&message.conversation_id));
                }
                if message.sender_id == user {
                    return Ok(None);
                }
                Ok(db.update_status(message_id, user, MessageStatus::Read)?)
            })
            .await?;

        match transition {
            Some(t) => {
                self.tracker.notify(&t);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Derived count of messages addressed to `user` that they have not
    /// read.
    pub async fn unread_count(
        &self,
        conversation: &ConversationId,
        user: UserId,
    ) -> Result<u64, ChatError> {
        let id = conversation.clone();
        self.store
            .run(move |db| -> Result<_, ChatError> {
                if !db.is_participant(&id, user)? {
                    return Err(not_a_participant(&id));
                }
                Ok(db.unread_count(&id, user)?)
            })
            .await
    }

    /// Soft-delete a message. Only its sender may do this; online
    /// participants are told with `message.deleted`.
    pub async fn delete_message(&self, message_id: MessageId, user: UserId) -> Result<(), ChatError> {
        let (conversation, participants) = self
            .store
            .run(move |db| -> Result<_, ChatError> {
                let message = db.get_message(message_id)?;
                if message.sender_id != user {
                    return Err(ChatError::AccessDenied(
                        "only the sender can delete a message".into(),
                    ));
                }
                db.soft_delete(message_id)?;
                let participants = db.participants(&message.conversation_id)?;
                Ok((message.conversation_id, participants))
            })
            .await?;

        tracing::info!(message = %message_id, conversation = %conversation, "message deleted");
        self.presence.broadcast(
            &participants,
            &ServerEvent::MessageDeleted {
                message_id,
                conversation_id: conversation,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub async fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, ChatError> {
        Ok(self.store.run(move |db| db.list_conversations(user)).await?)
    }

    /// Get or create the direct conversation between `user` and `peer`.
    pub async fn open_direct(&self, user: UserId, peer: UserId) -> Result<Conversation, ChatError> {
        self.store
            .run(move |db| -> Result<_, ChatError> {
                if db.find_user(user)?.is_none() {
                    return Err(ChatError::AccessDenied(format!("unknown user {user}")));
                }
                let id = open_direct(db, user, peer)?;
                db.get_conversation(&id)?
                    .ok_or_else(|| ChatError::NotFound(format!("conversation {id}")))
            })
            .await
    }

    /// Create a group with `creator` as its admin. Every member must exist.
    pub async fn create_group(
        &self,
        creator: UserId,
        name: String,
        members: Vec<UserId>,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .store
            .run(move |db| -> Result<_, ChatError> {
                if db.find_user(creator)?.is_none() {
                    return Err(ChatError::AccessDenied(format!("unknown user {creator}")));
                }
                for member in &members {
                    if db.find_user(*member)?.is_none() {
                        return Err(ChatError::NotFound(format!("user {member}")));
                    }
                }
                Ok(db.create_group(creator, &name, &members)?)
            })
            .await?;

        tracing::info!(
            conversation = %conversation.id,
            creator = %creator,
            members = conversation.participants.len(),
            "group created"
        );
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    pub async fn start_typing(&self, conversation: &ConversationId, user: UserId) -> Result<(), ChatError> {
        self.ensure_participant(conversation, user).await?;
        self.typing.start(conversation, user);
        Ok(())
    }

    pub async fn stop_typing(&self, conversation: &ConversationId, user: UserId) -> Result<(), ChatError> {
        self.ensure_participant(conversation, user).await?;
        self.typing.stop(conversation, user);
        Ok(())
    }

    async fn ensure_participant(&self, conversation: &ConversationId, user: UserId) -> Result<(), ChatError> {
        // Direct ids name their participants; no lookup needed.
        if conversation.is_direct() {
            return match conversation.counterpart(user) {
                Some(_) => Ok(()),
                None => Err(not_a_participant(conversation)),
            };
        }
        let id = conversation.clone();
        self.store
            .run(move |db| -> Result<_, ChatError> {
                if db.is_participant(&id, user)? {
                    Ok(())
                } else {
                    Err(not_a_participant(&id))
                }
            })
            .await
    }

    // ------------------------------------------------------------------
    // Call signalling
    // ------------------------------------------------------------------

    /// Forward an opaque signalling payload. Returns whether the target was
    /// reachable.
    pub async fn relay_signal(
        &self,
        from: UserId,
        to: UserId,
        payload: serde_json::Value,
    ) -> Result<bool, ChatError> {
        if from == to {
            return Err(ChatError::Validation("cannot signal yourself".into()));
        }
        self.store
            .run(move |db| -> Result<_, ChatError> {
                if db.find_user(to)?.is_none() {
                    return Err(ChatError::NotFound(format!("user {to}")));
                }
                if db.is_blocked_either(from, to)? {
                    return Err(ChatError::RecipientBlocked);
                }
                Ok(())
            })
            .await?;

        let delivered = self
            .presence
            .push(to, ServerEvent::CallSignal { from, payload });
        tracing::debug!(from = %from, to = %to, delivered, "call signal relayed");
        Ok(delivered)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate(intent: &SendIntent, settings: &RouterSettings) -> Result<(), ChatError> {
    if intent.kind == MessageKind::System {
        return Err(ChatError::Validation(
            "system messages cannot be sent by clients".into(),
        ));
    }
    if intent.content.trim().is_empty() && intent.file.is_none() {
        return Err(ChatError::Validation(
            "content must not be empty without an attachment".into(),
        ));
    }
    let len = intent.content.chars().count();
    if len > settings.max_message_len {
        return Err(ChatError::Validation(format!(
            "content is {len} characters, the limit is {}",
            settings.max_message_len
        )));
    }
    if let Some(file) = &intent.file {
        validate_file(file)?;
    }
    if let Some(client_ref) = &intent.client_ref {
        if client_ref.is_empty() || client_ref.len() > MAX_CLIENT_REF_LEN {
            return Err(ChatError::Validation(format!(
                "client_ref must be 1 to {MAX_CLIENT_REF_LEN} bytes"
            )));
        }
    }
    Ok(())
}

fn validate_file(file: &FileRef) -> Result<(), ChatError> {
    if file.url.trim().is_empty() || file.name.trim().is_empty() {
        return Err(ChatError::Validation(
            "attachments need a url and a file name".into(),
        ));
    }
    Ok(())
}

/// Canonicalize the target into a conversation the sender may post to.
fn resolve_target(
    db: &mut Database,
    sender: UserId,
    target: SendTarget,
) -> Result<ConversationId, ChatError> {
    match target {
        SendTarget::User(peer) => open_direct(db, sender, peer),
        SendTarget::Conversation(id) => match id.counterpart(sender) {
            Some(peer) => open_direct(db, sender, peer),
            None if id.is_direct() => Err(not_a_participant(&id)),
            None => {
                if db.is_participant(&id, sender)? {
                    Ok(id)
                } else {
                    Err(not_a_participant(&id))
                }
            }
        },
    }
}

/// Block check, then get-or-create. Runs before anything is persisted.
fn open_direct(db: &mut Database, user: UserId, peer: UserId) -> Result<ConversationId, ChatError> {
    let id = ConversationId::direct(user, peer)?;
    if db.find_user(peer)?.is_none() {
        return Err(ChatError::NotFound(format!("user {peer}")));
    }
    if db.is_blocked_either(user, peer)? {
        return Err(ChatError::RecipientBlocked);
    }
    db.get_or_create_direct(user, peer)?;
    Ok(id)
}

fn not_a_participant(conversation: &ConversationId) -> ChatError {
    ChatError::AccessDenied(format!("not a participant of {conversation}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parley_store::NewUser;
    use tokio::sync::mpsc;

    use crate::typing::run_fanout;

    struct Harness {
        router: ConversationRouter,
        store: StoreHandle,
        presence: Arc<PresenceRegistry>,
    }

    impl Harness {
        fn new() -> Self {
            let store = StoreHandle::open_in_memory().unwrap();
            let presence = Arc::new(PresenceRegistry::new());
            let (typing, changes) = TypingCoordinator::new(Duration::from_millis(300));
            tokio::spawn(run_fanout(changes, store.clone(), Arc::clone(&presence)));
            let router = ConversationRouter::new(
                store.clone(),
                Arc::clone(&presence),
                Arc::new(typing),
                RouterSettings::default(),
            );
            Self {
                router,
                store,
                presence,
            }
        }

        async fn user(&self, name: &str) -> UserId {
            let new = NewUser::new(name, name.to_uppercase());
            self.store
                .run(move |db| db.create_user(&new))
                .await
                .unwrap()
                .id
        }

        async fn connect(&self, user: UserId) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
            let (handle, rx) = ConnectionHandle::channel(64);
            self.router.mark_online(user, handle.clone()).await.unwrap();
            (handle, rx)
        }

        async fn block(&self, blocker: UserId, blocked: UserId) {
            self.store
                .run(move |db| db.block_user(blocker, blocked))
                .await
                .unwrap();
        }
    }

    /// Wait for the first event matching `pred`, skipping unrelated ones.
    async fn expect_event(
        rx: &mut mpsc::Receiver<ServerEvent>,
        pred: impl Fn(&ServerEvent) -> bool,
    ) -> ServerEvent {
        let deadline = Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            loop {
                let event = rx.recv().await.expect("connection closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Let background tasks settle, then take whatever is queued.
    async fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn is_status_event(event: &ServerEvent) -> bool {
        matches!(
            event,
            ServerEvent::MessageDelivered { .. } | ServerEvent::MessageRead { .. }
        )
    }

    #[tokio::test]
    async fn test_direct_id_is_symmetric() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;

        let ab = h.router.open_direct(a, b).await.unwrap();
        let ba = h.router.open_direct(b, a).await.unwrap();
        assert_eq!(ab.id, ba.id);
        assert_eq!(ab.id, ConversationId::direct(b, a).unwrap());
        assert_eq!(ab.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_recipient_is_reconciled_by_history() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let (_ha, mut rx_a) = h.connect(a).await;

        let sent = h
            .router
            .send_message(SendIntent::text(a, SendTarget::User(b), "hello"))
            .await
            .unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.sender_id, a);
        let conversation = sent.conversation_id.clone();

        // Nobody was reachable, so the receipt stays at sent.
        assert!(drain(&mut rx_a).await.iter().all(|e| !is_status_event(e)));
        let receipt = h
            .store
            .run(move |db| db.receipt_status(sent.id, b))
            .await
            .unwrap();
        assert_eq!(receipt, Some(MessageStatus::Sent));

        let (_hb, _rx_b) = h.connect(b).await;
        let page = h
            .router
            .load_history(&conversation, b, None, None)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "hello");
        assert_eq!(page[0].status, MessageStatus::Read);

        let event = expect_event(&mut rx_a, is_status_event).await;
        assert!(matches!(
            event,
            ServerEvent::MessageRead { recipient_id, status: MessageStatus::Read, .. } if recipient_id == b
        ));
    }

    #[tokio::test]
    async fn test_online_recipient_is_delivered_then_read() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let (_ha, mut rx_a) = h.connect(a).await;
        let (_hb, mut rx_b) = h.connect(b).await;

        let sent = h
            .router
            .send_message(SendIntent::text(a, SendTarget::User(b), "hi"))
            .await
            .unwrap();

        let pushed = expect_event(&mut rx_b, |e| matches!(e, ServerEvent::MessageSent { .. })).await;
        assert_eq!(pushed, ServerEvent::MessageSent { message: sent.clone() });

        let delivered = expect_event(&mut rx_a, is_status_event).await;
        assert!(matches!(
            delivered,
            ServerEvent::MessageDelivered { message_id, status: MessageStatus::Delivered, .. } if message_id == sent.id
        ));

        h.router
            .load_history(&sent.conversation_id, b, None, None)
            .await
            .unwrap();
        let read = expect_event(&mut rx_a, is_status_event).await;
        assert!(matches!(read, ServerEvent::MessageRead { message_id, .. } if message_id == sent.id));
    }

    #[tokio::test]
    async fn test_submit_leaves_delivery_notices_to_the_caller() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let (_ha, mut rx_a) = h.connect(a).await;
        let (_hb, _rx_b) = h.connect(b).await;

        let submitted = h
            .router
            .submit(SendIntent::text(a, SendTarget::User(b), "hi"))
            .await
            .unwrap();
        assert_eq!(submitted.deliveries.len(), 1);
        assert_eq!(submitted.deliveries[0].recipient_id, b);

        // The receipt is already durable even though nobody was told.
        let id = submitted.message.id;
        let receipt = h.store.run(move |db| db.receipt_status(id, b)).await.unwrap();
        assert_eq!(receipt, Some(MessageStatus::Delivered));
        assert!(drain(&mut rx_a).await.iter().all(|e| !is_status_event(e)));

        h.router.report_deliveries(&submitted.deliveries);
        let event = expect_event(&mut rx_a, is_status_event).await;
        assert!(matches!(event, ServerEvent::MessageDelivered { message_id, .. } if message_id == id));
    }

    #[tokio::test]
    async fn test_rereading_history_emits_nothing() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let (_ha, mut rx_a) = h.connect(a).await;

        let mut conversation = None;
        for text in ["one", "two"] {
            let m = h
                .router
                .send_message(SendIntent::text(a, SendTarget::User(b), text))
                .await
                .unwrap();
            conversation = Some(m.conversation_id);
        }
        let conversation = conversation.unwrap();

        h.router.load_history(&conversation, b, None, None).await.unwrap();
        let first = drain(&mut rx_a).await;
        assert_eq!(first.iter().filter(|e| is_status_event(e)).count(), 2);

        h.router.load_history(&conversation, b, None, None).await.unwrap();
        assert!(drain(&mut rx_a).await.iter().all(|e| !is_status_event(e)));
        assert!(!h.router.mark_read(first_message(&h, &conversation).await, b).await.unwrap());
    }

    async fn first_message(h: &Harness, conversation: &ConversationId) -> MessageId {
        let id = conversation.clone();
        h.store
            .run(move |db| db.query_range(&id, None, 1))
            .await
            .unwrap()[0]
            .id
    }

    #[tokio::test]
    async fn test_block_prevents_persistence_both_ways() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        h.block(b, a).await;

        let err = h
            .router
            .send_message(SendIntent::text(a, SendTarget::User(b), "let me in"))
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::RecipientBlocked);

        let err = h
            .router
            .send_message(SendIntent::text(b, SendTarget::User(a), "go away"))
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::RecipientBlocked);

        let direct = ConversationId::direct(a, b).unwrap();
        let err = h
            .router
            .send_message(SendIntent::text(a, SendTarget::Conversation(direct.clone()), "again"))
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::RecipientBlocked);

        assert!(h.router.load_history(&direct, a, None, None).await.unwrap().is_empty());
        assert!(h.router.load_history(&direct, b, None, None).await.unwrap().is_empty());
        assert!(h.router.list_conversations(a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outsiders_are_denied() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let c = h.user("c").await;
        let group = h.router.create_group(a, "team".into(), vec![b]).await.unwrap();

        let err = h
            .router
            .send_message(SendIntent::text(c, SendTarget::Conversation(group.id.clone()), "hey"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::AccessDenied(_)));

        let err = h.router.load_history(&group.id, c, None, None).await.unwrap_err();
        assert!(matches!(err, ChatError::AccessDenied(_)));

        // Probing an unknown group looks the same as a foreign one.
        let unknown = ConversationId::new_group();
        let err = h.router.load_history(&unknown, a, None, None).await.unwrap_err();
        assert!(matches!(err, ChatError::AccessDenied(_)));

        let foreign_direct = ConversationId::direct(a, b).unwrap();
        let err = h
            .router
            .send_message(SendIntent::text(c, SendTarget::Conversation(foreign_direct.clone()), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::AccessDenied(_)));
        assert!(matches!(
            h.router.unread_count(&foreign_direct, c).await,
            Err(ChatError::AccessDenied(_))
        ));
        assert!(matches!(
            h.router.start_typing(&foreign_direct, c).await,
            Err(ChatError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_intents_leave_no_trace() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let stranger = UserId::new();

        let mut empty = SendIntent::text(a, SendTarget::User(b), "   ");
        assert!(matches!(
            h.router.send_message(empty.clone()).await,
            Err(ChatError::Validation(_))
        ));

        empty.kind = MessageKind::File;
        empty.file = Some(FileRef {
            url: "/uploads/report.pdf".into(),
            name: "report.pdf".into(),
            size: 1024,
            mime: Some("application/pdf".into()),
        });
        let with_file = h.router.send_message(empty).await.unwrap();
        assert_eq!(with_file.kind, MessageKind::File);

        let long = "x".repeat(RouterSettings::default().max_message_len + 1);
        assert!(matches!(
            h.router.send_message(SendIntent::text(a, SendTarget::User(b), long)).await,
            Err(ChatError::Validation(_))
        ));

        let mut system = SendIntent::text(a, SendTarget::User(b), "spoofed");
        system.kind = MessageKind::System;
        assert!(matches!(
            h.router.send_message(system).await,
            Err(ChatError::Validation(_))
        ));

        assert!(matches!(
            h.router.send_message(SendIntent::text(a, SendTarget::User(a), "me")).await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            h.router.send_message(SendIntent::text(stranger, SendTarget::User(b), "hi")).await,
            Err(ChatError::AccessDenied(_))
        ));
        assert!(matches!(
            h.router.send_message(SendIntent::text(a, SendTarget::User(stranger), "hi")).await,
            Err(ChatError::NotFound(_))
        ));

        let direct = ConversationId::direct(a, b).unwrap();
        assert_eq!(h.router.load_history(&direct, b, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rapid_sends_keep_persistence_order() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;

        let (first, second) = tokio::join!(
            h.router
                .send_message(SendIntent::text(a, SendTarget::User(b), "first")),
            h.router
                .send_message(SendIntent::text(a, SendTarget::User(b), "second")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.seq, second.seq);

        let mut persisted = vec![first, second];
        persisted.sort_by_key(|m| m.seq);

        let direct = ConversationId::direct(a, b).unwrap();
        for viewer in [a, b] {
            let page = h.router.load_history(&direct, viewer, None, None).await.unwrap();
            let order: Vec<MessageId> = page.iter().map(|m| m.id).collect();
            assert_eq!(order, persisted.iter().map(|m| m.id).collect::<Vec<_>>());
            assert!(page[0].created_at < page[1].created_at);
        }
    }

    #[tokio::test]
    async fn test_unread_count_is_derived_from_receipts() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let m = h
                .router
                .send_message(SendIntent::text(a, SendTarget::User(b), format!("m{i}")))
                .await
                .unwrap();
            ids.push(m.id);
        }
        assert!(h.router.mark_read(ids[0], b).await.unwrap());
        assert!(h.router.mark_read(ids[1], b).await.unwrap());
        // The sender never has unread messages of their own.
        assert!(!h.router.mark_read(ids[2], a).await.unwrap());

        let direct = ConversationId::direct(a, b).unwrap();
        assert_eq!(h.router.unread_count(&direct, b).await.unwrap(), 3);
        assert_eq!(h.router.unread_count(&direct, a).await.unwrap(), 0);

        let summaries = h.router.list_conversations(b).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 3);
        assert_eq!(summaries[0].last_message.as_ref().map(|m| m.id), Some(ids[4]));
    }

    #[tokio::test]
    async fn test_resend_with_client_ref_is_idempotent() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let (_hb, mut rx_b) = h.connect(b).await;

        let mut intent = SendIntent::text(a, SendTarget::User(b), "once");
        intent.client_ref = Some("tmp-42".into());

        let first = h.router.send_message(intent.clone()).await.unwrap();
        let again = h.router.send_message(intent).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.client_ref.as_deref(), Some("tmp-42"));

        let pushes = drain(&mut rx_b)
            .await
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageSent { .. }))
            .count();
        assert_eq!(pushes, 1);
    }

    #[tokio::test]
    async fn test_group_fan_out_reaches_online_members() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let c = h.user("c").await;
        let group = h.router.create_group(a, "team".into(), vec![b, c]).await.unwrap();
        let (_ha, mut rx_a) = h.connect(a).await;
        let (_hb, mut rx_b) = h.connect(b).await;

        let sent = h
            .router
            .send_message(SendIntent::text(a, SendTarget::Conversation(group.id.clone()), "hello team"))
            .await
            .unwrap();

        expect_event(&mut rx_b, |e| matches!(e, ServerEvent::MessageSent { .. })).await;
        expect_event(&mut rx_a, |e| {
            matches!(e, ServerEvent::MessageDelivered { recipient_id, .. } if *recipient_id == b)
        })
        .await;

        // c is offline, so the message as a whole is still only sent.
        let id = sent.id;
        let stored = h.store.run(move |db| db.get_message(id)).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_presence_transitions_and_stale_disconnect() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        h.router.open_direct(a, b).await.unwrap();
        let (_hb, mut rx_b) = h.connect(b).await;

        let (old, _old_rx) = h.connect(a).await;
        expect_event(&mut rx_b, |e| {
            matches!(e, ServerEvent::PresenceChanged { user_id, online: true, .. } if *user_id == a)
        })
        .await;

        // Reconnect without a clean disconnect.
        let (new, _new_rx) = ConnectionHandle::channel(8);
        let online_peers = h.router.mark_online(a, new.clone()).await.unwrap();
        assert_eq!(online_peers, vec![b]);

        assert!(!h.router.mark_offline(a, old.id()).await.unwrap());
        assert!(h.presence.is_online(a));

        assert!(h.router.mark_offline(a, new.id()).await.unwrap());
        assert!(!h.presence.is_online(a));
        let event = expect_event(&mut rx_b, |e| {
            matches!(e, ServerEvent::PresenceChanged { online: false, .. })
        })
        .await;
        assert!(matches!(event, ServerEvent::PresenceChanged { last_seen: Some(_), .. }));

        let user = h.store.run(move |db| db.find_user(a)).await.unwrap().unwrap();
        assert!(!user.is_online);
    }

    #[tokio::test]
    async fn test_disconnect_clears_typing() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let direct = h.router.open_direct(a, b).await.unwrap().id;
        let (ha, _rx_a) = h.connect(a).await;
        let (_hb, mut rx_b) = h.connect(b).await;

        h.router.start_typing(&direct, a).await.unwrap();
        expect_event(&mut rx_b, |e| {
            matches!(e, ServerEvent::TypingChanged { is_typing: true, .. })
        })
        .await;

        h.router.mark_offline(a, ha.id()).await.unwrap();
        let stopped = expect_event(&mut rx_b, |e| {
            matches!(e, ServerEvent::TypingChanged { is_typing: false, .. })
        })
        .await;
        assert!(matches!(stopped, ServerEvent::TypingChanged { user_id, .. } if user_id == a));
    }

    #[tokio::test]
    async fn test_typing_expires_without_stop() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let direct = h.router.open_direct(a, b).await.unwrap().id;
        let (_hb, mut rx_b) = h.connect(b).await;

        h.router.start_typing(&direct, a).await.unwrap();
        h.router.start_typing(&direct, a).await.unwrap();
        expect_event(&mut rx_b, |e| {
            matches!(e, ServerEvent::TypingChanged { is_typing: true, .. })
        })
        .await;
        expect_event(&mut rx_b, |e| {
            matches!(e, ServerEvent::TypingChanged { is_typing: false, .. })
        })
        .await;
    }

    #[tokio::test]
    async fn test_only_sender_deletes() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let (_hb, mut rx_b) = h.connect(b).await;

        let sent = h
            .router
            .send_message(SendIntent::text(a, SendTarget::User(b), "oops"))
            .await
            .unwrap();

        assert!(matches!(
            h.router.delete_message(sent.id, b).await,
            Err(ChatError::AccessDenied(_))
        ));
        h.router.delete_message(sent.id, a).await.unwrap();

        expect_event(&mut rx_b, |e| {
            matches!(e, ServerEvent::MessageDeleted { message_id, .. } if *message_id == sent.id)
        })
        .await;
        assert!(h
            .router
            .load_history(&sent.conversation_id, b, None, None)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            h.router.delete_message(sent.id, a).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_signal_relay() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let c = h.user("c").await;

        let payload = serde_json::json!({ "sdp": "offer" });
        assert!(!h.router.relay_signal(a, b, payload.clone()).await.unwrap());

        let (_hb, mut rx_b) = h.connect(b).await;
        assert!(h.router.relay_signal(a, b, payload.clone()).await.unwrap());
        let event = expect_event(&mut rx_b, |e| matches!(e, ServerEvent::CallSignal { .. })).await;
        assert_eq!(event, ServerEvent::CallSignal { from: a, payload: payload.clone() });

        h.block(b, c).await;
        assert_eq!(
            h.router.relay_signal(c, b, payload).await.unwrap_err(),
            ChatError::RecipientBlocked
        );
    }
}
