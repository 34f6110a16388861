//! Read/Delivery Tracker: applies receipt transitions and tells the
//! original sender about the ones that actually happened.
//!
//! Monotonicity is enforced by the store (a receipt update is conditional
//! on the current status being lower), so a late or duplicated
//! acknowledgement is left out of the returned transitions and produces
//! no event.

use std::sync::Arc;

use parley_shared::protocol::ServerEvent;
use parley_shared::types::{MessageId, MessageStatus, UserId};
use parley_shared::ChatError;
use parley_store::{StatusTransition, StoreHandle};

use crate::presence::PresenceRegistry;

pub struct StatusTracker {
    store: StoreHandle,
    presence: Arc<PresenceRegistry>,
}

impl StatusTracker {
    pub fn new(store: StoreHandle, presence: Arc<PresenceRegistry>) -> Self {
        Self { store, presence }
    }

    /// Advance `recipients`' receipts for one message, returning the ones
    /// that moved. Nothing is sent; the caller decides when the sender
    /// hears about them.
    pub async fn record(
        &self,
        message_id: MessageId,
        recipients: Vec<UserId>,
        status: MessageStatus,
    ) -> Result<Vec<StatusTransition>, ChatError> {
        let transitions = self
            .store
            .run(move |db| {
                let mut moved = Vec::new();
                for recipient in recipients {
                    if let Some(t) = db.update_status(message_id, recipient, status)? {
                        moved.push(t);
                    }
                }
                Ok::<_, parley_store::StoreError>(moved)
            })
            .await?;
        Ok(transitions)
    }

    /// Tell the sender about a transition. Returns whether the sender was
    /// reachable.
    pub fn notify(&self, transition: &StatusTransition) -> bool {
        let pushed = self
            .presence
            .push(transition.sender_id, status_event(transition));
        tracing::debug!(
            message = %transition.message_id,
            recipient = %transition.recipient_id,
            status = ?transition.status,
            sender_reachable = pushed,
            "receipt advanced"
        );
        pushed
    }

    pub fn notify_all(&self, transitions: &[StatusTransition]) {
        for t in transitions {
            self.notify(t);
        }
    }
}

pub fn status_event(t: &StatusTransition) -> ServerEvent {
    match t.status {
        MessageStatus::Read => ServerEvent::MessageRead {
            message_id: t.message_id,
            conversation_id: t.conversation_id.clone(),
            recipient_id: t.recipient_id,
            status: t.status,
        },
        MessageStatus::Delivered | MessageStatus::Sent => ServerEvent::MessageDelivered {
            message_id: t.message_id,
            conversation_id: t.conversation_id.clone(),
            recipient_id: t.recipient_id,
            status: t.status,
        },
    }
}
