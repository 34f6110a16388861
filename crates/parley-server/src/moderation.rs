//! Post-persist keyword scan. Runs on its own task so a slow flag insert
//! never holds up the send path.

use std::sync::Arc;

use parley_shared::moderation::KeywordFilter;
use parley_shared::protocol::ChatMessage;
use parley_shared::types::MessageKind;
use parley_store::{ContentFlag, StoreHandle};

pub struct ModerationHook {
    filter: KeywordFilter,
    store: StoreHandle,
}

impl ModerationHook {
    pub fn new(filter: KeywordFilter, store: StoreHandle) -> Self {
        Self { filter, store }
    }

    pub fn spawn_scan(self: &Arc<Self>, message: ChatMessage) {
        let hook = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = hook.scan(&message).await {
                tracing::warn!(message = %message.id, error = %e, "moderation scan failed");
            }
        });
    }

    /// Flag the message if it contains a listed keyword.
    pub async fn scan(&self, message: &ChatMessage) -> parley_store::Result<Option<ContentFlag>> {
        if message.kind == MessageKind::System {
            return Ok(None);
        }
        let Some(hit) = self.filter.check(&message.content) else {
            return Ok(None);
        };

        let message_id = message.id;
        let conversation_id = message.conversation_id.clone();
        let flag = self
            .store
            .run(move |db| db.insert_flag(message_id, &conversation_id, &hit.keyword, hit.severity))
            .await?;
        Ok(Some(flag))
    }
}
