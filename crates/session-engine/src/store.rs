//! Message store adapter: fetch/persist messages against the remote store.

use std::sync::Arc;

use session_core::{DeliveryStatus, EngineError, ErrorKind, Message};
use session_transport::{ChatStore, MessageRow, NewMessageRow};
use tracing::debug;

use crate::clock::now_ms;

/// Thin adapter over the row store. Carries no retry logic of its own: the
/// synchronizer owns the cache fallback for fetches and the manual retry
/// path for sends.
#[derive(Clone)]
pub struct MessageStoreAdapter {
    store: Arc<dyn ChatStore>,
}

impl MessageStoreAdapter {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// All messages for a room, oldest first.
    pub async fn fetch_history(&self, room_id: &str) -> Result<Vec<Message>, EngineError> {
        let rows = self.store.fetch_messages(room_id).await.map_err(|err| {
            EngineError::new(ErrorKind::Fetch, "history_fetch_failed", err.to_string())
        })?;
        Ok(rows.into_iter().map(confirmed_message).collect())
    }

    /// Insert one message and bump the room's last-activity.
    ///
    /// The activity bump is best-effort; a failed touch never fails the
    /// send.
    pub async fn append(
        &self,
        room_id: &str,
        content: &str,
        sender: &str,
    ) -> Result<Message, EngineError> {
        let row = self
            .store
            .insert_message(NewMessageRow {
                room_id: room_id.to_owned(),
                username: sender.to_owned(),
                content: content.to_owned(),
            })
            .await
            .map_err(|err| {
                EngineError::new(ErrorKind::Send, "message_send_failed", err.to_string())
            })?;

        if let Err(err) = self.store.touch_room(room_id, now_ms()).await {
            debug!(%room_id, error = %err, "last-activity bump failed");
        }

        Ok(confirmed_message(row))
    }
}

/// Convert a store row into a confirmed timeline message.
pub fn confirmed_message(row: MessageRow) -> Message {
    Message {
        server_id: Some(row.id),
        local_id: None,
        room_id: row.room_id,
        sender: row.username,
        content: row.content,
        created_at_ms: row.created_at_ms,
        status: DeliveryStatus::Confirmed,
    }
}
