use thiserror::Error;

use crate::types::{DeliveryStatus, Message};

/// Errors that can occur while reconciling timeline entries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// An operation referenced a local id that is not present in the buffer.
    #[error("timeline entry with local_id '{0}' was not found")]
    MissingEntry(String),
    /// A status change would move an entry backward or out of a retryable
    /// state.
    #[error("timeline entry '{0}' cannot move from {1:?} to {2:?}")]
    InvalidTransition(String, DeliveryStatus, DeliveryStatus),
}

/// Result of merging a remote insert event into the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteMerge {
    /// The event matched a locally originated entry; the entry was updated
    /// in place (identifier swap, status promotion).
    Merged(Message),
    /// The event is peer-originated and was inserted in timestamp order.
    Appended(Message),
    /// The event duplicated an already-confirmed entry and was dropped.
    Ignored,
}

/// In-memory message timeline for one active room.
///
/// The synchronizer owns this buffer exclusively; entries stay ordered by
/// creation timestamp ascending with ties broken by arrival order.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current entries in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replace the whole timeline, re-sorting by creation timestamp.
    ///
    /// The sort is stable so equal timestamps keep their incoming order.
    pub fn replace(&mut self, mut messages: Vec<Message>) {
        messages.sort_by_key(|message| message.created_at_ms);
        self.messages = messages;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Append an optimistic local entry at the timeline end.
    pub fn append_local(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Look up a failed entry for manual retry.
    pub fn failed_entry(&self, local_id: &str) -> Option<&Message> {
        self.find_local(local_id)
            .filter(|message| message.status == DeliveryStatus::Failed)
    }

    /// Merge the store-confirmed identity into the in-flight entry.
    ///
    /// The entry keeps its position and `local_id`; only the server id,
    /// timestamp, and status change.
    pub fn resolve_send(
        &mut self,
        local_id: &str,
        server_id: &str,
        created_at_ms: u64,
        status: DeliveryStatus,
    ) -> Result<Message, TimelineMergeError> {
        let entry = self
            .find_local_mut(local_id)
            .ok_or_else(|| TimelineMergeError::MissingEntry(local_id.to_owned()))?;
        entry.server_id = Some(server_id.to_owned());
        entry.created_at_ms = created_at_ms;
        if status.rank() > entry.status.rank() && status != DeliveryStatus::Failed {
            entry.status = status;
        }
        Ok(entry.clone())
    }

    /// Promote an entry's status forward; backward moves are rejected.
    pub fn promote(
        &mut self,
        local_id: &str,
        status: DeliveryStatus,
    ) -> Result<Message, TimelineMergeError> {
        let entry = self
            .find_local_mut(local_id)
            .ok_or_else(|| TimelineMergeError::MissingEntry(local_id.to_owned()))?;
        if entry.status == DeliveryStatus::Failed || status.rank() <= entry.status.rank() {
            return Err(TimelineMergeError::InvalidTransition(
                local_id.to_owned(),
                entry.status,
                status,
            ));
        }
        entry.status = status;
        Ok(entry.clone())
    }

    /// Mark an in-flight entry as failed.
    pub fn mark_failed(&mut self, local_id: &str) -> Result<Message, TimelineMergeError> {
        let entry = self
            .find_local_mut(local_id)
            .ok_or_else(|| TimelineMergeError::MissingEntry(local_id.to_owned()))?;
        if !entry.status.is_in_flight() {
            return Err(TimelineMergeError::InvalidTransition(
                local_id.to_owned(),
                entry.status,
                DeliveryStatus::Failed,
            ));
        }
        entry.status = DeliveryStatus::Failed;
        Ok(entry.clone())
    }

    /// Reset a failed entry to pending so the send can be re-attempted.
    pub fn reset_for_retry(&mut self, local_id: &str) -> Result<Message, TimelineMergeError> {
        let entry = self
            .find_local_mut(local_id)
            .ok_or_else(|| TimelineMergeError::MissingEntry(local_id.to_owned()))?;
        if entry.status != DeliveryStatus::Failed {
            return Err(TimelineMergeError::InvalidTransition(
                local_id.to_owned(),
                entry.status,
                DeliveryStatus::Pending,
            ));
        }
        entry.status = DeliveryStatus::Pending;
        Ok(entry.clone())
    }

    /// Merge a remote insert event into the timeline.
    ///
    /// Self-echoes merge into the originating entry by server id, or by
    /// sender+content when the echo outruns the send acknowledgement. Peer
    /// messages insert in timestamp order, ties keeping arrival order.
    pub fn merge_remote(&mut self, incoming: Message) -> RemoteMerge {
        let Some(server_id) = incoming.server_id.as_deref() else {
            // A remote event without a server id is malformed; drop it.
            return RemoteMerge::Ignored;
        };

        if let Some(entry) = self
            .messages
            .iter_mut()
            .find(|entry| entry.server_id.as_deref() == Some(server_id))
        {
            if entry.status == DeliveryStatus::Confirmed {
                return RemoteMerge::Ignored;
            }
            entry.status = DeliveryStatus::Confirmed;
            return RemoteMerge::Merged(entry.clone());
        }

        if let Some(entry) = self.messages.iter_mut().find(|entry| {
            entry.server_id.is_none()
                && entry.status.is_in_flight()
                && entry.sender == incoming.sender
                && entry.content == incoming.content
        }) {
            entry.server_id = Some(server_id.to_owned());
            entry.created_at_ms = incoming.created_at_ms;
            entry.status = DeliveryStatus::Confirmed;
            return RemoteMerge::Merged(entry.clone());
        }

        let position = self
            .messages
            .iter()
            .position(|entry| entry.created_at_ms > incoming.created_at_ms)
            .unwrap_or(self.messages.len());
        self.messages.insert(position, incoming.clone());
        RemoteMerge::Appended(incoming)
    }

    fn find_local(&self, local_id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|entry| entry.local_id.as_deref() == Some(local_id))
    }

    fn find_local_mut(&mut self, local_id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|entry| entry.local_id.as_deref() == Some(local_id))
    }
}
