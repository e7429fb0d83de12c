//! Best-effort local snapshot cache, consulted only when a history fetch
//! fails.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use session_core::Message;

/// Keyed snapshots of the last known timeline per room.
///
/// `save` is fire-and-forget and `load` never fails; an unknown room yields
/// an empty timeline.
#[derive(Clone, Default)]
pub struct LocalCache {
    entries: Arc<RwLock<HashMap<String, Vec<Message>>>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached snapshot for a room. Failures are swallowed.
    pub fn save(&self, room_id: &str, messages: &[Message]) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        entries.insert(cache_key(room_id), messages.to_vec());
    }

    /// Last saved snapshot, or an empty sequence when none exists.
    pub fn load(&self, room_id: &str) -> Vec<Message> {
        let Ok(entries) = self.entries.read() else {
            return Vec::new();
        };
        entries.get(&cache_key(room_id)).cloned().unwrap_or_default()
    }
}

fn cache_key(room_id: &str) -> String {
    format!("messages:{room_id}")
}
