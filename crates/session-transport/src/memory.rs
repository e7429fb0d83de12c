//! In-memory implementation of the transport boundary.
//!
//! Backs tests and the smoke binary: rooms and messages live in hash maps,
//! the per-room feed is a `tokio::sync::broadcast` channel, and failure
//! injection toggles simulate transport outages.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use session_core::Room;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    BoxedRoomFeed, ChatStore, FeedEvent, MessageRow, NewMessageRow, NewRoomRow, RealtimeBackend,
    RoomFeed, TransportError,
};

const FEED_BUFFER: usize = 256;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct FeedState {
    tx: broadcast::Sender<FeedEvent>,
    present: u64,
}

impl FeedState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_BUFFER);
        Self { tx, present: 0 }
    }
}

struct Inner {
    rooms: RwLock<HashMap<String, Room>>,
    messages: RwLock<HashMap<String, Vec<MessageRow>>>,
    feeds: Mutex<HashMap<String, FeedState>>,
    fail_fetch: AtomicBool,
    fail_insert: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl Inner {
    fn withdraw_presence(&self, room_id: &str) {
        let Ok(mut feeds) = self.feeds.lock() else {
            return;
        };
        if let Some(state) = feeds.get_mut(room_id) {
            state.present = state.present.saturating_sub(1);
            let _ = state.tx.send(FeedEvent::Presence {
                count: state.present,
            });
        }
    }
}

/// Shared in-memory chat backend; cheap to clone.
#[derive(Clone)]
pub struct InMemoryChatBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryChatBackend {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: RwLock::new(HashMap::new()),
                messages: RwLock::new(HashMap::new()),
                feeds: Mutex::new(HashMap::new()),
                fail_fetch: AtomicBool::new(false),
                fail_insert: AtomicBool::new(false),
                fail_subscribe: AtomicBool::new(false),
            }),
        }
    }
}

impl InMemoryChatBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fetch_messages` fail until switched off again.
    pub fn set_fetch_failure(&self, failing: bool) {
        self.inner.fail_fetch.store(failing, Ordering::SeqCst);
    }

    /// Make `insert_message` fail until switched off again.
    pub fn set_insert_failure(&self, failing: bool) {
        self.inner.fail_insert.store(failing, Ordering::SeqCst);
    }

    /// Make `join` (subscription setup) fail until switched off again.
    pub fn set_subscribe_failure(&self, failing: bool) {
        self.inner.fail_subscribe.store(failing, Ordering::SeqCst);
    }

    fn publish(&self, room_id: &str, event: FeedEvent) {
        let Ok(mut feeds) = self.inner.feeds.lock() else {
            return;
        };
        let state = feeds
            .entry(room_id.to_owned())
            .or_insert_with(FeedState::new);
        let _ = state.tx.send(event);
    }
}

#[async_trait]
impl ChatStore for InMemoryChatBackend {
    async fn insert_room(&self, new: NewRoomRow) -> Result<Room, TransportError> {
        let mut rooms = self
            .inner
            .rooms
            .write()
            .map_err(|_| TransportError::Backend("poisoned lock".to_owned()))?;

        // Uniqueness holds over the unexpired-code set only.
        let collision = rooms
            .values()
            .any(|room| room.code == new.code && room.expires_at_ms > new.created_at_ms);
        if collision {
            return Err(TransportError::Conflict(format!(
                "active room code '{}' already exists",
                new.code
            )));
        }

        let room = Room {
            id: Uuid::new_v4().to_string(),
            kind: new.kind,
            code: new.code,
            created_at_ms: new.created_at_ms,
            expires_at_ms: new.expires_at_ms,
            active_participants: new.active_participants,
            last_activity_ms: new.last_activity_ms,
        };
        rooms.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    async fn find_room_by_code(&self, code: &str, now_ms: u64) -> Result<Room, TransportError> {
        let rooms = self
            .inner
            .rooms
            .read()
            .map_err(|_| TransportError::Backend("poisoned lock".to_owned()))?;
        rooms
            .values()
            .find(|room| room.code == code && room.expires_at_ms > now_ms)
            .cloned()
            .ok_or(TransportError::NotFound)
    }

    async fn join_room(&self, room_id: &str, now_ms: u64) -> Result<Room, TransportError> {
        let mut rooms = self
            .inner
            .rooms
            .write()
            .map_err(|_| TransportError::Backend("poisoned lock".to_owned()))?;
        let room = rooms.get_mut(room_id).ok_or(TransportError::NotFound)?;
        room.active_participants += 1;
        room.last_activity_ms = now_ms;
        Ok(room.clone())
    }

    async fn touch_room(&self, room_id: &str, now_ms: u64) -> Result<(), TransportError> {
        let mut rooms = self
            .inner
            .rooms
            .write()
            .map_err(|_| TransportError::Backend("poisoned lock".to_owned()))?;
        let room = rooms.get_mut(room_id).ok_or(TransportError::NotFound)?;
        room.last_activity_ms = now_ms;
        Ok(())
    }

    async fn insert_message(&self, new: NewMessageRow) -> Result<MessageRow, TransportError> {
        if self.inner.fail_insert.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "simulated insert outage".to_owned(),
            ));
        }

        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            room_id: new.room_id.clone(),
            username: new.username,
            content: new.content,
            created_at_ms: now_ms(),
        };

        {
            let mut messages = self
                .inner
                .messages
                .write()
                .map_err(|_| TransportError::Backend("poisoned lock".to_owned()))?;
            messages
                .entry(new.room_id.clone())
                .or_default()
                .push(row.clone());
        }

        // Change feed: every insert echoes to the room's subscribers.
        self.publish(&new.room_id, FeedEvent::Insert(row.clone()));
        Ok(row)
    }

    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<MessageRow>, TransportError> {
        if self.inner.fail_fetch.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "simulated fetch outage".to_owned(),
            ));
        }

        let messages = self
            .inner
            .messages
            .read()
            .map_err(|_| TransportError::Backend("poisoned lock".to_owned()))?;
        let mut rows = messages.get(room_id).cloned().unwrap_or_default();
        rows.sort_by_key(|row| row.created_at_ms);
        Ok(rows)
    }
}

#[async_trait]
impl RealtimeBackend for InMemoryChatBackend {
    async fn join(&self, room_id: &str) -> Result<BoxedRoomFeed, TransportError> {
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "simulated subscribe outage".to_owned(),
            ));
        }

        let rx = {
            let mut feeds = self
                .inner
                .feeds
                .lock()
                .map_err(|_| TransportError::Backend("poisoned lock".to_owned()))?;
            let state = feeds
                .entry(room_id.to_owned())
                .or_insert_with(FeedState::new);
            // Subscribe before tracking presence so the joiner observes its
            // own presence update.
            let rx = state.tx.subscribe();
            state.present += 1;
            let _ = state.tx.send(FeedEvent::Presence {
                count: state.present,
            });
            rx
        };

        Ok(Box::new(MemoryRoomFeed {
            room_id: room_id.to_owned(),
            rx,
            inner: Arc::clone(&self.inner),
            left: false,
        }))
    }

    async fn send_typing(&self, room_id: &str, username: &str) -> Result<(), TransportError> {
        self.publish(
            room_id,
            FeedEvent::Typing {
                username: username.to_owned(),
            },
        );
        Ok(())
    }
}

struct MemoryRoomFeed {
    room_id: String,
    rx: broadcast::Receiver<FeedEvent>,
    inner: Arc<Inner>,
    left: bool,
}

#[async_trait]
impl RoomFeed for MemoryRoomFeed {
    async fn next_event(&mut self) -> Option<FeedEvent> {
        if self.left {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.inner.withdraw_presence(&self.room_id);
    }
}

impl Drop for MemoryRoomFeed {
    fn drop(&mut self) {
        if !self.left {
            self.left = true;
            self.inner.withdraw_presence(&self.room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_core::{ROOM_TTL_MS, RoomKind};

    fn new_room_row(code: &str, created_at_ms: u64) -> NewRoomRow {
        NewRoomRow {
            kind: RoomKind::Group,
            code: code.to_owned(),
            created_at_ms,
            expires_at_ms: created_at_ms + ROOM_TTL_MS,
            active_participants: 1,
            last_activity_ms: created_at_ms,
        }
    }

    #[tokio::test]
    async fn inserts_and_fetches_messages_in_timestamp_order() {
        let backend = InMemoryChatBackend::new();
        let room = backend
            .insert_room(new_room_row("111111", 1_000))
            .await
            .expect("room insert");

        for content in ["one", "two", "three"] {
            backend
                .insert_message(NewMessageRow {
                    room_id: room.id.clone(),
                    username: "alice".into(),
                    content: content.into(),
                })
                .await
                .expect("message insert");
        }

        let rows = backend.fetch_messages(&room.id).await.expect("fetch");
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].created_at_ms <= w[1].created_at_ms));
        let bodies: Vec<_> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn rejects_duplicate_code_among_unexpired_rooms_only() {
        let backend = InMemoryChatBackend::new();
        backend
            .insert_room(new_room_row("222222", 1_000))
            .await
            .expect("first insert");

        let err = backend
            .insert_room(new_room_row("222222", 2_000))
            .await
            .expect_err("duplicate active code must conflict");
        assert!(matches!(err, TransportError::Conflict(_)));

        // Same code is fine once the first room has expired.
        backend
            .insert_room(new_room_row("222222", 1_000 + ROOM_TTL_MS + 1))
            .await
            .expect("expired codes are reusable");
    }

    #[tokio::test]
    async fn lookup_treats_expired_rooms_as_missing() {
        let backend = InMemoryChatBackend::new();
        let room = backend
            .insert_room(new_room_row("333333", 1_000))
            .await
            .expect("insert");

        backend
            .find_room_by_code("333333", room.expires_at_ms - 1)
            .await
            .expect("still joinable before expiry");

        let err = backend
            .find_room_by_code("333333", room.expires_at_ms)
            .await
            .expect_err("expired rooms must not match");
        assert_eq!(err, TransportError::NotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_joins_never_lose_increments() {
        let backend = InMemoryChatBackend::new();
        let room = backend
            .insert_room(new_room_row("444444", 1_000))
            .await
            .expect("insert");

        let joins = 16;
        let mut handles = Vec::new();
        for _ in 0..joins {
            let backend = backend.clone();
            let room_id = room.id.clone();
            handles.push(tokio::spawn(async move {
                backend.join_room(&room_id, 2_000).await.expect("join")
            }));
        }
        for handle in handles {
            handle.await.expect("join task");
        }

        let joined = backend
            .find_room_by_code("444444", 2_000)
            .await
            .expect("lookup");
        assert_eq!(joined.active_participants, 1 + joins);
    }

    #[tokio::test]
    async fn feed_echoes_inserts_and_typing() {
        let backend = InMemoryChatBackend::new();
        let room = backend
            .insert_room(new_room_row("555555", 1_000))
            .await
            .expect("insert");

        let mut feed = backend.join(&room.id).await.expect("subscribe");
        // First event is the joiner's own presence registration.
        assert_eq!(
            feed.next_event().await,
            Some(FeedEvent::Presence { count: 1 })
        );

        backend
            .insert_message(NewMessageRow {
                room_id: room.id.clone(),
                username: "alice".into(),
                content: "hello".into(),
            })
            .await
            .expect("insert message");
        match feed.next_event().await {
            Some(FeedEvent::Insert(row)) => assert_eq!(row.content, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        backend
            .send_typing(&room.id, "alice")
            .await
            .expect("typing");
        assert_eq!(
            feed.next_event().await,
            Some(FeedEvent::Typing {
                username: "alice".into()
            })
        );
    }

    #[tokio::test]
    async fn presence_count_tracks_joins_and_leaves() {
        let backend = InMemoryChatBackend::new();
        let room = backend
            .insert_room(new_room_row("666666", 1_000))
            .await
            .expect("insert");

        let mut first = backend.join(&room.id).await.expect("first join");
        assert_eq!(
            first.next_event().await,
            Some(FeedEvent::Presence { count: 1 })
        );

        let mut second = backend.join(&room.id).await.expect("second join");
        assert_eq!(
            first.next_event().await,
            Some(FeedEvent::Presence { count: 2 })
        );

        second.leave().await;
        second.leave().await; // idempotent
        assert_eq!(
            first.next_event().await,
            Some(FeedEvent::Presence { count: 1 })
        );
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let backend = InMemoryChatBackend::new();
        let room = backend
            .insert_room(new_room_row("777777", 1_000))
            .await
            .expect("insert");

        backend.set_fetch_failure(true);
        let err = backend
            .fetch_messages(&room.id)
            .await
            .expect_err("fetch should fail");
        assert!(matches!(err, TransportError::Unavailable(_)));

        backend.set_fetch_failure(false);
        backend.fetch_messages(&room.id).await.expect("recovered");

        backend.set_subscribe_failure(true);
        let err = backend.join(&room.id).await.err().expect("join should fail");
        assert!(matches!(err, TransportError::Unavailable(_)));
    }
}
