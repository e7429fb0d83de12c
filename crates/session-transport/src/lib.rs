//! Boundary traits toward the remote chat service.
//!
//! The engine only ever talks to [`ChatStore`] (row insert/query, room
//! lookup, atomic joins) and [`RealtimeBackend`] (a per-room feed that
//! multiplexes insert, typing, and presence events over one logical
//! connection). [`memory::InMemoryChatBackend`] implements both for tests
//! and smoke runs, including failure injection for simulating outages.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use session_core::{Room, RoomKind};
use thiserror::Error;

pub use memory::InMemoryChatBackend;

/// Errors surfaced by the transport boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No matching row (unknown code, expired room, missing room id).
    #[error("row not found")]
    NotFound,
    /// A uniqueness constraint rejected the write (duplicate active code).
    #[error("uniqueness conflict: {0}")]
    Conflict(String),
    /// The service is unreachable.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The service rejected or failed the request.
    #[error("transport backend failure: {0}")]
    Backend(String),
}

/// Room insert payload; the store assigns the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoomRow {
    pub kind: RoomKind,
    pub code: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub active_participants: u32,
    pub last_activity_ms: u64,
}

/// Message insert payload; the store assigns identifier and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessageRow {
    pub room_id: String,
    pub username: String,
    pub content: String,
}

/// One persisted message row, ordered by `created_at_ms` within a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub username: String,
    pub content: String,
    pub created_at_ms: u64,
}

/// Event classes multiplexed over one per-room feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A message row was inserted for the room (own writes echo too).
    Insert(MessageRow),
    /// Ephemeral typing broadcast; an empty name is the stop sentinel.
    Typing {
        username: String,
    },
    /// Tracked-peer count changed.
    Presence {
        count: u64,
    },
}

/// Row-oriented store surface: insert/query plus the conditional updates the
/// join path needs. The caller owns all retry behavior.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert a room; fails with [`TransportError::Conflict`] when the code
    /// collides with an unexpired room.
    async fn insert_room(&self, new: NewRoomRow) -> Result<Room, TransportError>;

    /// Look up a room by code whose expiry has not passed.
    async fn find_room_by_code(&self, code: &str, now_ms: u64) -> Result<Room, TransportError>;

    /// Atomically increment the participant counter and bump last-activity.
    /// Concurrent joins must not lose increments.
    async fn join_room(&self, room_id: &str, now_ms: u64) -> Result<Room, TransportError>;

    /// Bump the room's last-activity timestamp.
    async fn touch_room(&self, room_id: &str, now_ms: u64) -> Result<(), TransportError>;

    /// Insert a message row; the stored row (with id and timestamp) is
    /// returned and also echoed on the room's feed.
    async fn insert_message(&self, new: NewMessageRow) -> Result<MessageRow, TransportError>;

    /// All messages for a room ordered by creation timestamp ascending.
    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<MessageRow>, TransportError>;
}

/// Per-room live subscription surface.
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Subscribe to a room's feed. Local presence is registered once the
    /// subscription is acknowledged, before this returns.
    async fn join(&self, room_id: &str) -> Result<BoxedRoomFeed, TransportError>;

    /// Broadcast a typing payload to the room; empty name = stop sentinel.
    async fn send_typing(&self, room_id: &str, username: &str) -> Result<(), TransportError>;
}

/// Handle to one live room subscription.
///
/// The feed does not buffer events across a disconnect; after a resubscribe
/// only events from that point forward are observed.
#[async_trait]
pub trait RoomFeed: Send {
    /// Next multiplexed event; `None` once the feed is closed.
    async fn next_event(&mut self) -> Option<FeedEvent>;

    /// Release the subscription and withdraw presence. Idempotent.
    async fn leave(&mut self);
}

pub type BoxedRoomFeed = Box<dyn RoomFeed>;
