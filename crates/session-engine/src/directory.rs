//! Room directory: issues and validates one-time room codes.

use std::sync::Arc;

use rand::Rng;
use session_core::{EngineError, ErrorKind, ROOM_TTL_MS, Room, RoomKind};
use session_transport::{ChatStore, NewRoomRow, TransportError};
use tracing::debug;

use crate::clock::now_ms;

/// Collision retries before code generation gives up. The store's
/// uniqueness constraint over unexpired codes is the actual guard; retrying
/// here just papers over the rare collision.
const GENERATE_ATTEMPTS: u32 = 3;

/// Issues fresh room codes and resolves join requests.
#[derive(Clone)]
pub struct RoomDirectory {
    store: Arc<dyn ChatStore>,
}

impl RoomDirectory {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Create a room gated by a fresh 6-digit code.
    ///
    /// The room expires 4 hours after creation and starts with one
    /// participant (the creator).
    pub async fn generate_code(&self, kind: RoomKind) -> Result<Room, EngineError> {
        for attempt in 0..GENERATE_ATTEMPTS {
            let created_at_ms = now_ms();
            let new = NewRoomRow {
                kind,
                code: random_code(),
                created_at_ms,
                expires_at_ms: created_at_ms + ROOM_TTL_MS,
                active_participants: 1,
                last_activity_ms: created_at_ms,
            };

            match self.store.insert_room(new).await {
                Ok(room) => {
                    debug!(room_id = %room.id, code = %room.code, ?kind, "room created");
                    return Ok(room);
                }
                Err(TransportError::Conflict(reason)) => {
                    debug!(attempt, %reason, "room code collision, regenerating");
                }
                Err(err) => {
                    return Err(EngineError::new(
                        ErrorKind::Directory,
                        "room_create_failed",
                        err.to_string(),
                    ));
                }
            }
        }

        Err(EngineError::new(
            ErrorKind::Directory,
            "code_generation_exhausted",
            format!("gave up after {GENERATE_ATTEMPTS} code collisions"),
        ))
    }

    /// Join a room by one-time code.
    ///
    /// Unknown and expired codes are deliberately indistinguishable so
    /// callers cannot probe whether a code ever existed. The participant
    /// increment is a store-side atomic update.
    pub async fn join_by_code(&self, code: &str) -> Result<Room, EngineError> {
        let now = now_ms();
        let room = match self.store.find_room_by_code(code, now).await {
            Ok(room) => room,
            Err(TransportError::NotFound) => {
                return Err(EngineError::new(
                    ErrorKind::NotFound,
                    "code_not_found",
                    "invalid code or the room has expired",
                ));
            }
            Err(err) => {
                return Err(EngineError::new(
                    ErrorKind::Directory,
                    "room_lookup_failed",
                    err.to_string(),
                ));
            }
        };

        self.store
            .join_room(&room.id, now)
            .await
            .map_err(|err| match err {
                TransportError::NotFound => EngineError::new(
                    ErrorKind::NotFound,
                    "code_not_found",
                    "invalid code or the room has expired",
                ),
                other => EngineError::new(ErrorKind::Directory, "room_join_failed", other.to_string()),
            })
    }
}

fn random_code() -> String {
    let value: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{value:06}")
}
