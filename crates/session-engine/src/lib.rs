//! Session engine runtime.
//!
//! Built as a command-driven task: presentation sends [`SessionCommand`]s
//! through a [`SessionHandle`] and observes [`SessionEvent`]s on a broadcast
//! stream. The runtime owns the active room, the canonical timeline, the
//! live subscription and the reconnect loop; transport access goes through
//! the `session-transport` traits so backends stay swappable.
//!
//! [`SessionCommand`]: session_core::SessionCommand
//! [`SessionEvent`]: session_core::SessionEvent

pub mod cache;
pub mod clock;
pub mod config;
pub mod directory;
pub mod live;
pub mod store;
pub mod sync;

pub use cache::LocalCache;
pub use config::{ConfigError, EngineConfig};
pub use directory::RoomDirectory;
pub use store::MessageStoreAdapter;
pub use sync::{SessionHandle, spawn_session};
