mod logging;

use std::{sync::Arc, time::Duration};

use session_core::{
    DeliveryStatus, RoomKind, SessionCommand, SessionEvent, SessionLifecycleState,
    format_time_remaining,
};
use session_engine::{EngineConfig, SessionHandle, spawn_session};
use session_transport::{ChatStore, InMemoryChatBackend, RealtimeBackend};
use tokio::time::timeout;

const EVENT_WINDOW: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let backend = InMemoryChatBackend::new();
    let store: Arc<dyn ChatStore> = Arc::new(backend.clone());
    let realtime: Arc<dyn RealtimeBackend> = Arc::new(backend.clone());
    let handle = spawn_session(store, realtime, config);
    let mut events = handle.subscribe();

    // Scripted exchange: create a group room, send one message, wait for
    // the confirmed delivery, then tear down.
    send(&handle, SessionCommand::SetDisplayName {
        name: "smoke".into(),
    })
    .await;
    send(&handle, SessionCommand::CreateRoom {
        kind: RoomKind::Group,
    })
    .await;
    send(&handle, SessionCommand::SendMessage {
        content: "hello from the smoke run".into(),
    })
    .await;

    loop {
        let event = match timeout(EVENT_WINDOW, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(err)) => {
                eprintln!("Event stream ended: {err}");
                std::process::exit(1);
            }
            Err(_) => {
                eprintln!("No event within {EVENT_WINDOW:?}; giving up");
                std::process::exit(1);
            }
        };

        match event {
            SessionEvent::StateChanged { state } => {
                println!("state: {state:?}");
                if state == SessionLifecycleState::Closed {
                    break;
                }
            }
            SessionEvent::RoomActivated { room } => {
                println!(
                    "room {} ({:?}) code {} expires in {}",
                    room.id,
                    room.kind,
                    room.code,
                    format_time_remaining(room.expires_at_ms, room.created_at_ms)
                );
            }
            SessionEvent::TimelineSnapshot { messages } => {
                println!("snapshot: {} message(s)", messages.len());
            }
            SessionEvent::MessageAppended { message } => {
                println!("appended [{:?}] {}: {}", message.status, message.sender, message.content);
            }
            SessionEvent::MessageUpdated { message } => {
                println!("updated  [{:?}] {}: {}", message.status, message.sender, message.content);
                if message.status == DeliveryStatus::Confirmed {
                    send(&handle, SessionCommand::LeaveRoom).await;
                }
            }
            SessionEvent::ConnectivityChanged { connected } => {
                println!("connected: {connected}");
            }
            SessionEvent::TypingPeers { names } => {
                println!("typing: {names:?}");
            }
            SessionEvent::Presence { count } => {
                println!("presence: {count}");
            }
            SessionEvent::SessionError {
                code,
                message,
                recoverable,
            } => {
                println!("error [{code}] recoverable={recoverable}: {message}");
            }
        }
    }

    println!("Smoke run complete.");
}

async fn send(handle: &SessionHandle, command: SessionCommand) {
    if let Err(err) = handle.send(command).await {
        eprintln!("Command channel closed: {err}");
        std::process::exit(1);
    }
}
