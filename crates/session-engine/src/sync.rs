//! Session synchronizer: owns the canonical timeline for the active room,
//! merges optimistic local sends with confirmed remote events, and drives
//! the reconnect loop.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use session_core::{
    DeliveryStatus, EngineError, ErrorKind, EventStream, Message, ReconnectPolicy, RemoteMerge,
    Room, SessionChannelError, SessionChannels, SessionCommand, SessionEvent,
    SessionLifecycleState, SessionStateMachine, Timeline,
};
use session_transport::{ChatStore, FeedEvent, RealtimeBackend};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    cache::LocalCache,
    clock::now_ms,
    config::EngineConfig,
    directory::RoomDirectory,
    live::{LiveChannel, LiveSignal},
    store::{MessageStoreAdapter, confirmed_message},
};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;
const LIVE_BUFFER: usize = 256;
const TIMER_BUFFER: usize = 64;

/// Cloneable handle to a spawned session runtime.
#[derive(Clone)]
pub struct SessionHandle {
    channels: SessionChannels,
}

impl SessionHandle {
    /// Send one command to the runtime.
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.channels.send_command(command).await
    }

    /// Subscribe to emitted session events.
    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn the session runtime task and return its handle.
///
/// One runtime serves one session: at most one active room at a time, with
/// all timeline mutations applied by the runtime task in arrival order.
pub fn spawn_session(
    store: Arc<dyn ChatStore>,
    realtime: Arc<dyn RealtimeBackend>,
    config: EngineConfig,
) -> SessionHandle {
    let (channels, command_rx) = SessionChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let runtime = SessionSynchronizer::new(channels.clone(), command_rx, store, realtime, config);
    tokio::spawn(async move {
        runtime.run().await;
    });

    SessionHandle { channels }
}

/// Internal timer beats delivered back into the runtime loop.
#[derive(Debug)]
enum TimerSignal {
    /// The fixed reconnect interval elapsed.
    RetryConnect,
    /// The sent-to-confirmed delay elapsed for one entry.
    ConfirmDelivery { local_id: String },
}

enum Step {
    Command(Option<SessionCommand>),
    Live(LiveSignal),
    Timer(TimerSignal),
}

struct SessionSynchronizer {
    channels: SessionChannels,
    command_rx: mpsc::Receiver<SessionCommand>,
    live_rx: mpsc::Receiver<LiveSignal>,
    timer_rx: mpsc::Receiver<TimerSignal>,
    timer_tx: mpsc::Sender<TimerSignal>,
    directory: RoomDirectory,
    adapter: MessageStoreAdapter,
    cache: LocalCache,
    realtime: Arc<dyn RealtimeBackend>,
    config: EngineConfig,
    reconnect: ReconnectPolicy,
    machine: SessionStateMachine,
    timeline: Timeline,
    display_name: Option<String>,
    room: Option<Room>,
    connected: bool,
    typing_peers: BTreeSet<String>,
    live: Option<LiveChannel>,
    retry_task: Option<CancellationToken>,
    /// Scopes the per-send confirm timers; renewed on activation, cancelled
    /// on teardown so no timer fires into a closed session.
    session_scope: CancellationToken,
}

impl SessionSynchronizer {
    fn new(
        channels: SessionChannels,
        command_rx: mpsc::Receiver<SessionCommand>,
        store: Arc<dyn ChatStore>,
        realtime: Arc<dyn RealtimeBackend>,
        config: EngineConfig,
    ) -> Self {
        // Replaced with a real receiver on every subscription; starts closed.
        let (_closed_tx, live_rx) = mpsc::channel(1);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_BUFFER);
        let reconnect = ReconnectPolicy::new(config.reconnect_interval_ms);

        Self {
            channels,
            command_rx,
            live_rx,
            timer_rx,
            timer_tx,
            directory: RoomDirectory::new(Arc::clone(&store)),
            adapter: MessageStoreAdapter::new(store),
            cache: LocalCache::new(),
            realtime,
            config,
            reconnect,
            machine: SessionStateMachine::default(),
            timeline: Timeline::new(),
            display_name: None,
            room: None,
            connected: false,
            typing_peers: BTreeSet::new(),
            live: None,
            retry_task: None,
            session_scope: CancellationToken::new(),
        }
    }

    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.command_rx.recv() => Step::Command(command),
                Some(signal) = self.live_rx.recv() => Step::Live(signal),
                Some(timer) = self.timer_rx.recv() => Step::Timer(timer),
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => {
                    self.teardown();
                    return;
                }
                Step::Live(signal) => self.handle_live_signal(signal),
                Step::Timer(timer) => self.handle_timer(timer).await,
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetDisplayName { name } => self.handle_set_display_name(name),
            SessionCommand::CreateRoom { kind } => {
                let Ok(()) = self.require_room_slot("create_room") else {
                    return;
                };
                match self.directory.generate_code(kind).await {
                    Ok(room) => self.activate(room).await,
                    Err(err) => self.emit_error(&err),
                }
            }
            SessionCommand::JoinRoom { code } => {
                let Ok(()) = self.require_room_slot("join_room") else {
                    return;
                };
                match self.directory.join_by_code(code.trim()).await {
                    Ok(room) => self.activate(room).await,
                    Err(err) => self.emit_error(&err),
                }
            }
            SessionCommand::SendMessage { content } => self.handle_send(content).await,
            SessionCommand::RetrySend { local_id } => self.handle_retry_send(local_id).await,
            SessionCommand::AnnounceTyping => self.handle_announce_typing().await,
            SessionCommand::LeaveRoom => self.teardown(),
        }
    }

    fn handle_set_display_name(&mut self, name: String) {
        let trimmed = name.trim().to_owned();
        if trimmed.is_empty() {
            self.emit_error(&EngineError::new(
                ErrorKind::Internal,
                "display_name_empty",
                "display name must be non-empty",
            ));
            return;
        }
        if self.display_name.is_some() {
            self.emit_error(&EngineError::new(
                ErrorKind::Internal,
                "display_name_immutable",
                "display name is already set for this session",
            ));
            return;
        }
        debug!(name = %trimmed, "display name set");
        self.display_name = Some(trimmed);
    }

    /// Room operations require a display name and no currently-active room.
    fn require_room_slot(&mut self, action: &str) -> Result<(), ()> {
        if self.display_name.is_none() {
            self.emit_error(&EngineError::new(
                ErrorKind::Internal,
                "display_name_required",
                format!("set a display name before '{action}'"),
            ));
            return Err(());
        }
        if self.room.is_some() {
            self.emit_error(&EngineError::invalid_state(self.machine.state(), action));
            return Err(());
        }
        Ok(())
    }

    async fn activate(&mut self, room: Room) {
        match self.machine.begin_loading() {
            Ok(state) => self.channels.emit(SessionEvent::StateChanged { state }),
            Err(err) => {
                self.emit_error(&err);
                return;
            }
        }

        self.session_scope = CancellationToken::new();
        self.room = Some(room.clone());
        self.channels.emit(SessionEvent::RoomActivated { room });
        self.load_and_connect().await;
    }

    /// The loading sequence: history fetch (cache fallback) followed by
    /// live-channel setup. Re-run wholesale on every reconnect attempt so
    /// events missed during the gap are recovered from the store.
    async fn load_and_connect(&mut self) {
        let Some(room) = self.room.clone() else {
            return;
        };

        match self.adapter.fetch_history(&room.id).await {
            Ok(messages) => {
                self.cache.save(&room.id, &messages);
                self.timeline.replace(messages);
            }
            Err(err) => {
                warn!(room_id = %room.id, error = %err, "history fetch failed, using cache");
                self.timeline.replace(self.cache.load(&room.id));
                self.emit_error(&err);
            }
        }
        self.channels.emit(SessionEvent::TimelineSnapshot {
            messages: self.timeline.messages().to_vec(),
        });

        // Fresh signal channel per subscription so a stale pump from a
        // previous attempt cannot feed the loop.
        let (live_tx, live_rx) = mpsc::channel(LIVE_BUFFER);
        let typing_delay = Duration::from_millis(self.config.typing_stop_delay_ms);
        match LiveChannel::open(Arc::clone(&self.realtime), &room.id, typing_delay, live_tx).await {
            Ok(channel) => {
                self.live_rx = live_rx;
                self.live = Some(channel);
                self.cancel_retry();
                match self.machine.mark_live() {
                    Ok(state) => self.channels.emit(SessionEvent::StateChanged { state }),
                    Err(err) => debug!(error = %err, "live transition rejected"),
                }
                self.set_connected(true);
            }
            Err(err) => self.enter_reconnecting(err),
        }
    }

    fn enter_reconnecting(&mut self, err: EngineError) {
        if let Some(live) = self.live.take() {
            live.close();
        }
        if self.machine.mark_reconnecting().is_err() {
            // Torn down (or never active); nothing to recover.
            return;
        }
        self.channels.emit(SessionEvent::StateChanged {
            state: SessionLifecycleState::Reconnecting,
        });
        self.set_connected(false);
        self.emit_error(&err);
        self.schedule_retry();
    }

    async fn handle_send(&mut self, content: String) {
        let Some(sender) = self.display_name.clone() else {
            self.emit_error(&EngineError::new(
                ErrorKind::Internal,
                "display_name_required",
                "set a display name before sending",
            ));
            return;
        };
        let Some(room) = self.room.clone() else {
            self.emit_error(&EngineError::invalid_state(
                self.machine.state(),
                "send_message",
            ));
            return;
        };
        if !self.machine.can_send() {
            self.emit_error(&EngineError::invalid_state(
                self.machine.state(),
                "send_message",
            ));
            return;
        }
        let content = content.trim().to_owned();
        if content.is_empty() {
            self.emit_error(&EngineError::new(
                ErrorKind::Send,
                "empty_message",
                "message content must be non-empty",
            ));
            return;
        }

        let local_id = Uuid::new_v4().to_string();
        let message = Message {
            server_id: None,
            local_id: Some(local_id.clone()),
            room_id: room.id.clone(),
            sender: sender.clone(),
            content: content.clone(),
            created_at_ms: now_ms(),
            status: DeliveryStatus::Pending,
        };
        self.timeline.append_local(message.clone());
        self.channels.emit(SessionEvent::MessageAppended { message });

        self.perform_append(local_id, room.id, content, sender).await;
    }

    async fn handle_retry_send(&mut self, local_id: String) {
        let Some(room) = self.room.clone() else {
            self.emit_error(&EngineError::invalid_state(
                self.machine.state(),
                "retry_send",
            ));
            return;
        };
        if !self.machine.can_send() {
            self.emit_error(&EngineError::invalid_state(
                self.machine.state(),
                "retry_send",
            ));
            return;
        }

        match self.timeline.reset_for_retry(&local_id) {
            Ok(message) => {
                self.channels.emit(SessionEvent::MessageUpdated {
                    message: message.clone(),
                });
                self.perform_append(local_id, room.id, message.content, message.sender)
                    .await;
            }
            Err(err) => self.emit_error(&EngineError::new(
                ErrorKind::Send,
                "retry_unavailable",
                err.to_string(),
            )),
        }
    }

    /// Resolve one optimistic entry against the store. The entry was already
    /// appended; here it either gains its server identity (`Sent`, with the
    /// confirm beat scheduled) or parks at `Failed` for manual retry.
    async fn perform_append(
        &mut self,
        local_id: String,
        room_id: String,
        content: String,
        sender: String,
    ) {
        match self.adapter.append(&room_id, &content, &sender).await {
            Ok(stored) => {
                let server_id = stored.server_id.unwrap_or_default();
                match self.timeline.resolve_send(
                    &local_id,
                    &server_id,
                    stored.created_at_ms,
                    DeliveryStatus::Sent,
                ) {
                    Ok(message) => {
                        self.channels.emit(SessionEvent::MessageUpdated { message });
                        self.schedule_confirm(local_id);
                    }
                    Err(err) => debug!(%local_id, error = %err, "send resolution skipped"),
                }
            }
            Err(err) => {
                warn!(%local_id, error = %err, "message send failed");
                if let Ok(message) = self.timeline.mark_failed(&local_id) {
                    self.channels.emit(SessionEvent::MessageUpdated { message });
                }
            }
        }
    }

    async fn handle_announce_typing(&mut self) {
        let Some(name) = self.display_name.clone() else {
            return;
        };
        if let Some(live) = &self.live {
            if let Err(err) = live.announce_typing(&name).await {
                debug!(error = %err, "typing announcement failed");
            }
        }
    }

    fn handle_live_signal(&mut self, signal: LiveSignal) {
        // Nothing may reach presentation once the session is torn down.
        if matches!(
            self.machine.state(),
            SessionLifecycleState::Uninitialized | SessionLifecycleState::Closed
        ) {
            return;
        }

        match signal {
            LiveSignal::Event(FeedEvent::Insert(row)) => {
                match self.timeline.merge_remote(confirmed_message(row)) {
                    RemoteMerge::Merged(message) => {
                        self.channels.emit(SessionEvent::MessageUpdated { message });
                    }
                    RemoteMerge::Appended(message) => {
                        self.channels.emit(SessionEvent::MessageAppended { message });
                    }
                    RemoteMerge::Ignored => {}
                }
            }
            LiveSignal::Event(FeedEvent::Typing { username }) => self.apply_typing(username),
            LiveSignal::Event(FeedEvent::Presence { count }) => {
                self.channels.emit(SessionEvent::Presence { count });
            }
            LiveSignal::Lost => {
                if self.machine.state() == SessionLifecycleState::Live {
                    self.enter_reconnecting(EngineError::new(
                        ErrorKind::Channel,
                        "channel_lost",
                        "live subscription ended unexpectedly",
                    ));
                }
            }
        }
    }

    fn apply_typing(&mut self, username: String) {
        let changed = if username.is_empty() {
            // The stop sentinel carries no name; clear the whole set.
            let had_peers = !self.typing_peers.is_empty();
            self.typing_peers.clear();
            had_peers
        } else if self.display_name.as_deref() == Some(username.as_str()) {
            false
        } else {
            self.typing_peers.insert(username)
        };

        if changed {
            self.channels.emit(SessionEvent::TypingPeers {
                names: self.typing_peers.iter().cloned().collect(),
            });
        }
    }

    async fn handle_timer(&mut self, timer: TimerSignal) {
        match timer {
            TimerSignal::RetryConnect => {
                if self.machine.state() != SessionLifecycleState::Reconnecting {
                    return;
                }
                match self.machine.begin_loading() {
                    Ok(state) => self.channels.emit(SessionEvent::StateChanged { state }),
                    Err(err) => {
                        debug!(error = %err, "reconnect attempt rejected");
                        return;
                    }
                }
                self.load_and_connect().await;
            }
            TimerSignal::ConfirmDelivery { local_id } => {
                if self.room.is_none() {
                    return;
                }
                // The echo may have confirmed the entry already; a rejected
                // promotion is expected then.
                if let Ok(message) = self.timeline.promote(&local_id, DeliveryStatus::Confirmed) {
                    self.channels.emit(SessionEvent::MessageUpdated { message });
                }
            }
        }
    }

    fn schedule_confirm(&self, local_id: String) {
        let scope = self.session_scope.clone();
        let timer_tx = self.timer_tx.clone();
        let delay = Duration::from_millis(self.config.confirm_delay_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = timer_tx.send(TimerSignal::ConfirmDelivery { local_id }).await;
                }
            }
        });
    }

    fn schedule_retry(&mut self) {
        self.cancel_retry();
        let token = CancellationToken::new();
        self.retry_task = Some(token.clone());
        let timer_tx = self.timer_tx.clone();
        let delay = self.reconnect.interval();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = timer_tx.send(TimerSignal::RetryConnect).await;
                }
            }
        });
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry_task.take() {
            token.cancel();
        }
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.channels
                .emit(SessionEvent::ConnectivityChanged { connected });
        }
    }

    fn emit_error(&self, err: &EngineError) {
        self.channels.emit(SessionEvent::SessionError {
            code: err.code.clone(),
            message: err.message.clone(),
            recoverable: err.is_recoverable(),
        });
    }

    /// Tear the session down: unsubscribe first, then cancel timers and
    /// clear references. Safe to call repeatedly; the second call emits
    /// nothing.
    fn teardown(&mut self) {
        if let Some(live) = self.live.take() {
            live.close();
        }
        self.cancel_retry();
        self.session_scope.cancel();
        self.room = None;
        self.typing_peers.clear();
        self.timeline.clear();

        if self.machine.close() {
            self.set_connected(false);
            self.channels.emit(SessionEvent::StateChanged {
                state: SessionLifecycleState::Closed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_core::{ROOM_TTL_MS, RoomKind};
    use session_transport::InMemoryChatBackend;
    use tokio::time::timeout;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

    fn test_config() -> EngineConfig {
        EngineConfig {
            reconnect_interval_ms: 40,
            typing_stop_delay_ms: 40,
            confirm_delay_ms: 20,
        }
    }

    fn spawn_test_session() -> (InMemoryChatBackend, SessionHandle, EventStream) {
        let backend = InMemoryChatBackend::new();
        let store: Arc<dyn ChatStore> = Arc::new(backend.clone());
        let realtime: Arc<dyn RealtimeBackend> = Arc::new(backend.clone());
        let handle = spawn_session(store, realtime, test_config());
        let events = handle.subscribe();
        (backend, handle, events)
    }

    async fn next_event(events: &mut EventStream) -> SessionEvent {
        timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("event should arrive in time")
            .expect("event stream should stay open")
    }

    async fn wait_for<F>(events: &mut EventStream, mut matches: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let event = next_event(events).await;
            if matches(&event) {
                return event;
            }
        }
    }

    async fn live_room(
        handle: &SessionHandle,
        events: &mut EventStream,
        kind: RoomKind,
    ) -> Room {
        handle
            .send(SessionCommand::SetDisplayName {
                name: "alice".into(),
            })
            .await
            .expect("command");
        handle
            .send(SessionCommand::CreateRoom { kind })
            .await
            .expect("command");

        let activated = wait_for(events, |e| matches!(e, SessionEvent::RoomActivated { .. })).await;
        wait_for(events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Live
                }
            )
        })
        .await;

        match activated {
            SessionEvent::RoomActivated { room } => room,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn create_group_room_reaches_live_with_expected_shape() {
        let (_backend, handle, mut events) = spawn_test_session();
        let room = live_room(&handle, &mut events, RoomKind::Group).await;

        assert_eq!(room.kind, RoomKind::Group);
        assert_eq!(room.active_participants, 1);
        assert_eq!(room.expires_at_ms - room.created_at_ms, ROOM_TTL_MS);

        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::ConnectivityChanged { connected: true })
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::Presence { count: 1 })
        })
        .await;
    }

    #[tokio::test]
    async fn send_progresses_pending_sent_confirmed_without_duplicates() {
        let (_backend, handle, mut events) = spawn_test_session();
        live_room(&handle, &mut events, RoomKind::Direct).await;

        handle
            .send(SessionCommand::SendMessage {
                content: "hello".into(),
            })
            .await
            .expect("command");

        let mut statuses = Vec::new();
        let mut appended = 0;
        while statuses.last() != Some(&DeliveryStatus::Confirmed) {
            match next_event(&mut events).await {
                SessionEvent::MessageAppended { message } => {
                    appended += 1;
                    statuses.push(message.status);
                }
                SessionEvent::MessageUpdated { message } => statuses.push(message.status),
                _ => {}
            }
        }

        assert_eq!(appended, 1, "self-echo must merge, not duplicate");
        assert_eq!(
            statuses,
            [
                DeliveryStatus::Pending,
                DeliveryStatus::Sent,
                DeliveryStatus::Confirmed
            ]
        );
    }

    #[tokio::test]
    async fn unknown_code_surfaces_not_found() {
        let (_backend, handle, mut events) = spawn_test_session();
        handle
            .send(SessionCommand::SetDisplayName {
                name: "alice".into(),
            })
            .await
            .expect("command");
        handle
            .send(SessionCommand::JoinRoom {
                code: "000000".into(),
            })
            .await
            .expect("command");

        let event = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SessionError { .. })
        })
        .await;
        match event {
            SessionEvent::SessionError {
                code, recoverable, ..
            } => {
                assert_eq!(code, "code_not_found");
                assert!(!recoverable);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_cached_snapshot_and_stays_live() {
        let (backend, handle, mut events) = spawn_test_session();
        let room = live_room(&handle, &mut events, RoomKind::Direct).await;

        handle
            .send(SessionCommand::SendMessage {
                content: "remember me".into(),
            })
            .await
            .expect("command");
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::MessageUpdated { message } if message.status == DeliveryStatus::Confirmed
            )
        })
        .await;

        // Rejoin once so the fetched history lands in the cache.
        handle.send(SessionCommand::LeaveRoom).await.expect("command");
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Closed
                }
            )
        })
        .await;
        handle
            .send(SessionCommand::JoinRoom {
                code: room.code.clone(),
            })
            .await
            .expect("command");
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Live
                }
            )
        })
        .await;
        handle.send(SessionCommand::LeaveRoom).await.expect("command");
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Closed
                }
            )
        })
        .await;

        // Now the fetch fails; the cached snapshot must carry the session.
        backend.set_fetch_failure(true);
        handle
            .send(SessionCommand::JoinRoom { code: room.code })
            .await
            .expect("command");

        let error = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SessionError { .. })
        })
        .await;
        match error {
            SessionEvent::SessionError {
                code, recoverable, ..
            } => {
                assert_eq!(code, "history_fetch_failed");
                assert!(recoverable);
            }
            _ => unreachable!(),
        }

        let snapshot = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::TimelineSnapshot { .. })
        })
        .await;
        match snapshot {
            SessionEvent::TimelineSnapshot { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content, "remember me");
            }
            _ => unreachable!(),
        }

        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Live
                }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn channel_failure_enters_reconnecting_then_recovers() {
        let (backend, handle, mut events) = spawn_test_session();
        backend.set_subscribe_failure(true);

        handle
            .send(SessionCommand::SetDisplayName {
                name: "alice".into(),
            })
            .await
            .expect("command");
        handle
            .send(SessionCommand::CreateRoom {
                kind: RoomKind::Direct,
            })
            .await
            .expect("command");

        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Reconnecting
                }
            )
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::SessionError {
                    recoverable: true,
                    ..
                }
            )
        })
        .await;

        // Next timed attempt succeeds, re-fetching history on the way.
        backend.set_subscribe_failure(false);
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::TimelineSnapshot { .. })
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Live
                }
            )
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::ConnectivityChanged { connected: true })
        })
        .await;
    }

    #[tokio::test]
    async fn typing_events_track_peers_and_skip_self() {
        let (backend, handle, mut events) = spawn_test_session();
        let room = live_room(&handle, &mut events, RoomKind::Group).await;

        // Own name must never appear, so "bob" is the first set change.
        backend.send_typing(&room.id, "alice").await.expect("typing");
        backend.send_typing(&room.id, "bob").await.expect("typing");

        let event = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::TypingPeers { .. })
        })
        .await;
        match event {
            SessionEvent::TypingPeers { names } => assert_eq!(names, ["bob"]),
            _ => unreachable!(),
        }

        backend.send_typing(&room.id, "").await.expect("typing stop");
        let event = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::TypingPeers { .. })
        })
        .await;
        match event {
            SessionEvent::TypingPeers { names } => assert!(names.is_empty()),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn failed_send_parks_until_manual_retry() {
        let (backend, handle, mut events) = spawn_test_session();
        live_room(&handle, &mut events, RoomKind::Direct).await;

        backend.set_insert_failure(true);
        handle
            .send(SessionCommand::SendMessage {
                content: "try hard".into(),
            })
            .await
            .expect("command");

        let appended = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::MessageAppended { .. })
        })
        .await;
        let local_id = match appended {
            SessionEvent::MessageAppended { message } => {
                assert_eq!(message.status, DeliveryStatus::Pending);
                message.local_id.expect("optimistic entries carry local ids")
            }
            _ => unreachable!(),
        };

        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::MessageUpdated { message } if message.status == DeliveryStatus::Failed
            )
        })
        .await;

        backend.set_insert_failure(false);
        handle
            .send(SessionCommand::RetrySend {
                local_id: local_id.clone(),
            })
            .await
            .expect("command");

        let mut statuses = Vec::new();
        while statuses.last() != Some(&DeliveryStatus::Confirmed) {
            match next_event(&mut events).await {
                SessionEvent::MessageUpdated { message }
                    if message.local_id.as_deref() == Some(local_id.as_str()) =>
                {
                    statuses.push(message.status);
                }
                SessionEvent::MessageAppended { .. } => {
                    panic!("retry must reuse the existing entry");
                }
                _ => {}
            }
        }
        assert_eq!(
            statuses,
            [
                DeliveryStatus::Pending,
                DeliveryStatus::Sent,
                DeliveryStatus::Confirmed
            ]
        );
    }

    #[tokio::test]
    async fn send_before_activation_is_rejected() {
        let (_backend, handle, mut events) = spawn_test_session();
        handle
            .send(SessionCommand::SetDisplayName {
                name: "alice".into(),
            })
            .await
            .expect("command");
        handle
            .send(SessionCommand::SendMessage {
                content: "too early".into(),
            })
            .await
            .expect("command");

        let event = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SessionError { .. })
        })
        .await;
        match event {
            SessionEvent::SessionError { code, .. } => {
                assert_eq!(code, "invalid_state_transition");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn display_name_is_required_and_immutable() {
        let (_backend, handle, mut events) = spawn_test_session();

        handle
            .send(SessionCommand::CreateRoom {
                kind: RoomKind::Direct,
            })
            .await
            .expect("command");
        let event = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SessionError { .. })
        })
        .await;
        match event {
            SessionEvent::SessionError { code, .. } => assert_eq!(code, "display_name_required"),
            _ => unreachable!(),
        }

        handle
            .send(SessionCommand::SetDisplayName {
                name: "alice".into(),
            })
            .await
            .expect("command");
        handle
            .send(SessionCommand::SetDisplayName { name: "bob".into() })
            .await
            .expect("command");
        let event = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SessionError { .. })
        })
        .await;
        match event {
            SessionEvent::SessionError { code, .. } => assert_eq!(code, "display_name_immutable"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_silences_callbacks() {
        let (_backend, handle, mut events) = spawn_test_session();
        live_room(&handle, &mut events, RoomKind::Direct).await;

        handle.send(SessionCommand::LeaveRoom).await.expect("command");
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionLifecycleState::Closed
                }
            )
        })
        .await;

        handle.send(SessionCommand::LeaveRoom).await.expect("command");

        // Nothing else may reach subscribers after teardown.
        let followup = timeout(Duration::from_millis(200), events.recv()).await;
        assert!(followup.is_err(), "unexpected event after teardown: {followup:?}");
    }
}
