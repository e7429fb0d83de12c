//! Live update channel: one multiplexed per-room subscription plus the
//! typing-stop debounce.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use session_core::{EngineError, ErrorKind};
use session_transport::{FeedEvent, RealtimeBackend};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Signals forwarded from the feed pump to the owning synchronizer.
#[derive(Debug)]
pub enum LiveSignal {
    /// A multiplexed feed event arrived.
    Event(FeedEvent),
    /// The feed ended unexpectedly; the owner must reconnect and re-fetch
    /// history, since missed events are not buffered.
    Lost,
}

/// Handle to one live room subscription.
///
/// Owns the feed pump task and the typing-stop timer; `close` is idempotent
/// and guarantees neither outlives the handle.
pub struct LiveChannel {
    room_id: String,
    realtime: Arc<dyn RealtimeBackend>,
    stop: CancellationToken,
    typing_stop: Mutex<Option<CancellationToken>>,
    typing_delay: Duration,
}

impl LiveChannel {
    /// Subscribe to a room and start pumping feed events into `signal_tx`.
    ///
    /// Presence is registered by the transport once the subscription is
    /// acknowledged, before this returns.
    pub async fn open(
        realtime: Arc<dyn RealtimeBackend>,
        room_id: &str,
        typing_delay: Duration,
        signal_tx: mpsc::Sender<LiveSignal>,
    ) -> Result<Self, EngineError> {
        let mut feed = realtime.join(room_id).await.map_err(|err| {
            EngineError::new(ErrorKind::Channel, "subscribe_failed", err.to_string())
        })?;

        let stop = CancellationToken::new();
        let pump_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_stop.cancelled() => {
                        feed.leave().await;
                        return;
                    }
                    event = feed.next_event() => match event {
                        Some(event) => {
                            if signal_tx.send(LiveSignal::Event(event)).await.is_err() {
                                feed.leave().await;
                                return;
                            }
                        }
                        None => {
                            feed.leave().await;
                            let _ = signal_tx.send(LiveSignal::Lost).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self {
            room_id: room_id.to_owned(),
            realtime,
            stop,
            typing_stop: Mutex::new(None),
            typing_delay,
        })
    }

    /// Broadcast a typing announcement and (re)start the stop timer.
    ///
    /// After `typing_delay` without another announcement the stop sentinel
    /// (empty name) is broadcast on the caller's behalf.
    pub async fn announce_typing(&self, username: &str) -> Result<(), EngineError> {
        let token = CancellationToken::new();
        if let Ok(mut guard) = self.typing_stop.lock() {
            if let Some(previous) = guard.replace(token.clone()) {
                previous.cancel();
            }
        }

        self.realtime
            .send_typing(&self.room_id, username)
            .await
            .map_err(|err| {
                EngineError::new(ErrorKind::Channel, "typing_broadcast_failed", err.to_string())
            })?;

        let realtime = Arc::clone(&self.realtime);
        let room_id = self.room_id.clone();
        let channel_stop = self.stop.clone();
        let delay = self.typing_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = channel_stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(err) = realtime.send_typing(&room_id, "").await {
                        debug!(%room_id, error = %err, "typing stop broadcast failed");
                    }
                }
            }
        });

        Ok(())
    }

    /// Release the subscription and cancel the typing timer. Idempotent.
    pub fn close(&self) {
        self.stop.cancel();
        if let Ok(mut guard) = self.typing_stop.lock() {
            if let Some(token) = guard.take() {
                token.cancel();
            }
        }
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}
