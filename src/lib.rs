pub mod audio;
pub mod effects;
pub mod services;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use effects::EffectRunner;
use state_machine::{reduce, ConnectionState, Effect, Event, State};

/// Event channel depth between producers and the controller loop
const EVENT_CAPACITY: usize = 64;

/// UI state published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub error: Option<String>,
    /// 0.0-255.0; 0 unless connected
    pub volume: f32,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            error: None,
            volume: 0.0,
        }
    }
}

fn state_to_snapshot(state: &State, volume: f32) -> SessionSnapshot {
    let connection_state = state.connection_state();
    SessionSnapshot {
        connection_state,
        error: state.error().map(str::to_string),
        volume: if connection_state == ConnectionState::Connected {
            volume
        } else {
            0.0
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Session loop is not running")]
pub struct LoopClosed;

/// Command side of a session: cheap to clone, usable from any task.
#[derive(Clone)]
pub struct LiveSessionHandle {
    tx: mpsc::Sender<Event>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl LiveSessionHandle {
    /// Start a session. No-op while connecting or connected.
    pub async fn connect(&self, instruction: Option<String>) -> Result<(), LoopClosed> {
        self.send(Event::Connect { instruction }).await
    }

    /// End the session from any state.
    pub async fn disconnect(&self) -> Result<(), LoopClosed> {
        self.send(Event::Disconnect).await
    }

    /// Release everything and stop the controller loop.
    pub async fn shutdown(&self) -> Result<(), LoopClosed> {
        self.send(Event::Shutdown).await
    }

    async fn send(&self, event: Event) -> Result<(), LoopClosed> {
        self.tx.send(event).await.map_err(|_| LoopClosed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, LoopClosed> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx.wait_for(|s| predicate(s)).await.map_err(|_| LoopClosed)?;
        Ok((*snapshot).clone())
    }
}

/// Single writer of session state
///
/// Owns the state, the effect runner and the receiving end of the event
/// channel. `run()` is not `Send` when the runner holds audio devices, so it
/// is driven on the caller's task (e.g. with `tokio::join!`), not spawned.
pub struct SessionController<R: EffectRunner> {
    runner: R,
    state: State,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<R: EffectRunner> SessionController<R> {
    pub fn new(runner: R) -> (Self, LiveSessionHandle) {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let handle = LiveSessionHandle {
            tx: tx.clone(),
            snapshot: snapshot_rx,
        };
        let controller = Self {
            runner,
            state: State::default(),
            rx,
            tx,
            snapshot_tx,
        };
        (controller, handle)
    }

    /// Run the main state loop until `Shutdown`.
    pub async fn run(mut self) {
        self.emit_ui();
        log::info!("Session loop started");

        while let Some(event) = self.rx.recv().await {
            // Handle Shutdown at the edge
            if matches!(event, Event::Shutdown) {
                log::info!("Shutdown requested, releasing session");
                self.runner.run(Effect::Teardown, &self.tx);
                self.state = State::default();
                self.emit_ui();
                break;
            }

            self.dispatch(event);
        }

        log::info!("Session loop ended");
    }

    /// Reduce one event and everything it synchronously leads to.
    fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            if !event.is_high_frequency() {
                log::debug!("Received event: {:?}", event);
            }

            let old_state = self.state.connection_state();
            let (next, effects) = reduce(&self.state, event);
            let new_state = next.connection_state();

            if old_state != new_state {
                match next.error() {
                    Some(err) => log::warn!("State transition: {} -> {} ({})", old_state, new_state, err),
                    None => log::info!("State transition: {} -> {}", old_state, new_state),
                }
            }

            self.state = next;

            for eff in effects {
                match eff {
                    Effect::EmitUi => self.emit_ui(),
                    other => queue.extend(self.runner.run(other, &self.tx)),
                }
            }
        }
    }

    fn emit_ui(&self) {
        let snapshot = state_to_snapshot(&self.state, self.runner.volume());
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn snapshot_hides_volume_unless_connected() {
        let connected = State::Connected {
            session_id: Uuid::new_v4(),
            started_at: std::time::Instant::now(),
        };
        assert_eq!(state_to_snapshot(&connected, 42.0).volume, 42.0);
        assert_eq!(state_to_snapshot(&State::default(), 42.0).volume, 0.0);
    }

    #[test]
    fn snapshot_carries_error() {
        let state = State::Error {
            session_id: Uuid::new_v4(),
            message: "Microphone access was denied".into(),
        };
        let snapshot = state_to_snapshot(&state, 0.0);
        assert_eq!(snapshot.connection_state, ConnectionState::Error);
        assert_eq!(snapshot.error.as_deref(), Some("Microphone access was denied"));
    }

    #[test]
    fn snapshot_keeps_error_after_release() {
        let state = State::Disconnected {
            last_error: Some("Microphone access was denied".into()),
        };
        let snapshot = state_to_snapshot(&state, 12.0);
        assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
        assert_eq!(snapshot.error.as_deref(), Some("Microphone access was denied"));
        assert_eq!(snapshot.volume, 0.0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(SessionSnapshot::default()).unwrap();
        assert_eq!(json["connectionState"], "DISCONNECTED");
        assert!(json["error"].is_null());
        assert_eq!(json["volume"], 0.0);
    }
}
