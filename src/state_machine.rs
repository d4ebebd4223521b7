//! State machine for live sessions
//!
//! This module implements the session controller using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute. Every asynchronous
//! completion carries the session id it was issued under; completions for
//! any other session are dropped here.

use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::audio::{EncodedChunk, SourceId};
use crate::streaming::{OpenedSession, TransportEvent};

pub type SessionId = Uuid;

/// Public connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal state of the session workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    /// Idle. `last_error` keeps the reason the previous session failed.
    Disconnected {
        last_error: Option<String>,
    },
    Connecting {
        session_id: SessionId,
        instruction: Option<String>,
    },
    Connected {
        session_id: SessionId,
        started_at: Instant,
    },
    /// Session failed; resources are being released. Settles into
    /// `Disconnected` once the release is confirmed.
    Error {
        session_id: SessionId,
        message: String,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Disconnected { last_error: None }
    }
}

impl State {
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            State::Disconnected { .. } => ConnectionState::Disconnected,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Connected { .. } => ConnectionState::Connected,
            State::Error { .. } => ConnectionState::Error,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            State::Connecting { session_id, .. } | State::Connected { session_id, .. } => {
                Some(*session_id)
            }
            State::Disconnected { .. } | State::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            State::Error { message, .. } => Some(message),
            State::Disconnected { last_error } => last_error.as_deref(),
            _ => None,
        }
    }
}

/// Events that can trigger state transitions.
/// Commands come from the session handle; everything tagged with an `id`
/// comes from devices, the transport or timers.
#[derive(Debug)]
pub enum Event {
    /// User asked to start a session
    Connect {
        instruction: Option<String>,
    },
    /// User asked to end the session
    Disconnect,
    /// Application exit requested
    Shutdown,
    /// Resources of a failed session are gone
    Released {
        id: SessionId,
    },

    // Device acquisition
    DevicesReady {
        id: SessionId,
    },
    DevicesFailed {
        id: SessionId,
        err: String,
    },

    // Handshake
    HandshakeOk {
        id: SessionId,
        opened: OpenedSession,
    },
    HandshakeFail {
        id: SessionId,
        err: String,
    },

    // Live traffic
    CaptureFrame {
        id: SessionId,
        chunk: EncodedChunk,
    },
    Inbound {
        id: SessionId,
        event: TransportEvent,
    },
    SourceEnded {
        id: SessionId,
        source: SourceId,
    },
    /// Level meter render tick
    MeterTick {
        id: SessionId,
    },
}

impl Event {
    /// Events that fire many times per second and are not worth logging
    pub fn is_high_frequency(&self) -> bool {
        matches!(
            self,
            Event::CaptureFrame { .. }
                | Event::MeterTick { .. }
                | Event::SourceEnded { .. }
                | Event::Inbound {
                    event: TransportEvent::AudioChunk(_),
                    ..
                }
        )
    }
}

/// Effects to be executed after a state transition.
#[derive(Debug)]
pub enum Effect {
    /// Open the output device and microphone (capture stays unarmed)
    AcquireDevices {
        id: SessionId,
    },
    /// Start the handshake
    OpenTransport {
        id: SessionId,
        instruction: Option<String>,
    },
    /// Handshake finished: keep the transport, arm capture, start metering
    ActivateSession {
        id: SessionId,
        opened: OpenedSession,
    },
    /// A handshake nobody is waiting for anymore
    DiscardSession {
        opened: OpenedSession,
    },
    SendFrame {
        chunk: EncodedChunk,
    },
    SchedulePlayback {
        chunk: EncodedChunk,
    },
    FlushPlayback,
    ReleaseSource {
        source: SourceId,
    },
    SampleLevel,
    /// Release everything in reverse acquisition order
    Teardown,
    /// Teardown after a failure; answered with `Event::Released`
    Release {
        id: SessionId,
    },
    /// Signal to publish a new snapshot
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - A handshake result for a stale session is closed, never adopted
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let current_id = state.session_id();
    let is_current = |eid: SessionId| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Commands
        // -----------------
        (State::Disconnected { .. } | State::Error { .. }, Connect { instruction }) => {
            let id = Uuid::new_v4();
            (
                State::Connecting {
                    session_id: id,
                    instruction,
                },
                vec![AcquireDevices { id }, EmitUi],
            )
        }
        // At most one session per controller
        (State::Connecting { .. } | State::Connected { .. }, Connect { .. }) => {
            (state.clone(), vec![])
        }

        (State::Connecting { .. } | State::Connected { .. }, Disconnect) => {
            (State::default(), vec![Teardown, EmitUi])
        }
        (State::Error { .. }, Disconnect) => (State::default(), vec![EmitUi]),
        (State::Disconnected { last_error: Some(_) }, Disconnect) => {
            (State::default(), vec![EmitUi])
        }
        (State::Disconnected { last_error: None }, Disconnect) => (state.clone(), vec![]),

        // -----------------
        // Connecting
        // -----------------
        (
            State::Connecting {
                session_id,
                instruction,
            },
            DevicesReady { id },
        ) if *session_id == id => (
            state.clone(),
            vec![OpenTransport {
                id,
                instruction: instruction.clone(),
            }],
        ),
        (State::Connecting { session_id, .. }, DevicesFailed { id, err })
            if *session_id == id =>
        {
            failed(id, err)
        }
        (State::Connecting { session_id, .. }, HandshakeOk { id, opened }) if *session_id == id => (
            State::Connected {
                session_id: id,
                started_at: Instant::now(),
            },
            vec![ActivateSession { id, opened }, EmitUi],
        ),
        (State::Connecting { session_id, .. }, HandshakeFail { id, err }) if *session_id == id => {
            failed(id, err)
        }

        // -----------------
        // Connected
        // -----------------
        (State::Connected { session_id, .. }, CaptureFrame { id, chunk }) if *session_id == id => {
            (state.clone(), vec![SendFrame { chunk }])
        }
        (State::Connected { session_id, .. }, Inbound { id, event }) if *session_id == id => {
            match event {
                TransportEvent::AudioChunk(chunk) => (state.clone(), vec![SchedulePlayback { chunk }]),
                TransportEvent::Interrupted => (state.clone(), vec![FlushPlayback]),
                TransportEvent::Closed { reason } => {
                    log::info!(
                        "Session {} closed by remote: {}",
                        id,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    (State::default(), vec![Teardown, EmitUi])
                }
                TransportEvent::Error(err) => failed(id, format!("Connection error: {}", err)),
            }
        }
        (State::Connected { session_id, .. }, SourceEnded { id, source }) if *session_id == id => {
            (state.clone(), vec![ReleaseSource { source }])
        }
        (State::Connected { session_id, .. }, MeterTick { id }) if *session_id == id => {
            (state.clone(), vec![SampleLevel, EmitUi])
        }

        // -----------------
        // Error
        // -----------------
        (State::Error { session_id, message }, Released { id }) if *session_id == id => (
            State::Disconnected {
                last_error: Some(message.clone()),
            },
            vec![EmitUi],
        ),

        // -----------------
        // Stale events
        // -----------------
        // A late handshake still owns a live socket: close it
        (_, HandshakeOk { id, opened }) => {
            log::debug!("Discarding stale handshake for session {}", id);
            (state.clone(), vec![DiscardSession { opened }])
        }
        (_, event) => {
            if let Some(eid) = event_session_id(&event) {
                if !is_current(eid) {
                    log::debug!("Ignoring stale event for session {}", eid);
                }
            }
            (state.clone(), vec![])
        }
    }
}

/// Enter `Error`, publish it, and release the session's resources.
fn failed(id: SessionId, message: String) -> (State, Vec<Effect>) {
    (
        State::Error {
            session_id: id,
            message,
        },
        vec![Effect::Release { id }, Effect::EmitUi],
    )
}

fn event_session_id(event: &Event) -> Option<SessionId> {
    match event {
        Event::DevicesReady { id }
        | Event::DevicesFailed { id, .. }
        | Event::HandshakeOk { id, .. }
        | Event::HandshakeFail { id, .. }
        | Event::CaptureFrame { id, .. }
        | Event::Inbound { id, .. }
        | Event::SourceEnded { id, .. }
        | Event::MeterTick { id }
        | Event::Released { id } => Some(*id),
        Event::Connect { .. } | Event::Disconnect | Event::Shutdown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode;
    use crate::streaming::LiveSession;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct FlagSession(Arc<AtomicBool>);

    impl LiveSession for FlagSession {
        fn send(&mut self, _chunk: EncodedChunk) {}
        fn close(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn opened() -> OpenedSession {
        let (_tx, events) = mpsc::channel(1);
        OpenedSession {
            session: Box::new(FlagSession(Arc::new(AtomicBool::new(false)))),
            events,
        }
    }

    fn connecting(id: SessionId) -> State {
        State::Connecting {
            session_id: id,
            instruction: Some("Be brief".into()),
        }
    }

    fn connected(id: SessionId) -> State {
        State::Connected {
            session_id: id,
            started_at: Instant::now(),
        }
    }

    fn chunk() -> EncodedChunk {
        encode(&[0.1, 0.2], 16000).unwrap()
    }

    #[test]
    fn disconnected_connect_transitions_to_connecting() {
        let (next, effects) = reduce(&State::default(), Event::Connect { instruction: None });
        assert!(matches!(next, State::Connecting { .. }));
        assert!(matches!(effects[0], Effect::AcquireDevices { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn connect_after_failure_clears_error() {
        let failed = State::Disconnected {
            last_error: Some("boom".into()),
        };
        let (next, _) = reduce(&failed, Event::Connect { instruction: None });
        assert!(matches!(next, State::Connecting { .. }));
        assert_eq!(next.error(), None);

        let state = State::Error {
            session_id: Uuid::new_v4(),
            message: "boom".into(),
        };
        let (next, _) = reduce(&state, Event::Connect { instruction: None });
        assert!(matches!(next, State::Connecting { .. }));
        assert_eq!(next.error(), None);
    }

    #[test]
    fn second_connect_is_noop() {
        let id = Uuid::new_v4();
        for state in [connecting(id), connected(id)] {
            let (next, effects) = reduce(&state, Event::Connect { instruction: None });
            assert_eq!(next.session_id(), Some(id));
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn devices_ready_opens_transport_with_instruction() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id), Event::DevicesReady { id });
        assert!(matches!(next, State::Connecting { .. }));
        assert!(matches!(
            &effects[..],
            [Effect::OpenTransport { instruction: Some(text), .. }] if text == "Be brief"
        ));
    }

    #[test]
    fn devices_failed_lands_in_error() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id),
            Event::DevicesFailed {
                id,
                err: "Microphone access was denied".into(),
            },
        );
        assert_eq!(next.connection_state(), ConnectionState::Error);
        assert_eq!(next.error(), Some("Microphone access was denied"));
        assert!(matches!(
            &effects[..],
            [Effect::Release { id: released }, Effect::EmitUi] if *released == id
        ));
    }

    #[test]
    fn handshake_ok_activates_session() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id), Event::HandshakeOk { id, opened: opened() });
        assert!(matches!(next, State::Connected { .. }));
        assert!(matches!(effects[0], Effect::ActivateSession { .. }));
    }

    #[test]
    fn handshake_fail_tears_down() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id),
            Event::HandshakeFail {
                id,
                err: "bad key".into(),
            },
        );
        assert_eq!(next.connection_state(), ConnectionState::Error);
        assert!(matches!(effects[0], Effect::Release { .. }));
    }

    #[test]
    fn released_settles_into_disconnected_with_error() {
        let id = Uuid::new_v4();
        let (failed, _) = reduce(
            &connecting(id),
            Event::HandshakeFail {
                id,
                err: "bad key".into(),
            },
        );

        let (next, effects) = reduce(&failed, Event::Released { id });
        assert_eq!(next.connection_state(), ConnectionState::Disconnected);
        assert_eq!(next.error(), Some("bad key"));
        assert!(matches!(&effects[..], [Effect::EmitUi]));

        // A release for some other session changes nothing
        let (next, effects) = reduce(
            &failed,
            Event::Released {
                id: Uuid::new_v4(),
            },
        );
        assert_eq!(next.connection_state(), ConnectionState::Error);
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_handshake_is_discarded() {
        let current = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(current),
            Event::HandshakeOk {
                id: stale,
                opened: opened(),
            },
        );
        assert_eq!(next.session_id(), Some(current));
        assert!(matches!(&effects[..], [Effect::DiscardSession { .. }]));

        // Also after disconnect
        let (_, effects) = reduce(
            &State::default(),
            Event::HandshakeOk {
                id: stale,
                opened: opened(),
            },
        );
        assert!(matches!(&effects[..], [Effect::DiscardSession { .. }]));
    }

    #[test]
    fn stale_frames_are_ignored() {
        let current = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let state = connected(current);

        let (_, effects) = reduce(
            &state,
            Event::CaptureFrame {
                id: stale,
                chunk: chunk(),
            },
        );
        assert!(effects.is_empty());

        let (_, effects) = reduce(
            &state,
            Event::Inbound {
                id: stale,
                event: TransportEvent::Error("old".into()),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn frames_before_connected_are_dropped() {
        let id = Uuid::new_v4();
        let (_, effects) = reduce(&connecting(id), Event::CaptureFrame { id, chunk: chunk() });
        assert!(effects.is_empty());
    }

    #[test]
    fn connected_routes_traffic() {
        let id = Uuid::new_v4();
        let state = connected(id);

        let (_, effects) = reduce(&state, Event::CaptureFrame { id, chunk: chunk() });
        assert!(matches!(&effects[..], [Effect::SendFrame { .. }]));

        let (_, effects) = reduce(
            &state,
            Event::Inbound {
                id,
                event: TransportEvent::AudioChunk(chunk()),
            },
        );
        assert!(matches!(&effects[..], [Effect::SchedulePlayback { .. }]));

        let (_, effects) = reduce(
            &state,
            Event::Inbound {
                id,
                event: TransportEvent::Interrupted,
            },
        );
        assert!(matches!(&effects[..], [Effect::FlushPlayback]));

        let (_, effects) = reduce(&state, Event::SourceEnded { id, source: 7 });
        assert!(matches!(&effects[..], [Effect::ReleaseSource { source: 7 }]));
    }

    #[test]
    fn remote_close_disconnects_without_error() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connected(id),
            Event::Inbound {
                id,
                event: TransportEvent::Closed { reason: None },
            },
        );
        assert!(matches!(next, State::Disconnected { last_error: None }));
        assert!(matches!(effects[0], Effect::Teardown));
    }

    #[test]
    fn transport_error_lands_in_error() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connected(id),
            Event::Inbound {
                id,
                event: TransportEvent::Error("reset by peer".into()),
            },
        );
        assert_eq!(next.error(), Some("Connection error: reset by peer"));
        assert!(matches!(effects[0], Effect::Release { .. }));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id), Event::Disconnect);
        assert!(matches!(next, State::Disconnected { .. }));
        assert!(matches!(effects[0], Effect::Teardown));

        let (next, effects) = reduce(&next, Event::Disconnect);
        assert!(matches!(next, State::Disconnected { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn disconnect_clears_last_error() {
        let state = State::Disconnected {
            last_error: Some("boom".into()),
        };
        let (next, effects) = reduce(&state, Event::Disconnect);
        assert_eq!(next.error(), None);
        assert!(matches!(&effects[..], [Effect::EmitUi]));

        let state = State::Error {
            session_id: Uuid::new_v4(),
            message: "boom".into(),
        };
        let (next, _) = reduce(&state, Event::Disconnect);
        assert!(matches!(next, State::Disconnected { last_error: None }));
    }

    #[test]
    fn meter_tick_only_while_connected() {
        let id = Uuid::new_v4();
        let (_, effects) = reduce(&connected(id), Event::MeterTick { id });
        assert!(matches!(effects[0], Effect::SampleLevel));

        let (_, effects) = reduce(&connecting(id), Event::MeterTick { id });
        assert!(effects.is_empty());
    }

    #[test]
    fn connection_state_serializes_uppercase() {
        let json = serde_json::to_string(&ConnectionState::Connecting).unwrap();
        assert_eq!(json, "\"CONNECTING\"");
    }
}
