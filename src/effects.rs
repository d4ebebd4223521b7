//! Effect runner for live sessions
//!
//! This module executes effects produced by the state machine. It owns every
//! live resource (microphone, output device, transport, background tasks) and
//! is driven only from the controller loop, so none of them need locking.
//! Effects that complete synchronously hand their follow-up events straight
//! back; asynchronous work reports through the event channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{
    CaptureHandle, CapturePipeline, CpalMicrophone, CpalSpeaker, FrameSink, LevelMeter,
    Microphone, PlaybackScheduler, Speaker,
};
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event, SessionId};
use crate::streaming::{GeminiConnector, LiveConnector, LiveSession, OpenedSession, TransportError};

/// Trait for running effects.
/// Returns follow-up events to process before anything else in the queue.
pub trait EffectRunner {
    fn run(&mut self, effect: Effect, tx: &mpsc::Sender<Event>) -> Vec<Event>;

    /// Current meter reading, 0 when no session is live
    fn volume(&self) -> f32;
}

/// Resources held for one session id
struct ActiveSession {
    id: SessionId,
    capture: Option<CaptureHandle>,
    playback: Option<PlaybackScheduler>,
    transport: Option<Box<dyn LiveSession>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            capture: None,
            playback: None,
            transport: None,
            tasks: Vec::new(),
        }
    }

    /// Release order: stop capture, close transport, flush playback, then
    /// release device handles and background tasks.
    fn release(mut self) {
        if let Some(capture) = &self.capture {
            capture.pause();
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.flush();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        drop(self.playback.take());
        drop(self.transport.take());
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("Session {} released", self.id);
    }
}

/// Effect runner with real devices and transport behind traits
pub struct SessionRuntime {
    settings: AppSettings,
    api_key: Option<String>,
    connector: Arc<dyn LiveConnector>,
    microphone: Box<dyn Microphone>,
    speaker: Box<dyn Speaker>,
    meter: LevelMeter,
    active: Option<ActiveSession>,
    volume: f32,
}

impl SessionRuntime {
    pub fn new(
        settings: AppSettings,
        api_key: Option<String>,
        connector: Arc<dyn LiveConnector>,
        microphone: Box<dyn Microphone>,
        speaker: Box<dyn Speaker>,
    ) -> Self {
        Self {
            settings,
            api_key,
            connector,
            microphone,
            speaker,
            meter: LevelMeter::new(),
            active: None,
            volume: 0.0,
        }
    }

    /// cpal devices and the Gemini Live transport
    pub fn with_defaults(settings: AppSettings, api_key: Option<String>) -> Self {
        Self::new(
            settings,
            api_key,
            Arc::new(GeminiConnector),
            Box::new(CpalMicrophone::new()),
            Box::new(CpalSpeaker::new()),
        )
    }

    fn active_for(&mut self, id: SessionId) -> Option<&mut ActiveSession> {
        self.active.as_mut().filter(|active| active.id == id)
    }

    fn acquire_devices(&mut self, id: SessionId, tx: &mpsc::Sender<Event>) -> Vec<Event> {
        self.teardown();
        let mut active = ActiveSession::new(id);

        // Output first so the first reply has somewhere to go
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        let output = match self.speaker.open_output(
            self.settings.output_sample_rate,
            self.meter.playback_tap(),
            ended_tx,
        ) {
            Ok(output) => output,
            Err(e) => {
                log::error!("Failed to open audio output: {}", e);
                self.active = Some(active);
                return vec![Event::DevicesFailed {
                    id,
                    err: e.to_string(),
                }];
            }
        };
        active.playback = Some(PlaybackScheduler::new(output, self.settings.output_sample_rate));

        let ended_events = tx.clone();
        active.tasks.push(tokio::spawn(async move {
            while let Some(source) = ended_rx.recv().await {
                if ended_events
                    .send(Event::SourceEnded { id, source })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));

        let frame_events = tx.clone();
        let mut dropped: u64 = 0;
        let on_frame: FrameSink = Box::new(move |chunk| {
            // Never queue: a frame the loop cannot take right now is lost
            if let Err(mpsc::error::TrySendError::Full(_)) =
                frame_events.try_send(Event::CaptureFrame { id, chunk })
            {
                dropped += 1;
                if dropped == 1 || dropped % 50 == 0 {
                    log::warn!("Event loop saturated, dropped {} capture frames", dropped);
                }
            }
        });

        let pipeline = CapturePipeline::new(self.settings.capture_config());
        match pipeline.open(self.microphone.as_mut(), self.meter.capture_tap(), on_frame) {
            Ok(capture) => active.capture = Some(capture),
            Err(e) => {
                log::error!("Failed to open microphone: {}", e);
                self.active = Some(active);
                return vec![Event::DevicesFailed {
                    id,
                    err: e.to_string(),
                }];
            }
        }

        log::info!("Devices ready for session {}", id);
        self.active = Some(active);
        vec![Event::DevicesReady { id }]
    }

    fn open_transport(
        &mut self,
        id: SessionId,
        instruction: Option<String>,
        tx: &mpsc::Sender<Event>,
    ) -> Vec<Event> {
        let Some(api_key) = self.api_key.clone() else {
            return vec![Event::HandshakeFail {
                id,
                err: TransportError::MissingApiKey.to_string(),
            }];
        };

        let instruction =
            instruction.or_else(|| Some(self.settings.default_instruction.clone()));
        let config = self.settings.live_config(api_key).with_instruction(instruction);
        let handshake = self.connector.open(config);

        let Some(active) = self.active_for(id) else {
            log::warn!("No devices held for session {}, not connecting", id);
            return vec![];
        };

        let tx = tx.clone();
        active.tasks.push(tokio::spawn(async move {
            let event = match handshake.await {
                Ok(opened) => Event::HandshakeOk { id, opened },
                Err(e) => {
                    log::warn!("Handshake for session {} failed: {}", id, e);
                    Event::HandshakeFail {
                        id,
                        err: e.to_string(),
                    }
                }
            };
            if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
                // Loop is gone; close anything we opened
                if let Event::HandshakeOk { mut opened, .. } = event {
                    opened.session.close();
                }
            }
        }));

        vec![]
    }

    fn activate_session(&mut self, id: SessionId, opened: OpenedSession, tx: &mpsc::Sender<Event>) {
        let meter_interval = self.settings.meter_interval();

        let Some(active) = self.active_for(id) else {
            discard_session(opened);
            return;
        };

        let OpenedSession {
            session,
            mut events,
        } = opened;
        active.transport = Some(session);

        let inbound = tx.clone();
        active.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inbound.send(Event::Inbound { id, event }).await.is_err() {
                    break;
                }
            }
        }));

        let ticks = tx.clone();
        active.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(meter_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    ticks.try_send(Event::MeterTick { id })
                {
                    break;
                }
            }
        }));

        if let Some(capture) = &active.capture {
            capture.start();
        }

        log::info!("Session {} live", id);
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            active.release();
        }
        self.meter.reset();
        self.volume = 0.0;
    }
}

fn discard_session(opened: OpenedSession) {
    let mut session = opened.session;
    session.close();
    log::info!("Closed superseded live session");
}

impl EffectRunner for SessionRuntime {
    fn run(&mut self, effect: Effect, tx: &mpsc::Sender<Event>) -> Vec<Event> {
        match effect {
            Effect::AcquireDevices { id } => self.acquire_devices(id, tx),
            Effect::OpenTransport { id, instruction } => self.open_transport(id, instruction, tx),
            Effect::ActivateSession { id, opened } => {
                self.activate_session(id, opened, tx);
                vec![]
            }
            Effect::DiscardSession { opened } => {
                discard_session(opened);
                vec![]
            }
            Effect::SendFrame { chunk } => {
                if let Some(transport) = self.active.as_mut().and_then(|a| a.transport.as_mut()) {
                    transport.send(chunk);
                }
                vec![]
            }
            Effect::SchedulePlayback { chunk } => {
                if let Some(playback) = self.active.as_mut().and_then(|a| a.playback.as_mut()) {
                    if let Err(e) = playback.enqueue(&chunk) {
                        log::warn!("Dropping inbound audio: {}", e);
                    }
                }
                vec![]
            }
            Effect::FlushPlayback => {
                if let Some(playback) = self.active.as_mut().and_then(|a| a.playback.as_mut()) {
                    log::info!("Model interrupted");
                    playback.flush();
                }
                vec![]
            }
            Effect::ReleaseSource { source } => {
                if let Some(playback) = self.active.as_mut().and_then(|a| a.playback.as_mut()) {
                    playback.source_ended(source);
                }
                vec![]
            }
            Effect::SampleLevel => {
                if self.active.is_some() {
                    self.volume = self.meter.sample();
                }
                vec![]
            }
            Effect::Teardown => {
                self.teardown();
                vec![]
            }
            Effect::Release { id } => {
                self.teardown();
                vec![Event::Released { id }]
            }
            Effect::EmitUi => vec![],
        }
    }

    fn volume(&self) -> f32 {
        self.volume
    }
}
