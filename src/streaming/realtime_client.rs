//! Gemini Live WebSocket client
//!
//! # Connection Flow
//!
//! 1. Open the WebSocket (with retries)
//! 2. Send `setup`, wait for `setupComplete`
//! 3. Spawn a writer task draining the outbound queue and a reader task
//!    turning server frames into `TransportEvent`s
//! 4. `close()` sends a close frame and stops the reader
//!
//! # Retry Strategy
//!
//! Transient failures (network, timeouts, 5xx) retry with exponential backoff
//! (1s, 2s, ...). Rejections (4xx, close during setup) fail immediately.

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientMessage, ServerMessage};
use super::{LiveConfig, LiveConnector, LiveSession, OpenedSession, TransportError, TransportEvent};
use crate::audio::EncodedChunk;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue depth, in frames (~4 s of 16 kHz audio)
const OUTBOUND_CAPACITY: usize = 16;

/// Inbound event queue depth
const EVENT_CAPACITY: usize = 256;

/// Why a single connection attempt failed
#[derive(Debug)]
enum AttemptError {
    /// Worth retrying
    Transient(String),
    /// The service said no
    Rejected(String),
}

impl AttemptError {
    fn message(&self) -> &str {
        match self {
            AttemptError::Transient(m) | AttemptError::Rejected(m) => m,
        }
    }
}

fn classify_ws_error(err: WsError) -> AttemptError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let message = format!("HTTP {}", status);
            if status.is_client_error() {
                AttemptError::Rejected(message)
            } else {
                AttemptError::Transient(message)
            }
        }
        WsError::Url(e) => AttemptError::Rejected(e.to_string()),
        WsError::HttpFormat(e) => AttemptError::Rejected(e.to_string()),
        other => AttemptError::Transient(other.to_string()),
    }
}

/// Production connector for the Gemini Live API
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiConnector;

impl LiveConnector for GeminiConnector {
    fn open(&self, config: LiveConfig) -> BoxFuture<'static, Result<OpenedSession, TransportError>> {
        Box::pin(GeminiSession::connect(config))
    }
}

enum Outbound {
    Audio(EncodedChunk),
    Close,
}

/// Handle to an open live session
pub struct GeminiSession {
    outbound: mpsc::Sender<Outbound>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
    dropped: u64,
    closed: bool,
}

impl GeminiSession {
    /// Connect and complete the `setup` handshake.
    pub async fn connect(config: LiveConfig) -> Result<OpenedSession, TransportError> {
        if config.api_key.is_empty() {
            return Err(TransportError::MissingApiKey);
        }

        let attempts = config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = config.retry_base_delay * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying live connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_connect(&config).await {
                Ok(opened) => return Ok(opened),
                Err(AttemptError::Rejected(message)) => {
                    log::warn!("Live service rejected the session: {}", message);
                    return Err(TransportError::HandshakeFailed(message));
                }
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e.message());
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError::HandshakeFailed(
            last_error
                .map(|e| e.message().to_string())
                .unwrap_or_else(|| "Max retries exceeded".to_string()),
        ))
    }

    /// Single connection attempt (no retries)
    async fn try_connect(config: &LiveConfig) -> Result<OpenedSession, AttemptError> {
        let url = format!("{}?key={}", config.endpoint, config.api_key);
        let request = url
            .into_client_request()
            .map_err(|e| AttemptError::Rejected(format!("Invalid endpoint: {}", e)))?;

        log::info!("Connecting to live service ({})...", config.model);

        let (ws_stream, _response) = timeout(
            config.connect_timeout,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| AttemptError::Transient("Connection timeout".to_string()))?
        .map_err(classify_ws_error)?;

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| AttemptError::Rejected(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        log::info!("WebSocket connected, waiting for setupComplete...");

        timeout(config.setup_timeout, wait_for_setup(&mut read))
            .await
            .map_err(|_| AttemptError::Transient("Setup timeout".to_string()))??;

        log::info!("Live session ready");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let writer_task = tokio::spawn(write_loop(write, outbound_rx));
        let reader_task = tokio::spawn(read_loop(read, events_tx, config.output_sample_rate));

        let session = GeminiSession {
            outbound: outbound_tx,
            writer_task,
            reader_task,
            dropped: 0,
            closed: false,
        };

        Ok(OpenedSession {
            session: Box::new(session),
            events: events_rx,
        })
    }
}

/// Consume frames until `setupComplete`.
async fn wait_for_setup(read: &mut SplitStream<WsStream>) -> Result<(), AttemptError> {
    while let Some(msg_result) = read.next().await {
        let payload = match msg_result {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "Connection closed during setup".to_string());
                return Err(AttemptError::Rejected(reason));
            }
            Ok(_) => continue,
            Err(e) => return Err(AttemptError::Transient(e.to_string())),
        };

        match serde_json::from_slice::<ServerMessage>(&payload) {
            Ok(msg) if msg.is_setup_complete() => return Ok(()),
            Ok(_) => log::debug!("Ignoring message while waiting for setupComplete"),
            Err(e) => log::warn!("Failed to parse message: {}", e),
        }
    }

    Err(AttemptError::Transient("Stream ended during setup".to_string()))
}

async fn write_loop(mut write: SplitSink<WsStream, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    let mut sent: u64 = 0;
    let mut failed: u64 = 0;

    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Audio(chunk) => {
                let json = match serde_json::to_string(&ClientMessage::realtime_audio(&chunk)) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Failed to serialize audio frame: {}", e);
                        continue;
                    }
                };

                match write.send(Message::Text(json)).await {
                    Ok(()) => {
                        sent += 1;
                        if sent % 50 == 0 {
                            log::debug!("Sent {} audio frames", sent);
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        if failed == 1 || failed % 50 == 0 {
                            log::warn!("Failed to send audio frame ({} total): {}", failed, e);
                        }
                    }
                }
            }
            Outbound::Close => {
                if let Err(e) = write.close().await {
                    log::debug!("Close frame not sent (already closed?): {}", e);
                }
                break;
            }
        }
    }

    log::debug!("Writer task exiting ({} frames sent)", sent);
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
    output_rate: u32,
) {
    loop {
        let payload = match read.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                log::info!("WebSocket closed by server: {:?}", reason);
                let _ = events.send(TransportEvent::Closed { reason }).await;
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                let _ = events.send(TransportEvent::Closed { reason: None }).await;
                break;
            }
            Some(Err(e)) => {
                log::warn!("WebSocket error: {}", e);
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        };

        let msg = match serde_json::from_slice::<ServerMessage>(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to parse message: {}", e);
                continue;
            }
        };

        for event in msg.into_events(output_rate) {
            if events.send(event).await.is_err() {
                log::debug!("Event receiver closed");
                return;
            }
        }
    }

    log::debug!("Reader task exiting");
}

impl LiveSession for GeminiSession {
    fn send(&mut self, chunk: EncodedChunk) {
        if self.closed {
            return;
        }

        if let Err(e) = self.outbound.try_send(Outbound::Audio(chunk)) {
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 50 == 0 {
                let why = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "writer stopped",
                };
                log::warn!("Dropped outbound frame ({}, {} total)", why, self.dropped);
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        log::info!("Closing live session...");
        self.reader_task.abort();

        // Queue full or writer gone: nothing more will be flushed anyway
        if self.outbound.try_send(Outbound::Close).is_err() {
            self.writer_task.abort();
        }
    }
}

impl Drop for GeminiSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_url_error_is_rejection() {
        let err = "not a url".into_client_request().unwrap_err();
        assert!(matches!(classify_ws_error(err), AttemptError::Rejected(_)));
    }

    #[test]
    fn test_classify_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            classify_ws_error(WsError::Io(io)),
            AttemptError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let result = GeminiSession::connect(LiveConfig::new("")).await;
        assert_eq!(result.unwrap_err(), TransportError::MissingApiKey);
    }

    #[tokio::test]
    #[ignore] // Requires GEMINI_API_KEY and network access
    async fn test_live_connection() {
        let api_key = crate::settings::get_api_key().expect("GEMINI_API_KEY required");
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut opened = GeminiSession::connect(LiveConfig::new(api_key))
            .await
            .expect("Connection failed");

        let silence = crate::audio::encode(&vec![0.0; 1600], 16000).unwrap();
        opened.session.send(silence);
        opened.session.close();
    }
}
