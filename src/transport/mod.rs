//! WebSocket transport to the remote voice-agent endpoint.
//!
//! Maintains a single streaming connection per client: signed-URL
//! resolution over HTTPS, the WebSocket handshake, JSON frame
//! encode/decode, and keepalive pings. Inbound frames surface as
//! [`TransportEvent`]s on the channel returned by `connect`; outbound
//! audio goes through a bounded queue whose fullness is reported as
//! [`SendStatus::NotReady`] rather than blocking the caller.
//!
//! ## Protocol Overview
//!
//! 1. **Connect** — resolve the WebSocket URL (signed when a credential is
//!    configured, public otherwise) and open the socket
//! 2. **Initiate** — send the conversation-initiation frame, receive
//!    conversation metadata (id + audio formats)
//! 3. **Stream** — send base64 `user_audio_chunk` frames, receive agent
//!    audio, transcripts, VAD scores, and interruption notices
//! 4. **Close** — idempotent local close from any state
//!
//! The transport never retries on its own; a failed connect surfaces once
//! and the automation layer decides whether to call `start` again (see
//! [`Backoff`] for the caller-driven delay helper).

pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFrame;
use crate::error::{VoxError, VoxResult};

pub use wire::ConversationMeta;

// ── Events and statuses ────────────────────────────────────────────

/// Event produced by the transport for the session controller.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Conversation metadata arrived; the stream is live.
    Connected(ConversationMeta),
    /// Agent speech: raw little-endian PCM16 bytes.
    Audio(Vec<u8>),
    /// Transcription of the user's speech.
    UserTranscript(String),
    /// The agent's textual reply.
    AgentResponse(String),
    /// Remote voice-activity score for the user input, 0.0..=1.0.
    VadScore(f32),
    /// The user interrupted the agent mid-reply.
    Interrupted,
    /// The remote endpoint closed the stream.
    Disconnected,
    /// Mid-stream failure; the payload is a diagnostic message.
    Error(String),
}

/// Outcome of a non-blocking audio send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The frame was queued for transmission.
    Sent,
    /// The outbound queue is full; drop or retry later.
    NotReady,
}

/// Parameters for one connection attempt.
#[derive(Clone)]
pub struct ConnectParams {
    /// Identifier of the remote conversational agent.
    pub agent_id: String,
    /// Optional API credential. Sensitive: never logged.
    pub credential: Option<String>,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("agent_id", &self.agent_id)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

// ── Transport seam ─────────────────────────────────────────────────

/// Seam between the session controller and the network.
///
/// [`TransportClient`] is the production implementation; tests drive the
/// controller with a scripted mock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the streaming connection.
    ///
    /// Returns the transport event channel on success. Failure is
    /// reported once and never retried internally.
    async fn connect(&self, params: ConnectParams) -> VoxResult<mpsc::Receiver<TransportEvent>>;

    /// Send the conversation-initiation frame, exactly once per
    /// connection, immediately after connect and before any audio. An
    /// empty string keeps the agent's configured greeting.
    async fn send_initial_message(&self, text: &str) -> VoxResult<()>;

    /// Queue one fixed-size audio frame. Backpressure is reported as
    /// [`SendStatus::NotReady`]; the call never blocks.
    fn stream_audio(&self, frame: &AudioFrame) -> VoxResult<SendStatus>;

    /// Close the connection. Idempotent and safe from any state.
    async fn close(&self);

    /// Whether the socket is currently open.
    fn is_connected(&self) -> bool;
}

// ── Configuration ──────────────────────────────────────────────────

/// Tunables for the production transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// HTTPS base of the agent platform API.
    pub api_base: String,
    /// Deadline for the connect handshake.
    pub connect_timeout: Duration,
    /// Interval between client keepalive pings.
    pub keepalive_interval: Duration,
    /// How long a signed URL stays cached before re-minting.
    pub signed_url_ttl: Duration,
    /// Outbound queue depth; a full queue surfaces as `NotReady`.
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.voxwire.dev".into(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10),
            signed_url_ttl: Duration::from_secs(600),
            outbound_capacity: 256,
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────

#[derive(Debug)]
enum OutboundFrame {
    Json(String),
    Close,
}

struct Conn {
    outbound_tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    initial_sent: Arc<AtomicBool>,
}

struct SignedUrl {
    url: String,
    minted: Instant,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Production WebSocket transport.
pub struct TransportClient {
    config: TransportConfig,
    http: reqwest::Client,
    conn: Mutex<Option<Conn>>,
    signed: Mutex<Option<SignedUrl>>,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            conn: Mutex::new(None),
            signed: Mutex::new(None),
        }
    }

    /// Public (credential-less) streaming URL for an agent.
    fn public_ws_url(api_base: &str, agent_id: &str) -> String {
        let base = api_base.trim_end_matches('/');
        let ws_base = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{ws_base}/v1/agents/stream?agent_id={agent_id}")
    }

    /// Resolve the WebSocket URL for this attempt.
    async fn resolve_ws_url(&self, params: &ConnectParams) -> VoxResult<String> {
        match &params.credential {
            Some(credential) => self.signed_ws_url(&params.agent_id, credential).await,
            None => Ok(Self::public_ws_url(&self.config.api_base, &params.agent_id)),
        }
    }

    /// Mint (or reuse) a signed streaming URL.
    ///
    /// Signed URLs expire server-side, so the cache is renewed once the
    /// configured TTL elapses.
    async fn signed_ws_url(&self, agent_id: &str, credential: &str) -> VoxResult<String> {
        if let Some(cached) = self.signed.lock().as_ref() {
            if cached.minted.elapsed() < self.config.signed_url_ttl {
                return Ok(cached.url.clone());
            }
        }

        let endpoint = format!(
            "{}/v1/agents/{agent_id}/signed-url",
            self.config.api_base.trim_end_matches('/')
        );
        tracing::debug!(agent_id, "Minting signed streaming URL");

        let response = self
            .http
            .get(&endpoint)
            .header("x-api-key", credential)
            .send()
            .await
            .map_err(|e| VoxError::ConnectFailure(format!("signed-url request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VoxError::ConnectFailure(format!(
                "signed-url request returned {}",
                response.status()
            )));
        }

        let body: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| VoxError::ConnectFailure(format!("malformed signed-url response: {e}")))?;

        *self.signed.lock() = Some(SignedUrl {
            url: body.signed_url.clone(),
            minted: Instant::now(),
        });
        Ok(body.signed_url)
    }

    // ── Internal loops ────────────────────────────────────────────

    /// Outbound loop: single writer for the WebSocket sink.
    ///
    /// Drains the frame queue and interleaves keepalive pings; exits on
    /// cancellation or sink failure.
    async fn outbound_loop(
        mut rx: mpsc::Receiver<OutboundFrame>,
        mut sink: futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            WsMessage,
        >,
        cancel: CancellationToken,
        keepalive_interval: Duration,
        connected: Arc<AtomicBool>,
    ) {
        let started = Instant::now();
        let mut ping_id: u64 = 0;
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = keepalive.tick() => {
                    ping_id += 1;
                    let frame = wire::build_client_ping(
                        ping_id,
                        started.elapsed().as_millis() as u64,
                    );
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize keepalive ping");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(json.into())).await.is_err() {
                        tracing::warn!("WebSocket send failed for keepalive, closing outbound loop");
                        break;
                    }
                }
                msg = rx.recv() => match msg {
                    Some(OutboundFrame::Json(json)) => {
                        if sink.send(WsMessage::Text(json.into())).await.is_err() {
                            tracing::warn!("WebSocket send failed, closing outbound loop");
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
            }
        }

        connected.store(false, Ordering::SeqCst);
        tracing::debug!("Transport outbound loop terminated");
    }

    /// Inbound loop: decode server frames and forward transport events.
    async fn inbound_loop(
        mut stream: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
        event_tx: mpsc::Sender<TransportEvent>,
        outbound_tx: mpsc::Sender<OutboundFrame>,
        cancel: CancellationToken,
        connected: Arc<AtomicBool>,
    ) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = stream.next() => msg,
            };

            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if Self::handle_frame(text.as_str(), &event_tx, &outbound_tx)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                // Some endpoints deliver JSON control frames as Binary.
                Some(Ok(WsMessage::Binary(data))) if data.first() == Some(&b'{') => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        if Self::handle_frame(text, &event_tx, &outbound_tx)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(frame = ?frame, "Remote endpoint closed the stream");
                    let _ = event_tx.send(TransportEvent::Disconnected).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = event_tx
                        .send(TransportEvent::Error(format!("websocket error: {e}")))
                        .await;
                    break;
                }
                None => {
                    let _ = event_tx.send(TransportEvent::Disconnected).await;
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        tracing::debug!("Transport inbound loop terminated");
    }

    /// Decode one inbound frame. `Err` means the event channel is gone
    /// and the loop should exit.
    async fn handle_frame(
        text: &str,
        event_tx: &mpsc::Sender<TransportEvent>,
        outbound_tx: &mpsc::Sender<OutboundFrame>,
    ) -> Result<(), ()> {
        let frame = match wire::parse_server_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = text.len(), "Skipping unparseable frame");
                return Ok(());
            }
        };

        let event = match frame {
            wire::ServerFrame::ConversationInit {
                conversation_initiation_metadata_event: event,
            } => {
                let meta = ConversationMeta::from(event);
                tracing::info!(
                    conversation_id = %meta.conversation_id,
                    agent_rate = meta.agent_sample_rate,
                    input_rate = meta.input_sample_rate,
                    "Conversation initiated"
                );
                TransportEvent::Connected(meta)
            }
            wire::ServerFrame::Audio { audio_event } => {
                match base64::engine::general_purpose::STANDARD
                    .decode(&audio_event.audio_base_64)
                {
                    Ok(pcm) => TransportEvent::Audio(pcm),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to decode agent audio payload");
                        return Ok(());
                    }
                }
            }
            wire::ServerFrame::UserTranscript {
                user_transcription_event,
            } => TransportEvent::UserTranscript(user_transcription_event.user_transcript),
            wire::ServerFrame::AgentResponse {
                agent_response_event,
            } => TransportEvent::AgentResponse(agent_response_event.agent_response),
            wire::ServerFrame::VadScore { vad_score_event } => {
                TransportEvent::VadScore(vad_score_event.vad_score)
            }
            wire::ServerFrame::Interruption { .. } => TransportEvent::Interrupted,
            wire::ServerFrame::Ping { ping_event } => {
                // Answer in-band pings immediately; best effort.
                if let Ok(json) = serde_json::to_string(&wire::build_pong(ping_event.event_id)) {
                    let _ = outbound_tx.try_send(OutboundFrame::Json(json));
                }
                return Ok(());
            }
            wire::ServerFrame::Unknown => {
                tracing::debug!(len = text.len(), "Ignoring unknown frame type");
                return Ok(());
            }
        };

        event_tx.send(event).await.map_err(|_| ())
    }
}

#[async_trait]
impl Transport for TransportClient {
    async fn connect(&self, params: ConnectParams) -> VoxResult<mpsc::Receiver<TransportEvent>> {
        if self.is_connected() {
            return Err(VoxError::TransportError(
                "transport is already connected".into(),
            ));
        }
        if params.agent_id.is_empty() {
            return Err(VoxError::InvalidConfig("agent id must not be empty".into()));
        }

        let url = self.resolve_ws_url(&params).await?;
        tracing::info!(agent_id = %params.agent_id, "Connecting to voice-agent endpoint");

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (ws_stream, _response) =
            match tokio::time::timeout(self.config.connect_timeout, connect).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    // A stale signed URL is the usual culprit; drop it so
                    // the next attempt mints a fresh one.
                    *self.signed.lock() = None;
                    return Err(VoxError::ConnectFailure(e.to_string()));
                }
                Err(_) => {
                    *self.signed.lock() = None;
                    return Err(VoxError::ConnectFailure(format!(
                        "handshake timed out after {:?}",
                        self.config.connect_timeout
                    )));
                }
            };

        let (sink, stream) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let (event_tx, event_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::outbound_loop(
            outbound_rx,
            sink,
            cancel.clone(),
            self.config.keepalive_interval,
            Arc::clone(&connected),
        ));
        tokio::spawn(Self::inbound_loop(
            stream,
            event_tx,
            outbound_tx.clone(),
            cancel.clone(),
            Arc::clone(&connected),
        ));

        *self.conn.lock() = Some(Conn {
            outbound_tx,
            cancel,
            connected,
            initial_sent: Arc::new(AtomicBool::new(false)),
        });

        Ok(event_rx)
    }

    async fn send_initial_message(&self, text: &str) -> VoxResult<()> {
        let (outbound_tx, initial_sent) = {
            let guard = self.conn.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| VoxError::TransportError("not connected".into()))?;
            (conn.outbound_tx.clone(), Arc::clone(&conn.initial_sent))
        };

        if initial_sent.swap(true, Ordering::SeqCst) {
            return Err(VoxError::TransportError(
                "conversation initiation already sent".into(),
            ));
        }

        let message = if text.is_empty() { None } else { Some(text) };
        let json = serde_json::to_string(&wire::build_conversation_init(message))
            .map_err(|e| VoxError::TransportError(e.to_string()))?;
        outbound_tx
            .send(OutboundFrame::Json(json))
            .await
            .map_err(|_| VoxError::TransportError("outbound channel closed".into()))
    }

    fn stream_audio(&self, frame: &AudioFrame) -> VoxResult<SendStatus> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| VoxError::TransportError("not connected".into()))?;
        if !conn.connected.load(Ordering::SeqCst) {
            return Err(VoxError::TransportError("not connected".into()));
        }

        let chunk = wire::build_audio_chunk(&frame.to_le_bytes());
        let json = serde_json::to_string(&chunk)
            .map_err(|e| VoxError::TransportError(e.to_string()))?;

        match conn.outbound_tx.try_send(OutboundFrame::Json(json)) {
            Ok(()) => Ok(SendStatus::Sent),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(SendStatus::NotReady),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VoxError::TransportError("outbound channel closed".into()))
            }
        }
    }

    async fn close(&self) {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            let _ = conn.outbound_tx.try_send(OutboundFrame::Close);
            conn.cancel.cancel();
            conn.connected.store(false, Ordering::SeqCst);
            tracing::debug!("Transport closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .as_ref()
            .map(|conn| conn.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

// ── Caller-driven backoff ──────────────────────────────────────────

/// Exponential delay helper for the automation layer's retry loop.
///
/// The transport itself never sleeps on this: the caller asks for the next
/// delay before invoking `start` again, and resets after a successful
/// session.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2.0,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let millis =
            self.base.as_millis() as f64 * self.factor.powi(self.attempt as i32 - 1);
        let capped = millis.min(self.max.as_millis() as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Forget accumulated attempts after a successful session.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ── Tests ──────────────────────────────────────────────────────────
