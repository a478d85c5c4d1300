//! Wire frames for the voice-agent streaming protocol.
//!
//! All frames are JSON text messages over the WebSocket. Audio payloads are
//! base64-encoded PCM16 inside JSON. Inbound frames carry a `type` tag;
//! the one exception on the outbound side is the user audio chunk, which is
//! a bare `{"user_audio_chunk": "<base64>"}` object.
//!
//! ## Frame inventory
//!
//! ```text
//! client ──▸ conversation_initiation_client_data   (once, after connect)
//! client ──▸ {"user_audio_chunk": ...}             (microphone stream)
//! client ──▸ ping / pong                           (keepalive both ways)
//! server ──▸ conversation_initiation_metadata      (conversation id + formats)
//! server ──▸ audio                                 (agent speech, base64)
//! server ──▸ user_transcript / agent_response      (text sidecar)
//! server ──▸ vad_score / interruption              (turn signals)
//! ```

use base64::Engine;
use serde::{Deserialize, Serialize};

// ── Inbound (server → client) ──────────────────────────────────────

/// A frame received from the agent endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "conversation_initiation_metadata")]
    ConversationInit {
        conversation_initiation_metadata_event: ConversationMetaEvent,
    },
    #[serde(rename = "audio")]
    Audio { audio_event: AudioEvent },
    #[serde(rename = "user_transcript")]
    UserTranscript {
        user_transcription_event: UserTranscriptEvent,
    },
    #[serde(rename = "agent_response")]
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    #[serde(rename = "vad_score")]
    VadScore { vad_score_event: VadScoreEvent },
    #[serde(rename = "interruption")]
    Interruption {
        #[serde(default)]
        interruption_event: Option<serde_json::Value>,
    },
    #[serde(rename = "ping")]
    Ping { ping_event: PingEvent },
    /// Frame types this client does not understand are logged and skipped.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationMetaEvent {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
    #[serde(default)]
    pub user_input_audio_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub event_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserTranscriptEvent {
    pub user_transcript: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VadScoreEvent {
    pub vad_score: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingEvent {
    pub event_id: u64,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

/// Parse one inbound text frame.
pub fn parse_server_frame(text: &str) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_str(text)
}

// ── Conversation metadata ──────────────────────────────────────────

/// Negotiated conversation parameters, retained for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMeta {
    pub conversation_id: String,
    /// Sample rate of agent speech frames.
    pub agent_sample_rate: u32,
    /// Sample rate the endpoint expects for user audio.
    pub input_sample_rate: u32,
}

impl From<ConversationMetaEvent> for ConversationMeta {
    fn from(event: ConversationMetaEvent) -> Self {
        Self {
            conversation_id: event.conversation_id,
            agent_sample_rate: event
                .agent_output_audio_format
                .as_deref()
                .map(sample_rate_for_format)
                .unwrap_or(DEFAULT_SAMPLE_RATE),
            input_sample_rate: event
                .user_input_audio_format
                .as_deref()
                .map(sample_rate_for_format)
                .unwrap_or(DEFAULT_SAMPLE_RATE),
        }
    }
}

/// Sample rate assumed when the endpoint does not announce a format.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Map a `pcm_<rate>` format string to its sample rate.
///
/// Unrecognized formats fall back to [`DEFAULT_SAMPLE_RATE`].
pub fn sample_rate_for_format(format: &str) -> u32 {
    match format {
        "pcm_16000" => 16_000,
        "pcm_22050" => 22_050,
        "pcm_24000" => 24_000,
        "pcm_44100" => 44_100,
        "pcm_48000" => 48_000,
        other => {
            tracing::debug!(format = other, "Unknown audio format, assuming 16 kHz");
            DEFAULT_SAMPLE_RATE
        }
    }
}

// ── Outbound (client → server) ─────────────────────────────────────

/// First frame after connect: conversation setup with the optional
/// initial-message override.
#[derive(Debug, Serialize)]
pub struct ConversationInitFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    conversation_config_override: ConversationConfigOverride,
}

#[derive(Debug, Serialize)]
struct ConversationConfigOverride {
    agent: AgentOverride,
}

#[derive(Debug, Serialize)]
struct AgentOverride {
    first_message: String,
}

/// Build the conversation-initiation frame.
///
/// An absent initial message is sent as an empty override so the agent
/// opens with its configured greeting.
pub fn build_conversation_init(initial_message: Option<&str>) -> ConversationInitFrame {
    ConversationInitFrame {
        kind: "conversation_initiation_client_data",
        conversation_config_override: ConversationConfigOverride {
            agent: AgentOverride {
                first_message: initial_message.unwrap_or_default().to_string(),
            },
        },
    }
}

/// Microphone audio chunk: bare object, base64 PCM16 payload.
#[derive(Debug, Serialize)]
pub struct UserAudioChunkFrame {
    user_audio_chunk: String,
}

/// Encode raw PCM16 bytes into an audio chunk frame.
pub fn build_audio_chunk(pcm: &[u8]) -> UserAudioChunkFrame {
    UserAudioChunkFrame {
        user_audio_chunk: base64::engine::general_purpose::STANDARD.encode(pcm),
    }
}

/// Client keepalive ping.
#[derive(Debug, Serialize)]
pub struct ClientPingFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    ping_event: ClientPingEvent,
}

#[derive(Debug, Serialize)]
struct ClientPingEvent {
    event_id: u64,
    ping_ms: u64,
}

pub fn build_client_ping(event_id: u64, ping_ms: u64) -> ClientPingFrame {
    ClientPingFrame {
        kind: "ping",
        ping_event: ClientPingEvent { event_id, ping_ms },
    }
}

/// Reply to a server ping, echoing its event id.
#[derive(Debug, Serialize)]
pub struct PongFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    event_id: u64,
}

pub fn build_pong(event_id: u64) -> PongFrame {
    PongFrame {
        kind: "pong",
        event_id,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
