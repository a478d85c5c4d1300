//! voxwire — bidirectional real-time voice-agent streaming sessions.
//!
//! Drives a conversational voice agent over a streaming WebSocket link:
//! lifecycle state machine, exclusive microphone/speaker routing, JSON +
//! base64 audio framing, and typed lifecycle-event fan-out to a host
//! automation framework.
//!
//! ## Design
//! - One session per [`SessionController`]; strict state ordering
//!   `Idle → Starting → Listening → Processing → Replying → Idle` with
//!   `Error` reachable from any non-idle state
//! - Collaborators injected at construction: the audio backend behind
//!   [`AudioRouter`], the network behind the [`Transport`] seam
//! - Every transition publishes exactly one [`LifecycleEvent`],
//!   synchronously and in order; nothing fires after a session's Ended
//! - No internal retries: failures surface once and the automation layer
//!   decides, with [`Backoff`] as the caller-driven delay helper
//!
//! ```text
//! host ──start/stop──▸ SessionController ──▸ TransportClient ──▸ agent
//!                            │                      │
//!                       AudioRouter ◂── audio ──────┘
//!                            │
//!                      EventDispatcher ──events──▸ host automation
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod transport;

pub use audio::{AudioBackend, AudioFrame, AudioRouter, DeviceId, LoopbackBackend, OutputRole};
pub use config::Config;
pub use error::{VoxError, VoxResult};
pub use events::{EventDispatcher, EventKind, LifecycleEvent};
pub use session::{
    ControllerSettings, Deferred, SessionController, SessionState, SessionStatus, StartOptions,
};
pub use transport::{
    Backoff, ConnectParams, ConversationMeta, SendStatus, Transport, TransportClient,
    TransportConfig, TransportEvent,
};
