//! Session controller: the lifecycle state machine and its orchestration.
//!
//! Ties together:
//! - [`Transport`] for the streaming link to the remote agent
//! - [`AudioRouter`] for exclusive microphone/speaker routing
//! - [`EventDispatcher`] for lifecycle fan-out to the host automation
//!
//! ## Architecture
//!
//! ```text
//! host ──start/stop──▸ SessionController ──connect/audio──▸ Transport ──▸ agent
//!                            │  ▴                               │
//!                  route_for │  └── TransportEvent pump ◂───────┘
//!                            ▾
//!                       AudioRouter ──▸ devices        EventDispatcher ──▸ host
//! ```
//!
//! A session runs as three background tasks:
//! 1. **Connect driver + event pump**: performs the connect, sends the
//!    conversation initiation, then translates transport events into
//!    state transitions.
//! 2. **Watchdog**: enforces the activity timeout and the reply settle
//!    window.
//! 3. **Capture loop**: polls microphone frames and streams them out,
//!    dropping frames on backpressure instead of blocking.
//!
//! Every transition publishes exactly one lifecycle event, synchronously,
//! under a dispatch gate; a per-session generation counter guarantees that
//! nothing fires after a session's Ended event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioFrame, AudioRouter};
use crate::error::{VoxError, VoxResult};
use crate::events::{EventDispatcher, LifecycleEvent};
use crate::session::{Deferred, SessionState};
use crate::transport::{
    ConnectParams, ConversationMeta, SendStatus, Transport, TransportEvent,
};

// ── Start options ──────────────────────────────────────────────────

/// Parameters for one `start` invocation.
///
/// All values may be deferred; each is resolved exactly once when `start`
/// runs.
#[derive(Clone)]
pub struct StartOptions {
    /// Identifier of the remote conversational agent.
    pub agent_id: Deferred<String>,
    /// Optional API credential. Sensitive: never logged.
    pub credential: Option<Deferred<String>>,
    /// Optional message the agent speaks first.
    pub initial_message: Option<Deferred<String>>,
    /// Optional activity timeout; `None` disables the watchdog deadline.
    pub timeout: Option<Deferred<Duration>>,
}

impl StartOptions {
    pub fn new(agent_id: impl Into<Deferred<String>>) -> Self {
        Self {
            agent_id: agent_id.into(),
            credential: None,
            initial_message: None,
            timeout: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<Deferred<String>>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_initial_message(mut self, message: impl Into<Deferred<String>>) -> Self {
        self.initial_message = Some(message.into());
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<Deferred<Duration>>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }
}

impl std::fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartOptions")
            .field("agent_id", &self.agent_id)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("initial_message", &self.initial_message)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ── Settings and status ────────────────────────────────────────────

/// Timing tunables for the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Watchdog tick for timeout and settle checks.
    pub watchdog_interval: Duration,
    /// Poll interval of the microphone capture loop.
    pub capture_interval: Duration,
    /// Silence after the last agent audio frame before returning to
    /// Listening.
    pub reply_settle: Duration,
    /// Remote VAD score above which the user counts as speaking.
    pub vad_threshold: f32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            watchdog_interval: Duration::from_millis(100),
            capture_interval: Duration::from_millis(20),
            reply_settle: Duration::from_millis(500),
            vad_threshold: 0.25,
        }
    }
}

/// Snapshot of the active session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: String,
    pub agent_id: String,
    pub state: SessionState,
    pub conversation_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

// ── Controller internals ───────────────────────────────────────────

struct ActiveSession {
    id: String,
    agent_id: String,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
    meta: Option<ConversationMeta>,
    cancel: CancellationToken,
    last_activity: Instant,
    last_agent_audio: Option<Instant>,
    last_vad: f32,
}

struct Inner {
    state: SessionState,
    /// Bumped on every start/stop/error; tasks carry the generation they
    /// were spawned for and stale ones fall silent.
    generation: u64,
    session: Option<ActiveSession>,
}

struct Core {
    dispatcher: Arc<EventDispatcher>,
    router: Arc<AudioRouter>,
    transport: Arc<dyn Transport>,
    settings: ControllerSettings,
    inner: Mutex<Inner>,
    /// Serializes [state change + publish] pairs so listeners observe
    /// transitions in the exact order they occur.
    publish_gate: Mutex<()>,
}

impl Core {
    fn gen_current(&self, gen: u64) -> bool {
        self.inner.lock().generation == gen
    }

    fn touch_activity(&self, gen: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == gen {
            if let Some(session) = inner.session.as_mut() {
                session.last_activity = Instant::now();
            }
        }
    }

    fn mark_agent_audio(&self, gen: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == gen {
            if let Some(session) = inner.session.as_mut() {
                session.last_agent_audio = Some(Instant::now());
            }
        }
    }

    /// Apply a mid-session transition and publish its event.
    ///
    /// Returns false (and does nothing) for stale generations, non-running
    /// states, and self-transitions.
    fn transition(&self, gen: u64, to: SessionState, event: LifecycleEvent) -> bool {
        let _gate = self.publish_gate.lock();
        let from = {
            let mut inner = self.inner.lock();
            if inner.generation != gen || !inner.state.is_running() || inner.state == to {
                return false;
            }
            let from = inner.state;
            inner.state = to;
            from
        };
        self.router.route_for(to);
        tracing::info!(from = from.as_str(), to = to.as_str(), "Session state changed");
        self.dispatcher.publish(&event);
        true
    }

    /// Terminal failure: release everything, rest in Error, publish once.
    async fn fail(&self, gen: u64, err: VoxError) {
        let cancel = {
            let _gate = self.publish_gate.lock();
            let cancel = {
                let mut inner = self.inner.lock();
                if inner.generation != gen || !inner.state.is_running() {
                    return;
                }
                inner.generation += 1;
                inner.state = SessionState::Error;
                inner.session.take().map(|s| s.cancel)
            };
            self.router.route_for(SessionState::Error);
            tracing::error!(error = %err, "Session failed");
            self.dispatcher.publish(&LifecycleEvent::Error(err.to_string()));
            cancel
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.transport.close().await;
        self.router.release_all();
    }

    /// Return to Idle and publish Ended.
    ///
    /// With `required_gen`, only the matching session is ended (remote
    /// disconnects); without it any non-idle session is (host `stop`).
    async fn end_session(&self, required_gen: Option<u64>) {
        let cancel = {
            let _gate = self.publish_gate.lock();
            let cancel = {
                let mut inner = self.inner.lock();
                if inner.state == SessionState::Idle {
                    return;
                }
                if let Some(gen) = required_gen {
                    if inner.generation != gen {
                        return;
                    }
                }
                inner.generation += 1;
                inner.state = SessionState::Idle;
                inner.session.take().map(|s| s.cancel)
            };
            self.router.route_for(SessionState::Idle);
            self.dispatcher.publish(&LifecycleEvent::Ended);
            cancel
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.transport.close().await;
        self.router.release_all();
    }

    // ── Background tasks ──────────────────────────────────────────

    /// Connect, send the conversation initiation, then pump transport
    /// events until the session ends.
    async fn run_connect(
        self: Arc<Self>,
        gen: u64,
        params: ConnectParams,
        initial_message: Option<String>,
    ) {
        let mut events = match self.transport.connect(params).await {
            Ok(events) => events,
            Err(err) => {
                self.fail(gen, err).await;
                return;
            }
        };

        // The host may have stopped the session while the handshake ran.
        if !self.gen_current(gen) {
            self.transport.close().await;
            return;
        }

        let greeting = initial_message.as_deref().unwrap_or("");
        if let Err(err) = self.transport.send_initial_message(greeting).await {
            self.fail(gen, err).await;
            return;
        }
        self.touch_activity(gen);

        let cancel = {
            let inner = self.inner.lock();
            match inner.session.as_ref() {
                Some(session) if inner.generation == gen => session.cancel.clone(),
                _ => return,
            }
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_transport_event(gen, event).await;
            if !self.gen_current(gen) {
                break;
            }
        }
        tracing::debug!("Transport event pump terminated");
    }

    async fn handle_transport_event(&self, gen: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected(meta) => {
                self.touch_activity(gen);
                let from_starting = {
                    let mut inner = self.inner.lock();
                    if inner.generation != gen {
                        return;
                    }
                    if let Some(session) = inner.session.as_mut() {
                        session.meta = Some(meta);
                    }
                    inner.state == SessionState::Starting
                };
                if from_starting {
                    self.transition(gen, SessionState::Listening, LifecycleEvent::Listening);
                }
            }

            TransportEvent::Audio(pcm) => {
                self.touch_activity(gen);
                self.mark_agent_audio(gen);

                let (state, sample_rate) = {
                    let inner = self.inner.lock();
                    if inner.generation != gen {
                        return;
                    }
                    let rate = inner
                        .session
                        .as_ref()
                        .and_then(|s| s.meta.as_ref())
                        .map(|m| m.agent_sample_rate)
                        .unwrap_or(crate::transport::wire::DEFAULT_SAMPLE_RATE);
                    (inner.state, rate)
                };

                // Strict ordering: a reply cannot precede Listening.
                if state == SessionState::Starting {
                    tracing::debug!("Agent audio before conversation metadata, dropping");
                    return;
                }
                if matches!(state, SessionState::Listening | SessionState::Processing) {
                    self.transition(gen, SessionState::Replying, LifecycleEvent::Replying);
                }

                let frame = AudioFrame::from_le_bytes(sample_rate, &pcm);
                if let Err(err) = self.router.write_agent_audio(&frame).await {
                    tracing::warn!(error = %err, "Failed to play agent audio frame");
                }
            }

            TransportEvent::VadScore(score) => {
                let (state, last) = {
                    let mut inner = self.inner.lock();
                    if inner.generation != gen {
                        return;
                    }
                    let last = match inner.session.as_mut() {
                        Some(session) => {
                            let last = session.last_vad;
                            session.last_vad = score;
                            last
                        }
                        None => return,
                    };
                    (inner.state, last)
                };

                // Remote VAD is meaningless while the agent itself speaks.
                if state == SessionState::Replying {
                    return;
                }

                let threshold = self.settings.vad_threshold;
                if score > threshold && last <= threshold {
                    self.transition(gen, SessionState::Listening, LifecycleEvent::Listening);
                } else if score <= threshold && last > threshold {
                    self.transition(gen, SessionState::Processing, LifecycleEvent::Processing);
                }
            }

            TransportEvent::UserTranscript(text) => {
                self.touch_activity(gen);
                tracing::info!(text = %text, "User transcript");
            }

            TransportEvent::AgentResponse(text) => {
                self.touch_activity(gen);
                tracing::info!(text = %text, "Agent response");
            }

            TransportEvent::Interrupted => {
                tracing::info!("User interrupted the agent reply");
            }

            TransportEvent::Error(message) => {
                self.fail(gen, VoxError::TransportError(message)).await;
            }

            TransportEvent::Disconnected => {
                tracing::info!("Remote endpoint ended the session");
                self.end_session(Some(gen)).await;
            }
        }
    }

    /// Watchdog: activity timeout plus the reply settle window.
    async fn watchdog(self: Arc<Self>, gen: u64, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.watchdog_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (timed_out, settle_due) = {
                let inner = self.inner.lock();
                if inner.generation != gen {
                    return;
                }
                match inner.session.as_ref() {
                    None => return,
                    Some(session) => {
                        let timed_out = session
                            .timeout
                            .map(|t| session.last_activity.elapsed() >= t)
                            .unwrap_or(false);
                        let settle_due = inner.state == SessionState::Replying
                            && session
                                .last_agent_audio
                                .map(|at| at.elapsed() >= self.settings.reply_settle)
                                .unwrap_or(false);
                        (timed_out, settle_due)
                    }
                }
            };

            if timed_out {
                self.fail(gen, VoxError::Timeout).await;
                return;
            }
            if settle_due {
                // The reply finished playing; hand the floor back.
                self.transition(gen, SessionState::Listening, LifecycleEvent::Listening);
            }
        }
    }

    /// Capture loop: poll microphone frames and stream them out.
    ///
    /// The router yields frames only while the Listening route is live,
    /// and a full outbound queue drops the frame rather than blocking.
    async fn capture_loop(self: Arc<Self>, gen: u64, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.capture_interval) => {}
            }
            if !self.gen_current(gen) {
                break;
            }

            loop {
                match self.router.read_input_frame().await {
                    Ok(Some(frame)) => match self.transport.stream_audio(&frame) {
                        Ok(SendStatus::Sent) => self.touch_activity(gen),
                        Ok(SendStatus::NotReady) => {
                            tracing::debug!("Outbound audio queue full, dropping frame");
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "Audio send skipped");
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "Microphone read failed");
                        break;
                    }
                }
            }
        }
        tracing::debug!("Capture loop terminated");
    }
}

// ── Controller ─────────────────────────────────────────────────────

/// Owns the single session of one voice-agent component.
///
/// Collaborators are injected at construction; the controller never builds
/// its own transport or router.
pub struct SessionController {
    core: Arc<Core>,
}

impl SessionController {
    pub fn new(
        dispatcher: Arc<EventDispatcher>,
        router: Arc<AudioRouter>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_settings(dispatcher, router, transport, ControllerSettings::default())
    }

    pub fn with_settings(
        dispatcher: Arc<EventDispatcher>,
        router: Arc<AudioRouter>,
        transport: Arc<dyn Transport>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                dispatcher,
                router,
                transport,
                settings,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    generation: 0,
                    session: None,
                }),
                publish_gate: Mutex::new(()),
            }),
        }
    }

    /// Start a session.
    ///
    /// Deferred options are resolved exactly once here. Fails with
    /// `InvalidConfig` for an empty agent id, `DeviceUnavailable` when no
    /// input device is bound, and `AlreadyRunning` while a session is
    /// active (the running session is left untouched). On acceptance the
    /// Started event is published before this returns and the transport
    /// connect proceeds in the background.
    pub async fn start(&self, opts: StartOptions) -> VoxResult<()> {
        let agent_id = opts.agent_id.resolve();
        let credential = opts.credential.as_ref().map(Deferred::resolve);
        let initial_message = opts.initial_message.as_ref().map(Deferred::resolve);
        let timeout = opts.timeout.as_ref().map(Deferred::resolve);

        if agent_id.trim().is_empty() {
            return Err(VoxError::InvalidConfig("agent id must not be empty".into()));
        }
        if !self.core.router.has_input() {
            return Err(VoxError::DeviceUnavailable(
                "no input device bound; bind a microphone before starting".into(),
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let (gen, cancel) = {
            let _gate = self.core.publish_gate.lock();
            let (gen, cancel) = {
                let mut inner = self.core.inner.lock();
                if inner.state.is_running() {
                    return Err(VoxError::AlreadyRunning);
                }
                inner.generation += 1;
                let cancel = CancellationToken::new();
                inner.session = Some(ActiveSession {
                    id: session_id.clone(),
                    agent_id: agent_id.clone(),
                    started_at: Utc::now(),
                    timeout,
                    meta: None,
                    cancel: cancel.clone(),
                    last_activity: Instant::now(),
                    last_agent_audio: None,
                    last_vad: 0.0,
                });
                inner.state = SessionState::Starting;
                (inner.generation, cancel)
            };
            self.core.router.route_for(SessionState::Starting);
            self.core.dispatcher.publish(&LifecycleEvent::Started);
            (gen, cancel)
        };

        tracing::info!(
            session_id = %session_id,
            agent_id = %agent_id,
            timeout = ?timeout,
            "Session starting"
        );

        let params = ConnectParams {
            agent_id,
            credential,
        };
        tokio::spawn(Arc::clone(&self.core).run_connect(gen, params, initial_message));
        tokio::spawn(Arc::clone(&self.core).watchdog(gen, cancel.clone()));
        tokio::spawn(Arc::clone(&self.core).capture_loop(gen, cancel));

        Ok(())
    }

    /// Stop the session: cancel in-flight work, close the transport,
    /// release audio devices, and publish Ended.
    ///
    /// Valid from any state except Idle, where it is a no-op; also the way
    /// out of the Error resting state. No event of the stopped session
    /// fires after the Ended event published here.
    pub async fn stop(&self) {
        self.core.end_session(None).await;
    }

    /// True for any state other than Idle/Error.
    pub fn is_running(&self) -> bool {
        self.core.inner.lock().state.is_running()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.core.inner.lock().state
    }

    /// Snapshot of the active session, `None` when idle or errored.
    pub fn status(&self) -> Option<SessionStatus> {
        let inner = self.core.inner.lock();
        inner.session.as_ref().map(|session| SessionStatus {
            id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            state: inner.state,
            conversation_id: session.meta.as_ref().map(|m| m.conversation_id.clone()),
            started_at: session.started_at,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBackend, DeviceId, LoopbackBackend, OutputRole};
    use crate::events::EventKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // Scripted transport: tests push events through `push`.
    struct MockTransport {
        event_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        pending: Mutex<Vec<TransportEvent>>,
        connected: AtomicBool,
        refuse_connect: AtomicBool,
        closes: AtomicUsize,
        initial_messages: Mutex<Vec<String>>,
        streamed_frames: AtomicUsize,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                event_tx: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                refuse_connect: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
                initial_messages: Mutex::new(Vec::new()),
                streamed_frames: AtomicUsize::new(0),
            })
        }

        fn refusing() -> Arc<Self> {
            let mock = Self::new();
            mock.refuse_connect.store(true, Ordering::SeqCst);
            mock
        }

        async fn push(&self, event: TransportEvent) {
            // Before `connect` has run the event pump has no channel yet;
            // buffer such events and flush them once the link is up so a
            // test that pushes immediately after `start` is not racing the
            // background connect.
            let tx = self.event_tx.lock().clone();
            match tx {
                Some(tx) => {
                    let _ = tx.send(event).await;
                }
                None => self.pending.lock().push(event),
            }
        }

        fn meta() -> ConversationMeta {
            ConversationMeta {
                conversation_id: "conv-1".into(),
                agent_sample_rate: 16_000,
                input_sample_rate: 16_000,
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(
            &self,
            _params: ConnectParams,
        ) -> VoxResult<mpsc::Receiver<TransportEvent>> {
            if self.refuse_connect.load(Ordering::SeqCst) {
                return Err(VoxError::ConnectFailure("endpoint refused".into()));
            }
            let (tx, rx) = mpsc::channel(64);
            // Deliver anything pushed before the link came up, in order.
            let buffered: Vec<TransportEvent> = self.pending.lock().drain(..).collect();
            for event in buffered {
                let _ = tx.send(event).await;
            }
            *self.event_tx.lock() = Some(tx);
            self.connected.store(true, Ordering::SeqCst);
            Ok(rx)
        }

        async fn send_initial_message(&self, text: &str) -> VoxResult<()> {
            self.initial_messages.lock().push(text.to_string());
            Ok(())
        }

        fn stream_audio(&self, _frame: &AudioFrame) -> VoxResult<SendStatus> {
            self.streamed_frames.fetch_add(1, Ordering::SeqCst);
            Ok(SendStatus::Sent)
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            // The sender is kept so tests can verify that late events
            // never reach the host.
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn recording_dispatcher() -> (Arc<EventDispatcher>, Arc<Mutex<Vec<LifecycleEvent>>>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::all() {
            let events = Arc::clone(&events);
            dispatcher.subscribe(*kind, move |event| events.lock().push(event.clone()));
        }
        (dispatcher, events)
    }

    fn fast_settings() -> ControllerSettings {
        ControllerSettings {
            watchdog_interval: Duration::from_millis(5),
            capture_interval: Duration::from_millis(5),
            reply_settle: Duration::from_millis(30),
            vad_threshold: 0.25,
        }
    }

    struct Harness {
        controller: SessionController,
        events: Arc<Mutex<Vec<LifecycleEvent>>>,
        backend: Arc<LoopbackBackend>,
        transport: Arc<MockTransport>,
    }

    impl Harness {
        fn new(transport: Arc<MockTransport>) -> Self {
            let backend = Arc::new(LoopbackBackend::new());
            let router = Arc::new(AudioRouter::new(
                Arc::clone(&backend) as Arc<dyn AudioBackend>
            ));
            router.bind_input(&DeviceId::new("mic0")).unwrap();
            router
                .bind_output(OutputRole::Agent, &DeviceId::new("spk0"))
                .unwrap();

            let (dispatcher, events) = recording_dispatcher();
            let controller = SessionController::with_settings(
                dispatcher,
                router,
                Arc::clone(&transport) as Arc<dyn Transport>,
                fast_settings(),
            );
            Self {
                controller,
                events,
                backend,
                transport,
            }
        }

        fn count(&self, kind: EventKind) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.kind() == kind)
                .count()
        }

        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
    }

    fn opts(agent_id: &str) -> StartOptions {
        StartOptions::new(agent_id)
    }

    #[tokio::test]
    async fn start_then_stop_yields_one_started_one_ended() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        h.controller.stop().await;
        h.settle().await;

        assert_eq!(h.count(EventKind::Started), 1);
        assert_eq!(h.count(EventKind::Ended), 1);
        assert_eq!(h.count(EventKind::Error), 0);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.controller.is_running());
    }

    #[tokio::test]
    async fn start_while_running_is_rejected() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        let state_before = h.controller.state();

        let result = h.controller.start(opts("other")).await;
        assert!(matches!(result, Err(VoxError::AlreadyRunning)));
        assert_eq!(h.controller.state(), state_before);
        assert_eq!(h.count(EventKind::Started), 1);
    }

    #[tokio::test]
    async fn empty_agent_id_is_invalid_config() {
        let h = Harness::new(MockTransport::new());

        let result = h.controller.start(opts("")).await;
        assert!(matches!(result, Err(VoxError::InvalidConfig(_))));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.events.lock().is_empty());
    }

    #[tokio::test]
    async fn start_requires_bound_input() {
        let backend = Arc::new(LoopbackBackend::new());
        let router = Arc::new(AudioRouter::new(backend as Arc<dyn AudioBackend>));
        let (dispatcher, events) = recording_dispatcher();
        let controller = SessionController::with_settings(
            dispatcher,
            router,
            MockTransport::new() as Arc<dyn Transport>,
            fast_settings(),
        );

        let result = controller.start(opts("abc")).await;
        assert!(matches!(result, Err(VoxError::DeviceUnavailable(_))));
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn timeout_emits_error_exactly_once() {
        let h = Harness::new(MockTransport::new());

        h.controller
            .start(opts("abc").with_timeout(Duration::from_millis(50)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let errors: Vec<_> = h
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Error(message) => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["timeout".to_string()]);
        assert_eq!(h.controller.state(), SessionState::Error);
        assert!(!h.controller.is_running());
        assert!(h.transport.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn scenario_start_listen_stop() {
        let h = Harness::new(MockTransport::new());

        h.controller
            .start(
                opts("abc")
                    .with_timeout(Duration::from_secs(10))
                    .with_initial_message("hello there"),
            )
            .await
            .unwrap();
        h.settle().await;

        assert_eq!(h.transport.initial_messages.lock().as_slice(), ["hello there"]);

        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        assert_eq!(h.controller.state(), SessionState::Listening);
        let observed: Vec<_> = h.events.lock().clone();
        assert_eq!(
            observed,
            vec![LifecycleEvent::Started, LifecycleEvent::Listening]
        );

        h.controller.stop().await;
        h.settle().await;

        assert_eq!(h.count(EventKind::Ended), 1);
        assert!(!h.controller.is_running());
    }

    #[tokio::test]
    async fn agent_audio_drives_replying_then_settles_back() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        let pcm = AudioFrame::new(16_000, vec![5; 160]).to_le_bytes();
        h.transport.push(TransportEvent::Audio(pcm)).await;
        h.settle().await;

        // Reply played through the agent output, then the settle window
        // handed the floor back to the user.
        assert_eq!(h.count(EventKind::Replying), 1);
        assert_eq!(h.backend.drain_output(&DeviceId::new("spk0")).len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.controller.state(), SessionState::Listening);

        let observed: Vec<_> = h.events.lock().clone();
        assert_eq!(
            observed,
            vec![
                LifecycleEvent::Started,
                LifecycleEvent::Listening,
                LifecycleEvent::Replying,
                LifecycleEvent::Listening,
            ]
        );
    }

    #[tokio::test]
    async fn vad_scores_toggle_listening_and_processing() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        // Rising edge while already Listening: no duplicate event.
        h.transport.push(TransportEvent::VadScore(0.8)).await;
        h.settle().await;
        assert_eq!(h.count(EventKind::Listening), 1);

        // Falling edge: the user finished speaking.
        h.transport.push(TransportEvent::VadScore(0.1)).await;
        h.settle().await;
        assert_eq!(h.controller.state(), SessionState::Processing);

        // Rising edge again: the user resumed.
        h.transport.push(TransportEvent::VadScore(0.9)).await;
        h.settle().await;
        assert_eq!(h.controller.state(), SessionState::Listening);
        assert_eq!(h.count(EventKind::Processing), 1);
        assert_eq!(h.count(EventKind::Listening), 2);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_error_and_allows_restart() {
        let h = Harness::new(MockTransport::refusing());

        h.controller.start(opts("abc")).await.unwrap();
        h.settle().await;

        assert_eq!(h.controller.state(), SessionState::Error);
        assert_eq!(h.count(EventKind::Error), 1);

        // Retry is the automation layer's decision; no intervening stop
        // is required.
        h.transport.refuse_connect.store(false, Ordering::SeqCst);
        h.controller.start(opts("abc")).await.unwrap();
        assert!(h.controller.is_running());
        assert_eq!(h.count(EventKind::Started), 2);
    }

    #[tokio::test]
    async fn transport_error_mid_stream_fails_session() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        h.transport
            .push(TransportEvent::Error("stream reset".into()))
            .await;
        h.settle().await;

        assert_eq!(h.controller.state(), SessionState::Error);
        let errors = h.count(EventKind::Error);
        assert_eq!(errors, 1);
        assert!(h
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Error(m) if m.contains("stream reset"))));
    }

    #[tokio::test]
    async fn remote_disconnect_behaves_like_stop() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        h.transport.push(TransportEvent::Disconnected).await;
        h.settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.count(EventKind::Ended), 1);
        assert_eq!(h.count(EventKind::Error), 0);
    }

    #[tokio::test]
    async fn no_events_after_ended() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        h.controller.stop().await;
        h.settle().await;

        // Late transport events from the dead session must fall silent.
        h.transport
            .push(TransportEvent::Audio(vec![0u8; 320]))
            .await;
        h.transport.push(TransportEvent::VadScore(0.9)).await;
        h.transport
            .push(TransportEvent::Error("late failure".into()))
            .await;
        h.settle().await;

        let observed = h.events.lock().clone();
        assert_eq!(observed.last(), Some(&LifecycleEvent::Ended));
        assert_eq!(h.count(EventKind::Error), 0);
        assert_eq!(h.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn stop_from_idle_is_a_quiet_noop() {
        let h = Harness::new(MockTransport::new());
        h.controller.stop().await;
        assert!(h.events.lock().is_empty());
    }

    #[tokio::test]
    async fn microphone_frames_are_streamed_while_listening() {
        let h = Harness::new(MockTransport::new());

        h.controller.start(opts("abc")).await.unwrap();
        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        for _ in 0..3 {
            h.backend
                .feed_input(&DeviceId::new("mic0"), AudioFrame::new(16_000, vec![1; 320]));
        }
        h.settle().await;

        assert!(h.transport.streamed_frames.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn deferred_options_resolve_exactly_once() {
        let h = Harness::new(MockTransport::new());
        let resolutions = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&resolutions);
        let agent_id = Deferred::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "abc".to_string()
        });

        h.controller
            .start(StartOptions::new(agent_id))
            .await
            .unwrap();
        h.settle().await;

        assert_eq!(resolutions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_reflects_active_session() {
        let h = Harness::new(MockTransport::new());
        assert!(h.controller.status().is_none());

        h.controller.start(opts("abc")).await.unwrap();
        h.transport
            .push(TransportEvent::Connected(MockTransport::meta()))
            .await;
        h.settle().await;

        let status = h.controller.status().unwrap();
        assert_eq!(status.agent_id, "abc");
        assert_eq!(status.state, SessionState::Listening);
        assert_eq!(status.conversation_id.as_deref(), Some("conv-1"));

        h.controller.stop().await;
        assert!(h.controller.status().is_none());
    }
}
