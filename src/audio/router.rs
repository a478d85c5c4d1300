//! Audio routing: who may capture or play audio at any given moment.
//!
//! The router owns the session's device bindings and enforces the exclusive
//! routing table: while the agent replies only the agent output is live,
//! while the user speaks only the microphone is live, and while the agent
//! thinks everything is muted. The activation output carries short start/end
//! cues only and is never live at the same time as the agent output.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::{AudioBackend, AudioFrame, DeviceHandle, DeviceId};
use crate::error::{VoxError, VoxResult};
use crate::session::SessionState;

// ── Roles and routes ───────────────────────────────────────────────

/// Role of an output device binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputRole {
    /// The agent's spoken replies.
    Agent,
    /// Short transient start/end cues.
    Activation,
}

impl OutputRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Activation => "activation",
        }
    }
}

/// Which audio paths are live. At most one output is ever active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub input_active: bool,
    pub active_output: Option<OutputRole>,
}

impl Route {
    /// Everything muted.
    pub const MUTED: Route = Route {
        input_active: false,
        active_output: None,
    };

    /// The deterministic state → route mapping.
    ///
    /// Listening: input live, outputs muted. Processing: all muted.
    /// Replying: agent output live, input muted. Every other state is
    /// fully muted.
    pub fn for_state(state: SessionState) -> Route {
        match state {
            SessionState::Listening => Route {
                input_active: true,
                active_output: None,
            },
            SessionState::Replying => Route {
                input_active: false,
                active_output: Some(OutputRole::Agent),
            },
            SessionState::Idle
            | SessionState::Starting
            | SessionState::Processing
            | SessionState::Error => Route::MUTED,
        }
    }
}

// ── Router ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Binding {
    device: DeviceId,
    handle: DeviceHandle,
}

#[derive(Default)]
struct RouterState {
    input: Option<Binding>,
    agent_output: Option<Binding>,
    activation_output: Option<Binding>,
    route: Option<Route>,
}

impl RouterState {
    fn output_mut(&mut self, role: OutputRole) -> &mut Option<Binding> {
        match role {
            OutputRole::Agent => &mut self.agent_output,
            OutputRole::Activation => &mut self.activation_output,
        }
    }
}

/// Binds the session's audio devices and multiplexes access to them.
///
/// All route switches happen under one lock, so observers never see a
/// partial routing state.
pub struct AudioRouter {
    backend: Arc<dyn AudioBackend>,
    state: Mutex<RouterState>,
}

impl AudioRouter {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Claim `device` as the capture input.
    ///
    /// Rebinding releases the previous input first. Fails with
    /// `DeviceUnavailable` if the backend refuses the claim.
    pub fn bind_input(&self, device: &DeviceId) -> VoxResult<()> {
        let handle = self.backend.claim(device)?;
        let previous = {
            let mut state = self.state.lock();
            state.input.replace(Binding {
                device: device.clone(),
                handle,
            })
        };
        self.release_binding(previous);
        tracing::debug!(device = %device, "Bound input device");
        Ok(())
    }

    /// Claim `device` as an output for the given role.
    pub fn bind_output(&self, role: OutputRole, device: &DeviceId) -> VoxResult<()> {
        let handle = self.backend.claim(device)?;
        let previous = {
            let mut state = self.state.lock();
            state.output_mut(role).replace(Binding {
                device: device.clone(),
                handle,
            })
        };
        self.release_binding(previous);
        tracing::debug!(role = role.as_str(), device = %device, "Bound output device");
        Ok(())
    }

    pub fn has_input(&self) -> bool {
        self.state.lock().input.is_some()
    }

    pub fn has_output(&self, role: OutputRole) -> bool {
        self.state.lock().output_mut(role).is_some()
    }

    /// Switch the live routes to match a session state.
    ///
    /// The switch is applied atomically under the router lock and the
    /// resulting route is returned. Routing to an output role with no
    /// binding leaves that path muted.
    pub fn route_for(&self, state: SessionState) -> Route {
        let mut wanted = Route::for_state(state);
        let mut guard = self.state.lock();

        if wanted.input_active && guard.input.is_none() {
            wanted.input_active = false;
        }
        if let Some(role) = wanted.active_output {
            if guard.output_mut(role).is_none() {
                wanted.active_output = None;
            }
        }

        guard.route = Some(wanted);
        drop(guard);

        tracing::trace!(state = state.as_str(), route = ?wanted, "Audio route switched");
        wanted
    }

    /// The route currently applied, fully muted before the first switch.
    pub fn current_route(&self) -> Route {
        self.state.lock().route.unwrap_or(Route::MUTED)
    }

    /// Play a short transient cue on the activation output.
    ///
    /// Refused while the agent output is live: the two outputs must never
    /// write at the same instant.
    pub async fn play_cue(&self, frame: &AudioFrame) -> VoxResult<()> {
        let handle = {
            let mut state = self.state.lock();
            if state.route.map(|r| r.active_output) == Some(Some(OutputRole::Agent)) {
                return Err(VoxError::DeviceUnavailable(
                    "agent output is active; activation cue refused".into(),
                ));
            }
            match state.output_mut(OutputRole::Activation).as_ref() {
                Some(binding) => binding.handle,
                None => {
                    return Err(VoxError::DeviceUnavailable(
                        "no activation output bound".into(),
                    ))
                }
            }
        };
        self.backend.write(handle, frame).await
    }

    /// Forward an agent audio frame to the agent output.
    ///
    /// Frames arriving while the agent route is not live (a reply that
    /// straggles past a transition) are dropped.
    pub async fn write_agent_audio(&self, frame: &AudioFrame) -> VoxResult<()> {
        let handle = {
            let mut state = self.state.lock();
            if state.route.map(|r| r.active_output) != Some(Some(OutputRole::Agent)) {
                tracing::debug!(
                    samples = frame.pcm.len(),
                    "Dropping agent audio frame; agent output not routed"
                );
                return Ok(());
            }
            match state.output_mut(OutputRole::Agent).as_ref() {
                Some(binding) => binding.handle,
                None => return Ok(()),
            }
        };
        self.backend.write(handle, frame).await
    }

    /// Poll one frame from the input device, `Ok(None)` while the input
    /// route is muted or nothing is buffered.
    pub async fn read_input_frame(&self) -> VoxResult<Option<AudioFrame>> {
        let handle = {
            let state = self.state.lock();
            if !state.route.map(|r| r.input_active).unwrap_or(false) {
                return Ok(None);
            }
            match state.input.as_ref() {
                Some(binding) => binding.handle,
                None => return Ok(None),
            }
        };
        self.backend.read(handle).await
    }

    /// Release every claimed device and mute all routes.
    ///
    /// Release failures are logged and ignored so `stop` always makes
    /// forward progress.
    pub fn release_all(&self) {
        let (input, agent, activation) = {
            let mut state = self.state.lock();
            state.route = Some(Route::MUTED);
            (
                state.input.take(),
                state.agent_output.take(),
                state.activation_output.take(),
            )
        };
        self.release_binding(input);
        self.release_binding(agent);
        self.release_binding(activation);
    }

    fn release_binding(&self, binding: Option<Binding>) {
        if let Some(binding) = binding {
            if let Err(err) = self.backend.release(binding.handle) {
                tracing::warn!(device = %binding.device, error = %err, "Failed to release audio device");
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
