//! Audio device abstraction, PCM frames, and capture conditioning.
//!
//! The platform audio subsystem is an external collaborator: voxwire only
//! ever talks to it through the narrow [`AudioBackend`] trait — claim a
//! device, read/write frames, release the device. The crate ships an
//! in-memory [`LoopbackBackend`] used by the CLI and the test suite;
//! production hosts implement the trait over their own audio stack.
//!
//! ## Design
//! - Devices are claimed exclusively: a second claim of the same device
//!   fails with `DeviceUnavailable` until the handle is released.
//! - Reads are polls: `Ok(None)` means no frame is buffered right now,
//!   so callers never block on a silent microphone.
//! - Capture conditioning (32→16-bit narrowing, stereo downmix) lives here
//!   as free functions so any backend can reuse it.

pub mod router;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{VoxError, VoxResult};

pub use router::{AudioRouter, OutputRole, Route};

// ── Devices and frames ─────────────────────────────────────────────

/// Identifier of an audio device understood by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token for a claimed device, issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// A fixed-size chunk of 16-bit mono PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Samples per second.
    pub sample_rate: u32,
    /// Signed 16-bit mono samples.
    pub pcm: Vec<i16>,
}

impl AudioFrame {
    pub fn new(sample_rate: u32, pcm: Vec<i16>) -> Self {
        Self { sample_rate, pcm }
    }

    /// Decode little-endian PCM16 bytes into a frame.
    ///
    /// A trailing odd byte is dropped, matching how capture hardware pads
    /// partial samples.
    pub fn from_le_bytes(sample_rate: u32, bytes: &[u8]) -> Self {
        let pcm = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { sample_rate, pcm }
    }

    /// Encode the frame as little-endian PCM16 bytes for the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pcm.len() * 2);
        for sample in &self.pcm {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    /// Playback duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.pcm.len() as u64 * 1000) / u64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}

// ── Capture conditioning ───────────────────────────────────────────

/// Narrow raw 32-bit little-endian samples to 16-bit by taking the high word.
///
/// Capture hardware that delivers 32-bit samples carries the useful signal
/// in the upper 16 bits. Trailing bytes that do not form a whole 32-bit
/// sample are dropped.
pub fn narrow_32bit_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(4)
        .map(|quad| {
            let wide = i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
            (wide >> 16) as i16
        })
        .collect()
}

/// Downmix interleaved stereo samples to mono by averaging each L/R pair.
///
/// An odd trailing sample is dropped. The sum is widened to `i32` before
/// halving so full-scale pairs cannot overflow.
pub fn downmix_stereo(samples: &[i16]) -> Vec<i16> {
    samples
        .chunks_exact(2)
        .map(|pair| {
            let sum = i32::from(pair[0]) + i32::from(pair[1]);
            (sum / 2) as i16
        })
        .collect()
}

// ── Backend trait ──────────────────────────────────────────────────

/// Narrow interface to the platform audio subsystem.
///
/// Claiming is non-blocking; reads and writes are the only operations that
/// may suspend.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Claim exclusive ownership of a device.
    fn claim(&self, device: &DeviceId) -> VoxResult<DeviceHandle>;

    /// Return a previously claimed device to the backend.
    fn release(&self, handle: DeviceHandle) -> VoxResult<()>;

    /// Write one frame to an output device.
    async fn write(&self, handle: DeviceHandle, frame: &AudioFrame) -> VoxResult<()>;

    /// Poll one frame from an input device. `Ok(None)` means nothing is
    /// buffered right now.
    async fn read(&self, handle: DeviceHandle) -> VoxResult<Option<AudioFrame>>;
}

// ── Loopback backend ───────────────────────────────────────────────

#[derive(Default)]
struct DeviceBuffers {
    /// Frames queued for `read` (fed by [`LoopbackBackend::feed_input`]).
    inbound: Vec<AudioFrame>,
    /// Frames received via `write` (drained by tests/demos).
    outbound: Vec<AudioFrame>,
}

#[derive(Default)]
struct LoopbackState {
    claimed: HashMap<DeviceId, DeviceHandle>,
    handles: HashMap<u64, (DeviceId, DeviceBuffers)>,
    next_handle: u64,
}

/// In-memory [`AudioBackend`] for tests and the demo CLI.
///
/// Frames written to a device accumulate until drained; frames fed to a
/// device are returned by subsequent reads in FIFO order.
#[derive(Default)]
pub struct LoopbackBackend {
    state: Mutex<LoopbackState>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame to be returned by the next `read` of `device`.
    ///
    /// Frames fed to a device nobody has claimed are discarded, the same
    /// way a real capture source keeps running with no consumer.
    pub fn feed_input(&self, device: &DeviceId, frame: AudioFrame) {
        let mut state = self.state.lock();
        if let Some(handle) = state.claimed.get(device).copied() {
            if let Some((_, buffers)) = state.handles.get_mut(&handle.0) {
                buffers.inbound.push(frame);
            }
        }
    }

    /// Drain every frame written to `device` so far.
    pub fn drain_output(&self, device: &DeviceId) -> Vec<AudioFrame> {
        let mut state = self.state.lock();
        match state.claimed.get(device).copied() {
            Some(handle) => state
                .handles
                .get_mut(&handle.0)
                .map(|(_, buffers)| std::mem::take(&mut buffers.outbound))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Whether a device is currently claimed.
    pub fn is_claimed(&self, device: &DeviceId) -> bool {
        self.state.lock().claimed.contains_key(device)
    }
}

#[async_trait]
impl AudioBackend for LoopbackBackend {
    fn claim(&self, device: &DeviceId) -> VoxResult<DeviceHandle> {
        let mut state = self.state.lock();
        if state.claimed.contains_key(device) {
            return Err(VoxError::DeviceUnavailable(format!(
                "{device} is already claimed"
            )));
        }
        state.next_handle += 1;
        let handle = DeviceHandle(state.next_handle);
        state.claimed.insert(device.clone(), handle);
        state
            .handles
            .insert(handle.0, (device.clone(), DeviceBuffers::default()));
        Ok(handle)
    }

    fn release(&self, handle: DeviceHandle) -> VoxResult<()> {
        let mut state = self.state.lock();
        match state.handles.remove(&handle.0) {
            Some((device, _)) => {
                state.claimed.remove(&device);
                Ok(())
            }
            None => Err(VoxError::DeviceUnavailable(format!(
                "unknown device handle {}",
                handle.0
            ))),
        }
    }

    async fn write(&self, handle: DeviceHandle, frame: &AudioFrame) -> VoxResult<()> {
        let mut state = self.state.lock();
        let (_, buffers) = state.handles.get_mut(&handle.0).ok_or_else(|| {
            VoxError::DeviceUnavailable(format!("unknown device handle {}", handle.0))
        })?;
        buffers.outbound.push(frame.clone());
        Ok(())
    }

    async fn read(&self, handle: DeviceHandle) -> VoxResult<Option<AudioFrame>> {
        let mut state = self.state.lock();
        let (_, buffers) = state.handles.get_mut(&handle.0).ok_or_else(|| {
            VoxError::DeviceUnavailable(format!("unknown device handle {}", handle.0))
        })?;
        if buffers.inbound.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buffers.inbound.remove(0)))
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
