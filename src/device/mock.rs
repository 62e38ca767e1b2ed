//! Scriptable device implementations for tests and hardware-free runs
//!
//! A [`MockProvider`] hands out capture sources and playback sinks whose
//! behavior is set up front: fixed payloads, injected faults, failed opens.
//! Shared state handles stay with the provider so tests can assert on what
//! the session did to the devices after the fact.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::{CaptureAuthority, CaptureSource, DeviceProvider, PlaybackSink};
use crate::error::DeviceError;

const EXHAUSTED_READ_PAUSE: Duration = Duration::from_millis(1);

/// Observable lifecycle counters for one mock device.
#[derive(Debug, Default)]
pub struct DeviceState {
    started: AtomicUsize,
    stopped: AtomicUsize,
    active: AtomicBool,
}

impl DeviceState {
    pub fn start_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn mark_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    fn mark_stopped(&self) -> bool {
        if self.active.swap(false, Ordering::SeqCst) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// Generate `samples` mono samples of a sine tone as 16-bit LE bytes.
pub fn sine_i16_bytes(freq_hz: f32, samples: usize, sample_rate: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples * 2);
    for n in 0..samples {
        let t = n as f32 / sample_rate as f32;
        let value = ((TAU * freq_hz * t).sin() * 0.5 * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Capture source fed by a script.
///
/// With a payload set, `read` drains it and then reports `Ok(0)` (after a
/// short pause, matching the bounded-blocking contract). Without one it
/// produces an endless 440 Hz tone.
pub struct MockCapture {
    state: Arc<DeviceState>,
    payload: Option<Vec<u8>>,
    cursor: usize,
    phase: usize,
    reads: usize,
    fail_on_start: bool,
    fail_after_reads: Option<usize>,
    preferred_chunk: Option<usize>,
    live: Option<Arc<AtomicUsize>>,
}

impl MockCapture {
    pub fn new() -> Self {
        Self {
            state: Arc::new(DeviceState::default()),
            payload: None,
            cursor: 0,
            phase: 0,
            reads: 0,
            fail_on_start: false,
            fail_after_reads: None,
            preferred_chunk: None,
            live: None,
        }
    }

    /// Serve exactly these bytes, then report exhaustion.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_on_start = true;
        self
    }

    /// Succeed `reads` times, then fail every read.
    pub fn failing_after_reads(mut self, reads: usize) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    pub fn with_preferred_chunk(mut self, bytes: usize) -> Self {
        self.preferred_chunk = Some(bytes);
        self
    }

    pub fn state(&self) -> Arc<DeviceState> {
        self.state.clone()
    }
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for MockCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.fail_on_start {
            return Err(DeviceError::InitFailed("injected capture start failure".into()));
        }
        if !self.state.is_active() {
            self.state.mark_started();
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.state.mark_stopped();
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if !self.state.is_active() {
            return Err(DeviceError::StateFailure("capture is not running".into()));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        self.reads += 1;
        if let Some(limit) = self.fail_after_reads {
            if self.reads > limit {
                return Err(DeviceError::StateFailure("injected capture fault".into()));
            }
        }

        match &self.payload {
            Some(payload) => {
                let remaining = payload.len() - self.cursor;
                if remaining == 0 {
                    thread::sleep(EXHAUSTED_READ_PAUSE);
                    return Ok(0);
                }
                let n = remaining.min(buf.len());
                buf[..n].copy_from_slice(&payload[self.cursor..self.cursor + n]);
                self.cursor += n;
                Ok(n)
            }
            None => {
                let samples = buf.len() / 2;
                let mut n = 0;
                for i in 0..samples {
                    let t = (self.phase + i) as f32 / crate::constants::SAMPLE_RATE as f32;
                    let value = ((TAU * 440.0 * t).sin() * 0.5 * i16::MAX as f32) as i16;
                    buf[n..n + 2].copy_from_slice(&value.to_le_bytes());
                    n += 2;
                }
                self.phase += samples;
                Ok(n)
            }
        }
    }

    fn preferred_chunk_bytes(&self) -> Option<usize> {
        self.preferred_chunk
    }
}

impl Drop for MockCapture {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Playback sink that records everything written to it.
pub struct MockPlayback {
    state: Arc<DeviceState>,
    data: Arc<Mutex<Vec<u8>>>,
    writes: usize,
    fail_on_start: bool,
    fail_after_writes: Option<usize>,
    live: Option<Arc<AtomicUsize>>,
}

impl MockPlayback {
    pub fn new() -> Self {
        Self {
            state: Arc::new(DeviceState::default()),
            data: Arc::new(Mutex::new(Vec::new())),
            writes: 0,
            fail_on_start: false,
            fail_after_writes: None,
            live: None,
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_on_start = true;
        self
    }

    /// Succeed `writes` times, then fail every write.
    pub fn failing_after_writes(mut self, writes: usize) -> Self {
        self.fail_after_writes = Some(writes);
        self
    }

    pub fn state(&self) -> Arc<DeviceState> {
        self.state.clone()
    }

    /// Handle to the bytes played so far.
    pub fn data(&self) -> Arc<Mutex<Vec<u8>>> {
        self.data.clone()
    }
}

impl Default for MockPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for MockPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.fail_on_start {
            return Err(DeviceError::InitFailed("injected playback start failure".into()));
        }
        if !self.state.is_active() {
            self.state.mark_started();
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.state.mark_stopped();
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        if !self.state.is_active() {
            return Err(DeviceError::StateFailure("playback is not running".into()));
        }
        self.writes += 1;
        if let Some(limit) = self.fail_after_writes {
            if self.writes > limit {
                return Err(DeviceError::StateFailure("injected playback fault".into()));
            }
        }
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
}

impl Drop for MockPlayback {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Capture authority whose answer can be flipped mid-test.
#[derive(Clone, Debug)]
pub struct MockAuthority {
    allowed: Arc<AtomicBool>,
}

impl MockAuthority {
    pub fn new(allowed: bool) -> Self {
        Self {
            allowed: Arc::new(AtomicBool::new(allowed)),
        }
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }
}

impl Default for MockAuthority {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CaptureAuthority for MockAuthority {
    fn capture_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}

/// Provider of scripted devices, with counters for open and live handles.
pub struct MockProvider {
    playback_opens: usize,
    capture_opens: usize,
    fail_playback_open: bool,
    fail_capture_open: bool,
    playback_fail_on_start: bool,
    capture_fail_on_start: bool,
    capture_payload: Option<Vec<u8>>,
    capture_fail_after_reads: Option<usize>,
    playback_fail_after_writes: Option<usize>,
    playback_state: Arc<DeviceState>,
    capture_state: Arc<DeviceState>,
    playback_data: Arc<Mutex<Vec<u8>>>,
    live_playbacks: Arc<AtomicUsize>,
    live_captures: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            playback_opens: 0,
            capture_opens: 0,
            fail_playback_open: false,
            fail_capture_open: false,
            playback_fail_on_start: false,
            capture_fail_on_start: false,
            capture_payload: None,
            capture_fail_after_reads: None,
            playback_fail_after_writes: None,
            playback_state: Arc::new(DeviceState::default()),
            capture_state: Arc::new(DeviceState::default()),
            playback_data: Arc::new(Mutex::new(Vec::new())),
            live_playbacks: Arc::new(AtomicUsize::new(0)),
            live_captures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_playback_open(mut self) -> Self {
        self.fail_playback_open = true;
        self
    }

    pub fn failing_capture_open(mut self) -> Self {
        self.fail_capture_open = true;
        self
    }

    pub fn failing_playback_start(mut self) -> Self {
        self.playback_fail_on_start = true;
        self
    }

    pub fn failing_capture_start(mut self) -> Self {
        self.capture_fail_on_start = true;
        self
    }

    /// Captures opened by this provider serve exactly this payload.
    pub fn with_capture_payload(mut self, payload: Vec<u8>) -> Self {
        self.capture_payload = Some(payload);
        self
    }

    pub fn with_capture_fault_after(mut self, reads: usize) -> Self {
        self.capture_fail_after_reads = Some(reads);
        self
    }

    pub fn with_playback_fault_after(mut self, writes: usize) -> Self {
        self.playback_fail_after_writes = Some(writes);
        self
    }

    pub fn playback_opens(&self) -> usize {
        self.playback_opens
    }

    pub fn capture_opens(&self) -> usize {
        self.capture_opens
    }

    /// Playback sinks opened and not yet dropped.
    pub fn live_playbacks(&self) -> usize {
        self.live_playbacks.load(Ordering::SeqCst)
    }

    /// Capture sources opened and not yet dropped.
    pub fn live_captures(&self) -> usize {
        self.live_captures.load(Ordering::SeqCst)
    }

    pub fn playback_state(&self) -> Arc<DeviceState> {
        self.playback_state.clone()
    }

    pub fn capture_state(&self) -> Arc<DeviceState> {
        self.capture_state.clone()
    }

    /// Bytes written to any playback sink this provider opened.
    pub fn played_bytes(&self) -> Vec<u8> {
        self.playback_data.lock().clone()
    }

    /// Handles into this provider's counters, usable after the provider
    /// itself has moved into a controller.
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            playback_state: self.playback_state.clone(),
            capture_state: self.capture_state.clone(),
            playback_data: self.playback_data.clone(),
            live_playbacks: self.live_playbacks.clone(),
            live_captures: self.live_captures.clone(),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Inspection handles shared with a [`MockProvider`] and the devices it
/// opens.
#[derive(Clone)]
pub struct MockProbe {
    playback_state: Arc<DeviceState>,
    capture_state: Arc<DeviceState>,
    playback_data: Arc<Mutex<Vec<u8>>>,
    live_playbacks: Arc<AtomicUsize>,
    live_captures: Arc<AtomicUsize>,
}

impl MockProbe {
    pub fn playback_state(&self) -> &DeviceState {
        &self.playback_state
    }

    pub fn capture_state(&self) -> &DeviceState {
        &self.capture_state
    }

    pub fn played_bytes(&self) -> Vec<u8> {
        self.playback_data.lock().clone()
    }

    pub fn live_playbacks(&self) -> usize {
        self.live_playbacks.load(Ordering::SeqCst)
    }

    pub fn live_captures(&self) -> usize {
        self.live_captures.load(Ordering::SeqCst)
    }
}

impl DeviceProvider for MockProvider {
    fn open_playback(&mut self) -> Result<Box<dyn PlaybackSink>, DeviceError> {
        if self.fail_playback_open {
            return Err(DeviceError::InitFailed("playback device unavailable".into()));
        }
        self.playback_opens += 1;
        self.live_playbacks.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPlayback {
            state: self.playback_state.clone(),
            data: self.playback_data.clone(),
            writes: 0,
            fail_on_start: self.playback_fail_on_start,
            fail_after_writes: self.playback_fail_after_writes,
            live: Some(self.live_playbacks.clone()),
        }))
    }

    fn open_capture(&mut self) -> Result<Box<dyn CaptureSource>, DeviceError> {
        if self.fail_capture_open {
            return Err(DeviceError::InitFailed("capture device unavailable".into()));
        }
        self.capture_opens += 1;
        self.live_captures.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCapture {
            state: self.capture_state.clone(),
            payload: self.capture_payload.clone(),
            cursor: 0,
            phase: 0,
            reads: 0,
            fail_on_start: self.capture_fail_on_start,
            fail_after_reads: self.capture_fail_after_reads,
            preferred_chunk: None,
            live: Some(self.live_captures.clone()),
        }))
    }
}
