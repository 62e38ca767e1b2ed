//! cpal-backed devices (enabled by the `hardware` feature)
//!
//! Each device runs its cpal stream on a dedicated thread. The stream
//! callbacks exchange samples with the blocking trait methods through a
//! lock-free queue; the stream stops when the owning thread observes the
//! running flag drop and lets the stream fall out of scope.
//!
//! Capture converts the hardware's f32 samples to 16-bit LE; playback
//! accepts 32-bit LE samples and converts to f32. Both run mono at 16 kHz.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver};
use tracing::{error, warn};

use super::{CaptureSource, DeviceProvider, PlaybackSink};
use crate::constants::{INBOUND_BYTES_PER_SAMPLE, OUTBOUND_BYTES_PER_SAMPLE, SAMPLE_RATE};
use crate::error::DeviceError;

/// How long a read waits for samples before reporting an empty poll.
const READ_WAIT: Duration = Duration::from_millis(200);

/// How long a write waits for queue space before dropping the overflow.
const WRITE_WAIT: Duration = Duration::from_millis(100);

/// How long `start` waits for the stream thread to come up.
const STARTUP_WAIT: Duration = Duration::from_secs(2);

/// One second of mono audio at the session rate.
const QUEUE_SAMPLES: usize = SAMPLE_RATE as usize;

fn stream_config() -> StreamConfig {
    StreamConfig {
        channels: 1,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Microphone capture through cpal.
pub struct CpalCapture {
    running: Arc<AtomicBool>,
    queue: Arc<ArrayQueue<Vec<u8>>>,
    pending: Vec<u8>,
    thread: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<DeviceError>>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(ArrayQueue::new(64)),
            pending: Vec::new(),
            thread: None,
            error_rx: None,
        }
    }

    fn take_error(&self) -> Option<DeviceError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for CpalCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);
        let (error_tx, error_rx) = bounded::<DeviceError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let queue = self.queue.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("hw-capture".to_string())
            .spawn(move || {
                let device = match cpal::default_host().default_input_device() {
                    Some(device) => device,
                    None => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx
                            .send(Err(DeviceError::NotFound("no input device".into())));
                        return;
                    }
                };

                let callback_running = running.clone();
                let stream_errors = error_tx.clone();
                let stream = device.build_input_stream(
                    &stream_config(),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !callback_running.load(Ordering::Relaxed) {
                            return;
                        }
                        let mut bytes =
                            Vec::with_capacity(data.len() * OUTBOUND_BYTES_PER_SAMPLE);
                        for sample in data {
                            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            bytes.extend_from_slice(&value.to_le_bytes());
                        }
                        // Oldest data loses on overflow.
                        let _ = queue.push(bytes);
                    },
                    move |err| {
                        let _ = stream_errors
                            .try_send(DeviceError::StateFailure(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            running.store(false, Ordering::SeqCst);
                            let _ = ready_tx
                                .send(Err(DeviceError::InitFailed(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));
                        while running.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(DeviceError::InitFailed(e.to_string())));
                    }
                }
            })
            .map_err(|e| DeviceError::InitFailed(e.to_string()))?;

        self.thread = Some(handle);

        match ready_rx.recv_timeout(STARTUP_WAIT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(DeviceError::InitFailed("capture stream startup timed out".into()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if !self.is_active() {
            return Err(DeviceError::StateFailure("capture is not running".into()));
        }
        if let Some(e) = self.take_error() {
            return Err(e);
        }

        let deadline = Instant::now() + READ_WAIT;
        loop {
            let mut n = 0;
            while n < buf.len() {
                if !self.pending.is_empty() {
                    let take = self.pending.len().min(buf.len() - n);
                    buf[n..n + take].copy_from_slice(&self.pending[..take]);
                    self.pending.drain(..take);
                    n += take;
                } else if let Some(chunk) = self.queue.pop() {
                    self.pending = chunk;
                } else {
                    break;
                }
            }
            if n > 0 {
                return Ok(n);
            }
            if Instant::now() >= deadline {
                return Ok(0);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker playback through cpal.
pub struct CpalPlayback {
    running: Arc<AtomicBool>,
    queue: Arc<ArrayQueue<f32>>,
    carry: Vec<u8>,
    thread: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<DeviceError>>,
}

impl CpalPlayback {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(ArrayQueue::new(QUEUE_SAMPLES)),
            carry: Vec::new(),
            thread: None,
            error_rx: None,
        }
    }

    fn take_error(&self) -> Option<DeviceError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    fn push_sample(&self, value: f32) -> bool {
        let deadline = Instant::now() + WRITE_WAIT;
        let mut sample = value;
        loop {
            match self.queue.push(sample) {
                Ok(()) => return true,
                Err(rejected) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    sample = rejected;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

impl Default for CpalPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for CpalPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);
        let (error_tx, error_rx) = bounded::<DeviceError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let queue = self.queue.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("hw-playback".to_string())
            .spawn(move || {
                let device = match cpal::default_host().default_output_device() {
                    Some(device) => device,
                    None => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx
                            .send(Err(DeviceError::NotFound("no output device".into())));
                        return;
                    }
                };

                let stream_errors = error_tx.clone();
                let callback_queue = queue.clone();
                let stream = device.build_output_stream(
                    &stream_config(),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for slot in data.iter_mut() {
                            // Silence on underrun.
                            *slot = callback_queue.pop().unwrap_or(0.0);
                        }
                    },
                    move |err| {
                        let _ = stream_errors
                            .try_send(DeviceError::StateFailure(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            running.store(false, Ordering::SeqCst);
                            let _ = ready_tx
                                .send(Err(DeviceError::InitFailed(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));
                        while running.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(DeviceError::InitFailed(e.to_string())));
                    }
                }
            })
            .map_err(|e| DeviceError::InitFailed(e.to_string()))?;

        self.thread = Some(handle);

        match ready_rx.recv_timeout(STARTUP_WAIT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(DeviceError::InitFailed("playback stream startup timed out".into()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        if !self.is_active() {
            return Err(DeviceError::StateFailure("playback is not running".into()));
        }
        if let Some(e) = self.take_error() {
            return Err(e);
        }

        let mut bytes = Vec::with_capacity(self.carry.len() + buf.len());
        bytes.extend_from_slice(&self.carry);
        bytes.extend_from_slice(buf);
        self.carry.clear();

        let mut dropped = false;
        let mut chunks = bytes.chunks_exact(INBOUND_BYTES_PER_SAMPLE);
        for chunk in &mut chunks {
            let raw = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let sample = raw as f32 / i32::MAX as f32;
            if !self.push_sample(sample) {
                dropped = true;
            }
        }
        self.carry.extend_from_slice(chunks.remainder());

        if dropped {
            warn!("playback queue full, dropped samples");
        }
        Ok(buf.len())
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Provider handing out the default cpal input and output devices.
#[derive(Debug, Default)]
pub struct HardwareProvider;

impl HardwareProvider {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceProvider for HardwareProvider {
    fn open_playback(&mut self) -> Result<Box<dyn PlaybackSink>, DeviceError> {
        if cpal::default_host().default_output_device().is_none() {
            error!("no default output device");
            return Err(DeviceError::NotFound("no output device".into()));
        }
        Ok(Box::new(CpalPlayback::new()))
    }

    fn open_capture(&mut self) -> Result<Box<dyn CaptureSource>, DeviceError> {
        if cpal::default_host().default_input_device().is_none() {
            error!("no default input device");
            return Err(DeviceError::NotFound("no input device".into()));
        }
        Ok(Box::new(CpalCapture::new()))
    }
}
