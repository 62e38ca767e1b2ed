//! Clip playback over the outbound audio stream
//!
//! A clip is a one-shot 16-bit LE mono byte stream pushed to the remote
//! speaker in place of live microphone audio. The session raises the clip
//! gate before spawning the injector; the injector owns lowering it again,
//! on every exit path, so the microphone always gets the stream back.
//!
//! Status sequence per run: `Playing`, then exactly one of `Finished`,
//! `Cancelled` or `Error`, then `Idle`.

use std::f32::consts::TAU;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::constants::SAMPLE_RATE;
use crate::error::ClipError;
use crate::link::{self, StreamCell};
use crate::status::{LinkId, LinkStatus, StatusBus};

/// Something that can provide clip audio as a byte stream.
pub trait ClipSource: Send {
    fn open(&self) -> Result<Box<dyn Read + Send>, ClipError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Raw 16-bit LE mono PCM read from a file.
pub struct FileClip {
    path: PathBuf,
}

impl FileClip {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ClipSource for FileClip {
    fn open(&self) -> Result<Box<dyn Read + Send>, ClipError> {
        let file = File::open(&self.path)
            .map_err(|e| ClipError::ResourceMissing(format!("{}: {}", self.path.display(), e)))?;
        Ok(Box::new(file))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// A synthesized sine tone.
pub struct ToneClip {
    freq_hz: f32,
    duration_ms: u64,
}

impl ToneClip {
    pub fn new(freq_hz: f32, duration_ms: u64) -> Self {
        Self {
            freq_hz,
            duration_ms,
        }
    }
}

impl ClipSource for ToneClip {
    fn open(&self) -> Result<Box<dyn Read + Send>, ClipError> {
        Ok(Box::new(Cursor::new(tone_bytes(
            self.freq_hz,
            self.duration_ms,
        ))))
    }

    fn describe(&self) -> String {
        format!("tone {} Hz for {} ms", self.freq_hz, self.duration_ms)
    }
}

/// Clip bytes held in memory.
pub struct MemoryClip {
    bytes: Vec<u8>,
}

impl MemoryClip {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ClipSource for MemoryClip {
    fn open(&self) -> Result<Box<dyn Read + Send>, ClipError> {
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }

    fn describe(&self) -> String {
        format!("memory clip of {} bytes", self.bytes.len())
    }
}

/// Render a sine tone as 16-bit LE mono samples at the session rate.
pub fn tone_bytes(freq_hz: f32, duration_ms: u64) -> Vec<u8> {
    let samples = (SAMPLE_RATE as u64 * duration_ms / 1000) as usize;
    let mut bytes = Vec::with_capacity(samples * 2);
    for n in 0..samples {
        let t = n as f32 / SAMPLE_RATE as f32;
        let value = ((TAU * freq_hz * t).sin() * 0.5 * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

enum ClipEnd {
    Done,
    Cancelled,
    Failed(String),
}

/// One-shot task copying a clip onto the shared outbound stream.
pub struct ClipInjector {
    source: Box<dyn ClipSource>,
    chunk_bytes: usize,
    writer: StreamCell,
    clip_active: Arc<AtomicBool>,
    bus: StatusBus,
    cancel: CancelToken,
}

impl ClipInjector {
    /// The clip gate must already be raised; the injector only lowers it.
    pub fn new(
        source: Box<dyn ClipSource>,
        chunk_bytes: usize,
        writer: StreamCell,
        clip_active: Arc<AtomicBool>,
        bus: StatusBus,
        cancel: CancelToken,
    ) -> Self {
        Self {
            source,
            chunk_bytes,
            writer,
            clip_active,
            bus,
            cancel,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("clip-inject".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        info!(clip = %self.source.describe(), "clip playback starting");
        self.bus.publish(LinkId::Clip, LinkStatus::Playing);

        let end = self.pump();

        // Lower the gate before reporting, so the microphone resumes
        // without waiting on observers.
        self.clip_active.store(false, Ordering::SeqCst);

        match end {
            ClipEnd::Done => {
                info!("clip playback finished");
                self.bus.publish(LinkId::Clip, LinkStatus::Finished);
            }
            ClipEnd::Cancelled => {
                debug!("clip playback cancelled");
                self.bus.publish(LinkId::Clip, LinkStatus::Cancelled);
            }
            ClipEnd::Failed(msg) => {
                self.bus.publish(LinkId::Clip, LinkStatus::Error(msg));
            }
        }
        self.bus.publish(LinkId::Clip, LinkStatus::Idle);
    }

    fn pump(&self) -> ClipEnd {
        let mut reader = match self.source.open() {
            Ok(reader) => reader,
            Err(e) => return ClipEnd::Failed(e.to_string()),
        };

        let mut buf = vec![0u8; self.chunk_bytes];
        loop {
            if self.cancel.is_requested() {
                return ClipEnd::Cancelled;
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return ClipEnd::Failed(format!("clip read: {}", e)),
            };
            if let Err(end) = self.send(&buf[..n]) {
                return end;
            }
        }

        if let Err(end) = self.flush() {
            return end;
        }
        ClipEnd::Done
    }

    fn send(&self, data: &[u8]) -> Result<(), ClipEnd> {
        let mut guard = self.writer.lock();
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return Err(self.ended_early("outbound stream unavailable")),
        };
        match link::send_all(stream, data, &self.cancel) {
            link::SendEnd::Sent => Ok(()),
            link::SendEnd::Cancelled => Err(ClipEnd::Cancelled),
            link::SendEnd::Failed(e) => Err(self.ended_early(&format!("clip write: {}", e))),
        }
    }

    fn flush(&self) -> Result<(), ClipEnd> {
        let mut guard = self.writer.lock();
        if let Some(stream) = guard.as_mut() {
            stream
                .flush()
                .map_err(|e| self.ended_early(&format!("clip flush: {}", e)))?;
        }
        Ok(())
    }

    /// A failed transfer during a stop is a cancellation, not an error.
    fn ended_early(&self, msg: &str) -> ClipEnd {
        if self.cancel.is_requested() {
            ClipEnd::Cancelled
        } else {
            ClipEnd::Failed(msg.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::status::StatusEvent;
    use parking_lot::Mutex;
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    fn wired_cell(port: u16) -> StreamCell {
        let cell = link::new_stream_cell();
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_write_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        *cell.lock() = Some(stream);
        cell
    }

    /// Accept one connection, sit out `stall`, then collect everything it
    /// sends.
    fn sink_server(
        listener: TcpListener,
        stall: Duration,
    ) -> (thread::JoinHandle<()>, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let sink = data.clone();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            thread::sleep(stall);
            conn.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            let mut buf = [0u8; 65536];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
                    Err(e) if link::is_retry(&e) => continue,
                    Err(_) => break,
                }
            }
        });
        (handle, data)
    }

    fn injector(
        source: Box<dyn ClipSource>,
        writer: StreamCell,
        cancel: CancelToken,
    ) -> (
        ClipInjector,
        crossbeam_channel::Receiver<StatusEvent>,
        Arc<AtomicBool>,
    ) {
        let bus = StatusBus::new();
        let rx = bus.subscribe();
        let clip_active = Arc::new(AtomicBool::new(true));
        let task = ClipInjector::new(source, 512, writer, clip_active.clone(), bus, cancel);
        (task, rx, clip_active)
    }

    #[test]
    fn test_tone_length_matches_duration() {
        let bytes = tone_bytes(880.0, 100);
        // 100 ms at 16 kHz mono, two bytes per sample.
        assert_eq!(bytes.len(), 3200);
    }

    #[test]
    fn test_clip_transfers_fully_and_finishes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, received) = sink_server(listener, Duration::ZERO);

        let payload = tone_bytes(660.0, 50);
        let cell = wired_cell(port);
        let (task, rx, clip_active) = injector(
            Box::new(MemoryClip::new(payload.clone())),
            cell.clone(),
            CancelToken::new(),
        );

        task.spawn().unwrap().join().unwrap();
        drop(cell.lock().take());
        server.join().unwrap();

        assert_eq!(received.lock().as_slice(), payload.as_slice());
        assert!(!clip_active.load(Ordering::SeqCst));
        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![LinkStatus::Playing, LinkStatus::Finished, LinkStatus::Idle]
        );
    }

    #[test]
    fn test_missing_file_reports_error_then_idle() {
        let (task, rx, clip_active) = injector(
            Box::new(FileClip::new("/nonexistent/clip.pcm")),
            link::new_stream_cell(),
            CancelToken::new(),
        );

        task.spawn().unwrap().join().unwrap();

        assert!(!clip_active.load(Ordering::SeqCst));
        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0], LinkStatus::Playing);
        assert!(matches!(&statuses[1], LinkStatus::Error(msg) if msg.contains("resource missing")));
        assert_eq!(statuses[2], LinkStatus::Idle);
    }

    #[test]
    fn test_unavailable_stream_reports_error() {
        let (task, rx, clip_active) = injector(
            Box::new(MemoryClip::new(vec![0u8; 64])),
            link::new_stream_cell(),
            CancelToken::new(),
        );

        task.spawn().unwrap().join().unwrap();

        assert!(!clip_active.load(Ordering::SeqCst));
        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert!(
            matches!(&statuses[1], LinkStatus::Error(msg) if msg.contains("stream unavailable"))
        );
    }

    #[test]
    fn test_cancel_mid_clip_reports_cancelled() {
        struct Trickle;
        impl ClipSource for Trickle {
            fn open(&self) -> Result<Box<dyn Read + Send>, ClipError> {
                struct Slow;
                impl Read for Slow {
                    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                        thread::sleep(Duration::from_millis(10));
                        let n = buf.len().min(64);
                        buf[..n].fill(0x55);
                        Ok(n)
                    }
                }
                Ok(Box::new(Slow))
            }
            fn describe(&self) -> String {
                "trickle".to_string()
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, received) = sink_server(listener, Duration::ZERO);

        let cancel = CancelToken::new();
        let cell = wired_cell(port);
        let (task, rx, clip_active) = injector(Box::new(Trickle), cell.clone(), cancel.clone());

        let handle = task.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.lock().is_empty() {
            assert!(Instant::now() < deadline, "clip never started moving");
            thread::sleep(Duration::from_millis(5));
        }
        cancel.request();
        handle.join().unwrap();
        drop(cell.lock().take());
        server.join().unwrap();

        assert!(!clip_active.load(Ordering::SeqCst));
        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![LinkStatus::Playing, LinkStatus::Cancelled, LinkStatus::Idle]
        );
    }

    #[test]
    fn test_clip_survives_stalled_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, received) = sink_server(listener, Duration::from_millis(300));

        // Enough data to overfill the socket buffer while the peer sits on
        // the connection; timed-out writes must pick up where they left off.
        let payload: Vec<u8> = (0u32..2 * 1024 * 1024).map(|n| (n % 249) as u8).collect();
        let cell = wired_cell(port);
        let (task, rx, clip_active) = injector(
            Box::new(MemoryClip::new(payload.clone())),
            cell.clone(),
            CancelToken::new(),
        );

        task.spawn().unwrap().join().unwrap();
        drop(cell.lock().take());
        server.join().unwrap();

        assert!(
            received.lock().as_slice() == payload.as_slice(),
            "clip bytes differ at the peer"
        );
        assert!(!clip_active.load(Ordering::SeqCst));
        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![LinkStatus::Playing, LinkStatus::Finished, LinkStatus::Idle]
        );
    }
}
