//! Outbound audio relay: local microphone to remote playback
//!
//! Connects to the remote speaker peer, then pushes captured 16-bit LE mono
//! chunks down the stream. The connected stream lives in a shared cell so
//! the clip task can take over the write path; while a clip is active the
//! relay leaves the microphone untouched and just polls for its turn.
//!
//! Capture authorization is re-checked on every iteration. Revocation while
//! streaming tears the link down rather than silently sending silence.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{EndpointAddress, TimingConfig};
use crate::device::{CaptureAuthority, CaptureSource};
use crate::error::LinkError;
use crate::link::{self, StreamCell};
use crate::status::{LinkId, LinkStatus, StatusBus};

enum RunEnd {
    Cancelled,
    StreamGone,
    Failed(String),
}

enum SendOutcome {
    Sent,
    Cancelled,
    Gone,
    Failed(String),
}

pub struct OutboundRelay {
    endpoint: EndpointAddress,
    timing: TimingConfig,
    chunk_bytes: usize,
    capture: Box<dyn CaptureSource>,
    started_capture: bool,
    authority: Arc<dyn CaptureAuthority>,
    clip_active: Arc<AtomicBool>,
    writer: StreamCell,
    breaker: StreamCell,
    connected: Arc<AtomicBool>,
    bus: StatusBus,
    cancel: CancelToken,
}

impl OutboundRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: EndpointAddress,
        timing: TimingConfig,
        chunk_bytes: usize,
        capture: Box<dyn CaptureSource>,
        authority: Arc<dyn CaptureAuthority>,
        clip_active: Arc<AtomicBool>,
        writer: StreamCell,
        breaker: StreamCell,
        connected: Arc<AtomicBool>,
        bus: StatusBus,
        cancel: CancelToken,
    ) -> Self {
        let chunk_bytes = capture
            .preferred_chunk_bytes()
            .filter(|&n| n > 0)
            .unwrap_or(chunk_bytes);
        Self {
            endpoint,
            timing,
            chunk_bytes,
            capture,
            started_capture: false,
            authority,
            clip_active,
            writer,
            breaker,
            connected,
            bus,
            cancel,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("outbound-relay".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        self.bus.publish(LinkId::Outbound, LinkStatus::Connecting);

        match self.connect_phase() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.bus
                    .publish(LinkId::Outbound, LinkStatus::Error(e.to_string()));
                return;
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        self.bus.publish(LinkId::Outbound, LinkStatus::Connected);
        info!(endpoint = %self.endpoint, "outbound link up");

        let end = self.pump();
        self.finish(end);
    }

    /// Connect and park the stream in the shared writer cell, plus a closing
    /// handle in the breaker. `Ok(false)` means cancellation arrived first.
    fn connect_phase(&self) -> Result<bool, LinkError> {
        let stream = link::connect(
            &self.endpoint,
            self.timing.connect_timeout(),
            self.timing.io_timeout(),
        )?;
        *self.breaker.lock() = Some(stream.try_clone()?);
        *self.writer.lock() = Some(stream);
        if self.cancel.is_requested() {
            drop(self.writer.lock().take());
            link::force_close(&self.breaker);
            return Ok(false);
        }
        Ok(true)
    }

    fn pump(&mut self) -> RunEnd {
        if !self.capture.is_active() {
            if let Err(e) = self.capture.start() {
                return RunEnd::Failed(format!("capture start: {}", e));
            }
            self.started_capture = true;
        }

        let mut buf = vec![0u8; self.chunk_bytes];
        let mut streaming = false;
        loop {
            if self.cancel.is_requested() {
                return RunEnd::Cancelled;
            }
            if self.clip_active.load(Ordering::SeqCst) {
                thread::sleep(self.timing.clip_yield_poll());
                continue;
            }
            if !self.authority.capture_allowed() {
                return RunEnd::Failed("capture permission revoked".to_string());
            }
            if !self.capture.is_active() {
                return RunEnd::Failed("capture stopped unexpectedly".to_string());
            }

            let n = match self.capture.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => return RunEnd::Failed(format!("capture read: {}", e)),
            };

            match self.send(&buf[..n]) {
                SendOutcome::Sent => {
                    if !streaming {
                        streaming = true;
                        self.bus.publish(LinkId::Outbound, LinkStatus::Streaming);
                    }
                }
                SendOutcome::Cancelled => return RunEnd::Cancelled,
                SendOutcome::Gone => return RunEnd::StreamGone,
                SendOutcome::Failed(msg) => return RunEnd::Failed(msg),
            }
        }
    }

    /// Write one chunk through the shared cell, riding out socket timeouts
    /// until every byte of it is on the wire. A missing stream means the
    /// controller tore it out from under us.
    fn send(&self, data: &[u8]) -> SendOutcome {
        let mut guard = self.writer.lock();
        let stream: &mut TcpStream = match guard.as_mut() {
            Some(stream) => stream,
            None => return SendOutcome::Gone,
        };
        match link::send_all(stream, data, &self.cancel) {
            link::SendEnd::Sent => SendOutcome::Sent,
            link::SendEnd::Cancelled => SendOutcome::Cancelled,
            link::SendEnd::Failed(e) => SendOutcome::Failed(format!("stream write: {}", e)),
        }
    }

    fn finish(&mut self, end: RunEnd) {
        drop(self.writer.lock().take());
        link::force_close(&self.breaker);
        if self.started_capture {
            self.capture.stop();
        }

        if self.cancel.is_requested() {
            debug!("outbound relay exiting for session stop");
            return;
        }

        match end {
            RunEnd::Failed(msg) => {
                self.connected.store(false, Ordering::SeqCst);
                self.bus.publish(LinkId::Outbound, LinkStatus::Error(msg));
            }
            // Only a stop empties the writer cell, and stops report through
            // the controller.
            RunEnd::StreamGone | RunEnd::Cancelled => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockAuthority, MockCapture};
    use crate::status::StatusEvent;
    use parking_lot::Mutex;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn test_timing() -> TimingConfig {
        TimingConfig {
            connect_timeout_ms: 1000,
            io_timeout_ms: 50,
            stop_grace_ms: 200,
            clip_yield_poll_ms: 5,
        }
    }

    struct Harness {
        relay: OutboundRelay,
        rx: crossbeam_channel::Receiver<StatusEvent>,
        connected: Arc<AtomicBool>,
        clip_active: Arc<AtomicBool>,
    }

    fn harness(port: u16, capture: MockCapture, authority: MockAuthority, cancel: CancelToken) -> Harness {
        let bus = StatusBus::new();
        let rx = bus.subscribe();
        let connected = Arc::new(AtomicBool::new(false));
        let clip_active = Arc::new(AtomicBool::new(false));
        let relay = OutboundRelay::new(
            EndpointAddress::new("127.0.0.1", port),
            test_timing(),
            512,
            Box::new(capture),
            Arc::new(authority),
            clip_active.clone(),
            link::new_stream_cell(),
            link::new_stream_cell(),
            connected.clone(),
            bus,
            cancel,
        );
        Harness {
            relay,
            rx,
            connected,
            clip_active,
        }
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

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_streams_captured_bytes_to_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, received) = sink_server(listener, Duration::ZERO);

        let payload: Vec<u8> = (0u16..3000).map(|n| (n % 247) as u8).collect();
        let capture = MockCapture::new().with_payload(payload.clone());
        let cancel = CancelToken::new();
        let h = harness(port, capture, MockAuthority::new(true), cancel.clone());
        let rx = h.rx;

        let handle = h.relay.spawn().unwrap();
        assert!(
            wait_until(2000, || received.lock().len() == payload.len()),
            "peer never received the full payload"
        );
        cancel.request();
        handle.join().unwrap();
        server.join().unwrap();

        assert_eq!(received.lock().as_slice(), payload.as_slice());
        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Streaming,
            ]
        );
    }

    #[test]
    fn test_authority_revocation_tears_link_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, received) = sink_server(listener, Duration::ZERO);

        let capture = MockCapture::new();
        let capture_state = capture.state();
        let authority = MockAuthority::new(true);
        let h = harness(port, capture, authority.clone(), CancelToken::new());

        let handle = h.relay.spawn().unwrap();
        assert!(wait_until(2000, || !received.lock().is_empty()));
        authority.set_allowed(false);
        handle.join().unwrap();
        server.join().unwrap();

        assert!(!h.connected.load(Ordering::SeqCst));
        assert_eq!(capture_state.stop_count(), 1);
        let statuses: Vec<LinkStatus> = h.rx.try_iter().map(|e| e.status).collect();
        assert!(matches!(
            statuses.last(),
            Some(LinkStatus::Error(msg)) if msg.contains("permission revoked")
        ));
    }

    #[test]
    fn test_clip_gate_pauses_microphone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, received) = sink_server(listener, Duration::ZERO);

        let payload = vec![7u8; 1500];
        let capture = MockCapture::new().with_payload(payload.clone());
        let cancel = CancelToken::new();
        let h = harness(port, capture, MockAuthority::new(true), cancel.clone());
        h.clip_active.store(true, Ordering::SeqCst);

        let handle = h.relay.spawn().unwrap();
        assert!(wait_until(2000, || h.connected.load(Ordering::SeqCst)));
        thread::sleep(Duration::from_millis(100));
        assert!(
            received.lock().is_empty(),
            "microphone data moved while the clip gate was up"
        );

        h.clip_active.store(false, Ordering::SeqCst);
        assert!(wait_until(2000, || received.lock().len() == payload.len()));
        cancel.request();
        handle.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_capture_fault_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, _received) = sink_server(listener, Duration::ZERO);

        let capture = MockCapture::new().failing_after_reads(2);
        let h = harness(port, capture, MockAuthority::new(true), CancelToken::new());

        h.relay.spawn().unwrap().join().unwrap();
        server.join().unwrap();

        let statuses: Vec<LinkStatus> = h.rx.try_iter().map(|e| e.status).collect();
        assert!(matches!(
            statuses.last(),
            Some(LinkStatus::Error(msg)) if msg.contains("capture read")
        ));
    }

    #[test]
    fn test_stalled_peer_loses_no_audio() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server, received) = sink_server(listener, Duration::from_millis(300));

        // Big chunks against a peer that reads nothing for a while, so
        // writes overfill the socket buffer and time out mid-chunk.
        let payload: Vec<u8> = (0u32..4 * 1024 * 1024).map(|n| (n % 251) as u8).collect();
        let capture = MockCapture::new().with_payload(payload.clone());
        let cancel = CancelToken::new();
        let bus = StatusBus::new();
        let rx = bus.subscribe();
        let relay = OutboundRelay::new(
            EndpointAddress::new("127.0.0.1", port),
            test_timing(),
            256 * 1024,
            Box::new(capture),
            Arc::new(MockAuthority::new(true)),
            Arc::new(AtomicBool::new(false)),
            link::new_stream_cell(),
            link::new_stream_cell(),
            Arc::new(AtomicBool::new(false)),
            bus,
            cancel.clone(),
        );

        let handle = relay.spawn().unwrap();
        assert!(
            wait_until(10_000, || received.lock().len() == payload.len()),
            "peer never received the full payload"
        );
        cancel.request();
        handle.join().unwrap();
        server.join().unwrap();

        assert!(
            received.lock().as_slice() == payload.as_slice(),
            "relayed bytes differ from captured bytes"
        );
        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Streaming,
            ]
        );
    }
}
