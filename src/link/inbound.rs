//! Inbound audio relay: remote microphone to local playback
//!
//! Connects to the remote microphone peer, then copies the 32-bit LE mono
//! stream into the local playback sink chunk by chunk. Every byte read is
//! handed to the sink before the next read, so a peer that sends N bytes
//! and closes gets exactly N bytes played.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{EndpointAddress, TimingConfig};
use crate::device::PlaybackSink;
use crate::error::LinkError;
use crate::link::{self, StreamCell};
use crate::status::{LinkId, LinkStatus, StatusBus};

enum RunEnd {
    PeerClosed,
    Cancelled,
    Failed(String),
}

pub struct InboundRelay {
    endpoint: EndpointAddress,
    timing: TimingConfig,
    chunk_bytes: usize,
    playback: Box<dyn PlaybackSink>,
    started_playback: bool,
    breaker: StreamCell,
    connected: Arc<AtomicBool>,
    bus: StatusBus,
    cancel: CancelToken,
}

impl InboundRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: EndpointAddress,
        timing: TimingConfig,
        chunk_bytes: usize,
        playback: Box<dyn PlaybackSink>,
        breaker: StreamCell,
        connected: Arc<AtomicBool>,
        bus: StatusBus,
        cancel: CancelToken,
    ) -> Self {
        let chunk_bytes = playback
            .preferred_chunk_bytes()
            .filter(|&n| n > 0)
            .unwrap_or(chunk_bytes);
        Self {
            endpoint,
            timing,
            chunk_bytes,
            playback,
            started_playback: false,
            breaker,
            connected,
            bus,
            cancel,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("inbound-relay".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        self.bus.publish(LinkId::Inbound, LinkStatus::Connecting);

        let stream = match self.connect_phase() {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(e) => {
                self.bus
                    .publish(LinkId::Inbound, LinkStatus::Error(e.to_string()));
                return;
            }
        };

        self.connected.store(true, Ordering::SeqCst);
        self.bus.publish(LinkId::Inbound, LinkStatus::Connected);
        info!(endpoint = %self.endpoint, "inbound link up");

        let end = self.pump(stream);
        self.finish(end);
    }

    /// Connect and park a closing handle in the breaker cell. `Ok(None)`
    /// means cancellation arrived while connecting.
    fn connect_phase(&self) -> Result<Option<TcpStream>, LinkError> {
        let stream = link::connect(
            &self.endpoint,
            self.timing.connect_timeout(),
            self.timing.io_timeout(),
        )?;
        *self.breaker.lock() = Some(stream.try_clone()?);
        if self.cancel.is_requested() {
            link::force_close(&self.breaker);
            return Ok(None);
        }
        Ok(Some(stream))
    }

    fn pump(&mut self, mut stream: TcpStream) -> RunEnd {
        if !self.playback.is_active() {
            if let Err(e) = self.playback.start() {
                return RunEnd::Failed(format!("playback start: {}", e));
            }
            self.started_playback = true;
        }

        let mut buf = vec![0u8; self.chunk_bytes];
        let mut streaming = false;
        loop {
            if self.cancel.is_requested() {
                return RunEnd::Cancelled;
            }
            match stream.read(&mut buf) {
                Ok(0) => return RunEnd::PeerClosed,
                Ok(n) => {
                    if !streaming {
                        streaming = true;
                        self.bus.publish(LinkId::Inbound, LinkStatus::Streaming);
                    }
                    if let Err(e) = self.play_all(&buf[..n]) {
                        return RunEnd::Failed(e);
                    }
                }
                Err(e) if link::is_retry(&e) => continue,
                Err(e) => {
                    if self.cancel.is_requested() {
                        return RunEnd::Cancelled;
                    }
                    return RunEnd::Failed(format!("stream read: {}", e));
                }
            }
        }
    }

    /// Hand the whole chunk to the sink before the next read.
    fn play_all(&mut self, mut data: &[u8]) -> Result<(), String> {
        while !data.is_empty() {
            let n = self
                .playback
                .write(data)
                .map_err(|e| format!("playback write: {}", e))?;
            if n == 0 {
                return Err("playback sink refused data".to_string());
            }
            data = &data[n..];
        }
        Ok(())
    }

    fn finish(&mut self, end: RunEnd) {
        link::force_close(&self.breaker);
        if self.started_playback {
            self.playback.stop();
        }

        if self.cancel.is_requested() {
            // The controller reports links taken down by a stop.
            debug!("inbound relay exiting for session stop");
            return;
        }

        self.connected.store(false, Ordering::SeqCst);
        match end {
            RunEnd::PeerClosed => {
                info!("inbound peer closed the stream");
                self.bus.publish(LinkId::Inbound, LinkStatus::Disconnected);
            }
            RunEnd::Failed(msg) => {
                self.bus.publish(LinkId::Inbound, LinkStatus::Error(msg));
            }
            RunEnd::Cancelled => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockPlayback;
    use crate::status::StatusEvent;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Duration;

    fn test_timing() -> TimingConfig {
        TimingConfig {
            connect_timeout_ms: 1000,
            io_timeout_ms: 50,
            stop_grace_ms: 200,
            clip_yield_poll_ms: 5,
        }
    }

    fn relay_for(
        port: u16,
        playback: MockPlayback,
        cancel: CancelToken,
    ) -> (InboundRelay, crossbeam_channel::Receiver<StatusEvent>, Arc<AtomicBool>) {
        let bus = StatusBus::new();
        let rx = bus.subscribe();
        let connected = Arc::new(AtomicBool::new(false));
        let relay = InboundRelay::new(
            EndpointAddress::new("127.0.0.1", port),
            test_timing(),
            1024,
            Box::new(playback),
            link::new_stream_cell(),
            connected.clone(),
            bus,
            cancel,
        );
        (relay, rx, connected)
    }

    #[test]
    fn test_delivers_exact_bytes_then_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let payload: Vec<u8> = (0u16..2000).map(|n| (n % 251) as u8).collect();
        let served = payload.clone();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(&served).unwrap();
        });

        let playback = MockPlayback::new();
        let data = playback.data();
        let state = playback.state();
        let (relay, rx, connected) = relay_for(port, playback, CancelToken::new());

        relay.spawn().unwrap().join().unwrap();
        server.join().unwrap();

        assert_eq!(data.lock().as_slice(), payload.as_slice());
        assert_eq!(state.start_count(), 1);
        assert_eq!(state.stop_count(), 1);
        assert!(!connected.load(Ordering::SeqCst));

        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Streaming,
                LinkStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn test_connect_refused_reports_error_only() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let playback = MockPlayback::new();
        let state = playback.state();
        let (relay, rx, connected) = relay_for(port, playback, CancelToken::new());

        relay.spawn().unwrap().join().unwrap();

        assert!(!connected.load(Ordering::SeqCst));
        assert_eq!(state.start_count(), 0);

        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0], LinkStatus::Connecting);
        assert!(matches!(statuses[1], LinkStatus::Error(_)));
    }

    #[test]
    fn test_cancel_suppresses_terminal_status() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            // Hold the connection open without sending anything.
            thread::sleep(Duration::from_millis(300));
            drop(conn);
        });

        let playback = MockPlayback::new();
        let state = playback.state();
        let cancel = CancelToken::new();
        let (relay, rx, connected) = relay_for(port, playback, cancel.clone());

        let handle = relay.spawn().unwrap();
        // Wait for the link to come up, then stop the session.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !connected.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "link never came up");
            thread::sleep(Duration::from_millis(5));
        }
        cancel.request();
        handle.join().unwrap();
        server.join().unwrap();

        // Playback was stopped, but the terminal report is the controller's.
        assert_eq!(state.stop_count(), 1);
        assert!(connected.load(Ordering::SeqCst));

        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![LinkStatus::Connecting, LinkStatus::Connected]);
    }

    #[test]
    fn test_playback_fault_ends_run_with_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            // Two chunks; the second write hits the injected fault.
            let _ = conn.write_all(&[1u8; 1024]);
            let _ = conn.write_all(&[2u8; 1024]);
            let _ = conn.write_all(&[3u8; 1024]);
            thread::sleep(Duration::from_millis(200));
        });

        let playback = MockPlayback::new().failing_after_writes(1);
        let (relay, rx, _connected) = relay_for(port, playback, CancelToken::new());

        relay.spawn().unwrap().join().unwrap();
        server.join().unwrap();

        let statuses: Vec<LinkStatus> = rx.try_iter().map(|e| e.status).collect();
        assert!(matches!(
            statuses.last(),
            Some(LinkStatus::Error(msg)) if msg.contains("playback write")
        ));
    }
}
