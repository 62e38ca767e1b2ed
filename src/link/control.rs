//! Control channel: newline-terminated ASCII commands to the remote peer
//!
//! Two threads share the link. The link thread owns connecting (with TCP
//! keepalive, since the channel may sit idle for minutes) and then just
//! watches for shutdown. The command worker drains the session's command
//! queue and writes one `key=value` line per command through the shared
//! stream cell.
//!
//! The channel is write-only, so a dead peer only surfaces when a command
//! write fails; the worker then tears the link down and reports the error.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{EndpointAddress, TimingConfig};
use crate::error::LinkError;
use crate::link::{self, StreamCell};
use crate::status::{LinkId, LinkStatus, StatusBus};

const MONITOR_POLL: Duration = Duration::from_millis(200);

pub struct ControlLink {
    endpoint: EndpointAddress,
    timing: TimingConfig,
    writer: StreamCell,
    breaker: StreamCell,
    connected: Arc<AtomicBool>,
    bus: StatusBus,
    cancel: CancelToken,
}

impl ControlLink {
    pub fn new(
        endpoint: EndpointAddress,
        timing: TimingConfig,
        writer: StreamCell,
        breaker: StreamCell,
        connected: Arc<AtomicBool>,
        bus: StatusBus,
        cancel: CancelToken,
    ) -> Self {
        Self {
            endpoint,
            timing,
            writer,
            breaker,
            connected,
            bus,
            cancel,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("control-link".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        self.bus.publish(LinkId::Control, LinkStatus::Connecting);

        match self.connect_phase() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                if !self.cancel.is_requested() {
                    self.bus
                        .publish(LinkId::Control, LinkStatus::Error(e.to_string()));
                }
                return;
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        self.bus.publish(LinkId::Control, LinkStatus::Connected);
        info!(endpoint = %self.endpoint, "control link up");

        loop {
            if self.cancel.is_requested() {
                debug!("control link exiting for session stop");
                return;
            }
            if !self.connected.load(Ordering::SeqCst) {
                // The command worker tore the link down and reported it.
                return;
            }
            thread::sleep(MONITOR_POLL);
        }
    }

    fn connect_phase(&self) -> Result<bool, LinkError> {
        let stream = link::connect(
            &self.endpoint,
            self.timing.connect_timeout(),
            self.timing.io_timeout(),
        )?;
        link::enable_keepalive(&stream)?;
        *self.breaker.lock() = Some(stream.try_clone()?);
        *self.writer.lock() = Some(stream);
        if self.cancel.is_requested() {
            drop(self.writer.lock().take());
            link::force_close(&self.breaker);
            return Ok(false);
        }
        Ok(true)
    }
}

/// Drains queued commands onto the control stream.
///
/// Runs until the sending side of the queue is dropped. Commands are
/// trimmed; empty ones and commands queued while the link is down are
/// dropped with a warning rather than failing the session.
pub struct CommandWorker {
    commands: Receiver<String>,
    writer: StreamCell,
    breaker: StreamCell,
    connected: Arc<AtomicBool>,
    bus: StatusBus,
    cancel: CancelToken,
}

impl CommandWorker {
    pub fn new(
        commands: Receiver<String>,
        writer: StreamCell,
        breaker: StreamCell,
        connected: Arc<AtomicBool>,
        bus: StatusBus,
        cancel: CancelToken,
    ) -> Self {
        Self {
            commands,
            writer,
            breaker,
            connected,
            bus,
            cancel,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("control-send".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        while let Ok(raw) = self.commands.recv() {
            let command = raw.trim();
            if command.is_empty() {
                continue;
            }
            if !self.connected.load(Ordering::SeqCst) {
                warn!(command, "control link not connected, dropping command");
                continue;
            }
            if let Err(msg) = self.transmit(command) {
                self.teardown(msg);
            }
        }
        debug!("command queue closed");
    }

    fn transmit(&self, command: &str) -> Result<(), String> {
        let mut guard = self.writer.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| "control stream closed".to_string())?;
        let line = format!("{}\n", command);
        stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| format!("control write: {}", e))?;
        debug!(command, "control command sent");
        Ok(())
    }

    fn teardown(&self, msg: String) {
        drop(self.writer.lock().take());
        link::force_close(&self.breaker);
        if self.cancel.is_requested() {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.bus.publish(LinkId::Control, LinkStatus::Error(msg));
    }
}
