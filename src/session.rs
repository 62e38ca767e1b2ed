//! Session lifecycle
//!
//! One controller owns the whole intercom session: the three links, the
//! command worker, the clip task, and the local device pair. Start is
//! all-or-nothing; any failure before the links launch leaves no thread
//! running and no device held. Stop is idempotent and safe from any thread.
//!
//! Shutdown runs in two stages. Cancellation is requested first and every
//! task gets a grace period to notice it through its bounded reads and
//! writes; whatever is still blocked after the grace period has its socket
//! shut down underneath it, which forces the pending call to return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::clip::{ClipInjector, ClipSource};
use crate::config::AppConfig;
use crate::device::{open_device_pair, CaptureAuthority, DeviceProvider};
use crate::error::{DeviceError, Error};
use crate::link::control::{CommandWorker, ControlLink};
use crate::link::inbound::InboundRelay;
use crate::link::outbound::OutboundRelay;
use crate::link::{self, StreamCell};
use crate::status::{LinkId, LinkStatus, StatusBus, StatusEvent};

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Stream cells for the three links. Writer cells carry the write path
/// (shared between producers); breaker cells hold closing handles the
/// controller can shut without contending with an in-flight write.
struct Cells {
    inbound_breaker: StreamCell,
    outbound_writer: StreamCell,
    outbound_breaker: StreamCell,
    control_writer: StreamCell,
    control_breaker: StreamCell,
}

impl Cells {
    fn new() -> Self {
        Self {
            inbound_breaker: link::new_stream_cell(),
            outbound_writer: link::new_stream_cell(),
            outbound_breaker: link::new_stream_cell(),
            control_writer: link::new_stream_cell(),
            control_breaker: link::new_stream_cell(),
        }
    }

    fn force_close_all(&self) {
        link::force_close(&self.inbound_breaker);
        link::force_close(&self.outbound_breaker);
        link::force_close(&self.control_breaker);
    }
}

/// Connection flags, one per link, plus the clip gate.
///
/// A link sets its flag on connect and clears it when it reports its own
/// terminal status; a flag still set after all threads have joined marks a
/// link the stop took down, and the controller reports those.
struct Flags {
    inbound_connected: Arc<AtomicBool>,
    outbound_connected: Arc<AtomicBool>,
    control_connected: Arc<AtomicBool>,
    clip_active: Arc<AtomicBool>,
}

impl Flags {
    fn new() -> Self {
        Self {
            inbound_connected: Arc::new(AtomicBool::new(false)),
            outbound_connected: Arc::new(AtomicBool::new(false)),
            control_connected: Arc::new(AtomicBool::new(false)),
            clip_active: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct Running {
    cancel: CancelToken,
    relay_handles: Vec<JoinHandle<()>>,
    command_tx: Sender<String>,
    command_handle: JoinHandle<()>,
    clip_handle: Option<JoinHandle<()>>,
    cells: Cells,
    flags: Flags,
}

struct State {
    phase: Phase,
    running: Option<Running>,
}

/// Public control surface of the intercom.
///
/// Status observers are invoked inline on publishing threads and must not
/// call back into the controller; subscribe to a channel instead when the
/// reaction needs controller access.
pub struct SessionController {
    config: AppConfig,
    provider: Mutex<Box<dyn DeviceProvider>>,
    authority: Arc<dyn CaptureAuthority>,
    bus: StatusBus,
    state: Mutex<State>,
}

impl SessionController {
    pub fn new(
        config: AppConfig,
        provider: Box<dyn DeviceProvider>,
        authority: Arc<dyn CaptureAuthority>,
    ) -> Self {
        Self {
            config,
            provider: Mutex::new(provider),
            authority,
            bus: StatusBus::new(),
            state: Mutex::new(State {
                phase: Phase::Idle,
                running: None,
            }),
        }
    }

    pub fn status_bus(&self) -> &StatusBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        self.bus.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().phase == Phase::Active
    }

    /// Bring the session up: validate addresses, check capture
    /// authorization, acquire both devices, then launch the links.
    ///
    /// A second start while one is running reports `AlreadyRunning` and
    /// returns `Ok`. On error nothing stays behind: no thread, no device,
    /// no held socket.
    pub fn start(&self) -> Result<(), Error> {
        let begin = {
            let mut state = self.state.lock();
            if state.phase == Phase::Idle {
                state.phase = Phase::Starting;
                true
            } else {
                false
            }
        };
        if !begin {
            warn!("start requested while a session is in use");
            self.bus
                .publish(LinkId::Session, LinkStatus::AlreadyRunning);
            return Ok(());
        }

        info!("session starting");
        self.bus.publish(LinkId::Session, LinkStatus::Starting);

        match self.build() {
            Ok(running) => {
                {
                    let mut state = self.state.lock();
                    state.running = Some(running);
                    state.phase = Phase::Active;
                }
                self.bus.publish(LinkId::Session, LinkStatus::Active);
                info!("session active");
                Ok(())
            }
            Err(e) => {
                self.state.lock().phase = Phase::Idle;
                self.bus
                    .publish(LinkId::Session, LinkStatus::Error(e.to_string()));
                self.bus.publish(LinkId::Session, LinkStatus::Idle);
                Err(e)
            }
        }
    }

    fn build(&self) -> Result<Running, Error> {
        let inbound_ep = self.config.inbound_endpoint();
        let outbound_ep = self.config.outbound_endpoint();
        let control_ep = self.config.control_endpoint();
        inbound_ep.resolve()?;
        outbound_ep.resolve()?;
        control_ep.resolve()?;

        if !self.authority.capture_allowed() {
            return Err(DeviceError::PermissionDenied.into());
        }

        let pair = {
            let mut provider = self.provider.lock();
            open_device_pair(provider.as_mut())?
        };

        let timing = self.config.timing.clone();
        let cancel = CancelToken::new();
        let cells = Cells::new();
        let flags = Flags::new();
        let (command_tx, command_rx) = unbounded::<String>();

        let inbound = InboundRelay::new(
            inbound_ep,
            timing.clone(),
            self.config.audio.relay_chunk_bytes,
            pair.playback,
            cells.inbound_breaker.clone(),
            flags.inbound_connected.clone(),
            self.bus.clone(),
            cancel.clone(),
        );
        let outbound = OutboundRelay::new(
            outbound_ep,
            timing.clone(),
            self.config.audio.relay_chunk_bytes,
            pair.capture,
            self.authority.clone(),
            flags.clip_active.clone(),
            cells.outbound_writer.clone(),
            cells.outbound_breaker.clone(),
            flags.outbound_connected.clone(),
            self.bus.clone(),
            cancel.clone(),
        );
        let control = ControlLink::new(
            control_ep,
            timing,
            cells.control_writer.clone(),
            cells.control_breaker.clone(),
            flags.control_connected.clone(),
            self.bus.clone(),
            cancel.clone(),
        );
        let worker = CommandWorker::new(
            command_rx,
            cells.control_writer.clone(),
            cells.control_breaker.clone(),
            flags.control_connected.clone(),
            self.bus.clone(),
            cancel.clone(),
        );

        let mut relay_handles: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        match inbound.spawn() {
            Ok(handle) => relay_handles.push(handle),
            Err(e) => {
                self.abort_spawned(&cancel, &cells, &flags, relay_handles);
                return Err(Error::Io(e));
            }
        }
        match outbound.spawn() {
            Ok(handle) => relay_handles.push(handle),
            Err(e) => {
                self.abort_spawned(&cancel, &cells, &flags, relay_handles);
                return Err(Error::Io(e));
            }
        }
        match control.spawn() {
            Ok(handle) => relay_handles.push(handle),
            Err(e) => {
                self.abort_spawned(&cancel, &cells, &flags, relay_handles);
                return Err(Error::Io(e));
            }
        }
        let command_handle = match worker.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.abort_spawned(&cancel, &cells, &flags, relay_handles);
                return Err(Error::Io(e));
            }
        };

        Ok(Running {
            cancel,
            relay_handles,
            command_tx,
            command_handle,
            clip_handle: None,
            cells,
            flags,
        })
    }

    /// Roll back a partially launched session.
    fn abort_spawned(
        &self,
        cancel: &CancelToken,
        cells: &Cells,
        flags: &Flags,
        handles: Vec<JoinHandle<()>>,
    ) {
        cancel.request();
        cells.force_close_all();
        for handle in handles {
            let _ = handle.join();
        }
        drop(cells.outbound_writer.lock().take());
        drop(cells.control_writer.lock().take());
        self.sweep_terminal(flags);
    }

    /// Take the session down. Safe to call at any time; a stop with nothing
    /// running just reports `NotRunning`.
    pub fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            if state.phase == Phase::Active {
                state.phase = Phase::Stopping;
                state.running.take()
            } else {
                None
            }
        };
        let running = match running {
            Some(running) => running,
            None => {
                warn!("stop requested but no session is running");
                self.bus.publish(LinkId::Session, LinkStatus::NotRunning);
                return;
            }
        };

        self.bus.publish(LinkId::Session, LinkStatus::Stopping);
        info!("session stopping");

        let Running {
            cancel,
            relay_handles,
            command_tx,
            command_handle,
            clip_handle,
            cells,
            flags,
        } = running;

        cancel.request();
        drop(command_tx);

        // Grace: let every task wind down through its own bounded calls.
        let deadline = Instant::now() + self.config.timing.stop_grace();
        loop {
            let all_done = relay_handles.iter().all(|h| h.is_finished())
                && command_handle.is_finished()
                && clip_handle.as_ref().map_or(true, |h| h.is_finished());
            if all_done || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL);
        }

        cells.force_close_all();

        for handle in relay_handles {
            let _ = handle.join();
        }
        let _ = command_handle.join();
        if let Some(handle) = clip_handle {
            let _ = handle.join();
        }

        drop(cells.outbound_writer.lock().take());
        drop(cells.control_writer.lock().take());

        // Links the stop took down get their Disconnected here; links that
        // already failed reported themselves and cleared their flag.
        self.sweep_terminal(&flags);
        flags.clip_active.store(false, Ordering::SeqCst);
        self.bus.publish(LinkId::Clip, LinkStatus::Idle);

        self.state.lock().phase = Phase::Idle;
        self.bus.publish(LinkId::Session, LinkStatus::Idle);
        info!("session stopped");
    }

    fn sweep_terminal(&self, flags: &Flags) {
        let links = [
            (&flags.inbound_connected, LinkId::Inbound),
            (&flags.outbound_connected, LinkId::Outbound),
            (&flags.control_connected, LinkId::Control),
        ];
        for (flag, id) in links {
            if flag.swap(false, Ordering::SeqCst) {
                self.bus.publish(id, LinkStatus::Disconnected);
            }
        }
    }

    /// Queue a `key=value` line for the control channel.
    ///
    /// Commands sent while no session is active, or while the control link
    /// is down, are dropped with a warning; they never fail the session.
    pub fn send_command(&self, command: &str) {
        let state = self.state.lock();
        match (state.phase, state.running.as_ref()) {
            (Phase::Active, Some(running)) => {
                let _ = running.command_tx.send(command.to_string());
            }
            _ => warn!(command, "no active session, dropping control command"),
        }
    }

    /// Play a clip over the outbound stream.
    ///
    /// Returns whether playback was scheduled. At most one clip runs at a
    /// time; a second request while one is in flight reports
    /// `AlreadyPlaying` and is rejected.
    pub fn request_clip_playback(&self, source: Box<dyn ClipSource>) -> bool {
        let mut state = self.state.lock();
        let running = match (state.phase, state.running.as_mut()) {
            (Phase::Active, Some(running)) => running,
            _ => {
                warn!("no active session, clip request ignored");
                return false;
            }
        };
        if !running.flags.outbound_connected.load(Ordering::SeqCst) {
            warn!("outbound link not connected, clip request ignored");
            return false;
        }
        if running
            .flags
            .clip_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            drop(state);
            self.bus.publish(LinkId::Clip, LinkStatus::AlreadyPlaying);
            return false;
        }

        // The previous clip, if any, lowered the gate on its way out; its
        // thread is done or within a few instructions of it.
        if let Some(handle) = running.clip_handle.take() {
            let _ = handle.join();
        }

        let injector = ClipInjector::new(
            source,
            self.config.audio.clip_chunk_bytes,
            running.cells.outbound_writer.clone(),
            running.flags.clip_active.clone(),
            self.bus.clone(),
            running.cancel.clone(),
        );
        match injector.spawn() {
            Ok(handle) => {
                running.clip_handle = Some(handle);
                true
            }
            Err(e) => {
                running.flags.clip_active.store(false, Ordering::SeqCst);
                warn!(error = %e, "failed to launch clip task");
                false
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.is_active() {
            self.stop();
        }
    }
}
