//! # LAN Audio Intercom
//!
//! Bidirectional raw-PCM audio relay between this machine and two remote
//! peers on the local network, with a line-based control channel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────── LOCAL NODE ───────────────────────────────┐
//! │                                                                          │
//! │   ┌──────────┐  inbound relay (32-bit LE, 16 kHz)   ┌───────────────┐    │
//! │   │ Playback │ ◀─────────────────────────────────── │  TCP :8080    │ ◀──┼── mic peer
//! │   └──────────┘                                      └───────────────┘    │
//! │                                                                          │
//! │   ┌──────────┐  outbound relay (16-bit LE, 16 kHz)  ┌───────────────┐    │
//! │   │ Capture  │ ───────────────┬───────────────────▶ │  TCP :8081    │ ───┼─▶ speaker peer
//! │   └──────────┘                │ shared stream       └───────────────┘    │
//! │   ┌──────────┐                │                                          │
//! │   │   Clip   │ ───────────────┘                     ┌───────────────┐    │
//! │   └──────────┘       control commands (key=value) ▶ │  TCP :8082    │ ───┼─▶ speaker peer
//! │                                                     └───────────────┘    │
//! │                                                                          │
//! │   SessionController ──▶ StatusBus ──▶ observers                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The local node always dials out; the peers listen. Each link runs on its
//! own OS thread with bounded socket timeouts, so a stop request propagates
//! through a shared cancel flag within one timeout interval.

pub mod cancel;
pub mod clip;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod session;
pub mod status;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use session::SessionController;
pub use status::{LinkId, LinkStatus, StatusBus, StatusEvent};

/// Application-wide constants
pub mod constants {
    /// Port serving remote microphone audio (inbound relay connects here)
    pub const DEFAULT_INBOUND_PORT: u16 = 8080;

    /// Port accepting local microphone audio (outbound relay connects here)
    pub const DEFAULT_OUTBOUND_PORT: u16 = 8081;

    /// Port accepting control command lines
    pub const DEFAULT_CONTROL_PORT: u16 = 8082;

    /// Sample rate shared by both audio directions
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Bytes per sample on the inbound stream (signed 32-bit LE mono)
    pub const INBOUND_BYTES_PER_SAMPLE: usize = 4;

    /// Bytes per sample on the outbound stream (signed 16-bit LE mono)
    pub const OUTBOUND_BYTES_PER_SAMPLE: usize = 2;

    /// Fallback transfer chunk for the audio relays
    pub const RELAY_CHUNK_BYTES: usize = 8192;

    /// Fallback transfer chunk for clip playback
    pub const CLIP_CHUNK_BYTES: usize = 4096;

    /// TCP connect timeout
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Socket read/write timeout, which also bounds cancel latency
    pub const IO_TIMEOUT_MS: u64 = 5000;

    /// How long a stop waits for tasks before forcing sockets closed
    pub const STOP_GRACE_MS: u64 = 1000;

    /// How often the outbound relay polls while a clip holds the stream
    pub const CLIP_YIELD_POLL_MS: u64 = 20;
}
