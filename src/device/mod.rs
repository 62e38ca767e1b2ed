//! Audio device abstraction
//!
//! Relays and the clip task talk to audio hardware through the traits here.
//! The `hardware` feature provides cpal-backed implementations; the mock
//! implementations carry the test suite and the default build.
//!
//! Byte conventions: capture produces signed 16-bit little-endian mono
//! samples, playback consumes signed 32-bit little-endian mono samples,
//! both at 16 kHz.

pub mod mock;

#[cfg(feature = "hardware")]
pub mod hardware;

use crate::error::DeviceError;

/// A local microphone (or equivalent byte source).
///
/// `read` blocks for a bounded interval at most. `Ok(0)` means no data was
/// produced within that interval, not end of stream; callers poll again.
pub trait CaptureSource: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop capturing. Idempotent.
    fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Read up to `buf.len()` captured bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Chunk size the device works best with, when it has an opinion.
    fn preferred_chunk_bytes(&self) -> Option<usize> {
        None
    }
}

/// A local speaker (or equivalent byte sink).
pub trait PlaybackSink: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop playback. Idempotent.
    fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Queue bytes for playback, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError>;

    fn preferred_chunk_bytes(&self) -> Option<usize> {
        None
    }
}

/// Answers whether capturing the local microphone is currently permitted.
///
/// Checked once before a session starts and again on every outbound
/// iteration, so revocation mid-session stops the flow of microphone data.
pub trait CaptureAuthority: Send + Sync {
    fn capture_allowed(&self) -> bool;
}

/// Authority that always permits capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

impl CaptureAuthority for AlwaysAllow {
    fn capture_allowed(&self) -> bool {
        true
    }
}

/// Opens the playback and capture devices for one session.
pub trait DeviceProvider: Send {
    fn open_playback(&mut self) -> Result<Box<dyn PlaybackSink>, DeviceError>;
    fn open_capture(&mut self) -> Result<Box<dyn CaptureSource>, DeviceError>;
}

/// Both devices of a session, acquired together.
pub struct DevicePair {
    pub playback: Box<dyn PlaybackSink>,
    pub capture: Box<dyn CaptureSource>,
}

/// Acquire playback and capture as a unit.
///
/// If capture acquisition fails, the already-acquired playback sink is
/// dropped before the error returns, so a failed start never leaves a
/// device held.
pub fn open_device_pair(provider: &mut dyn DeviceProvider) -> Result<DevicePair, DeviceError> {
    let playback = provider.open_playback()?;
    let capture = match provider.open_capture() {
        Ok(capture) => capture,
        Err(e) => {
            drop(playback);
            return Err(e);
        }
    };
    Ok(DevicePair { playback, capture })
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvider;
    use super::*;

    #[test]
    fn test_pair_acquisition_opens_both() {
        let mut provider = MockProvider::new();
        let pair = open_device_pair(&mut provider).unwrap();
        assert!(!pair.playback.is_active());
        assert!(!pair.capture.is_active());
        assert_eq!(provider.playback_opens(), 1);
        assert_eq!(provider.capture_opens(), 1);
    }

    #[test]
    fn test_capture_failure_releases_playback() {
        let mut provider = MockProvider::new().failing_capture_open();
        let result = open_device_pair(&mut provider);
        assert!(matches!(result, Err(DeviceError::InitFailed(_))));
        assert_eq!(provider.playback_opens(), 1);
        assert_eq!(provider.live_playbacks(), 0);
    }

    #[test]
    fn test_playback_failure_skips_capture() {
        let mut provider = MockProvider::new().failing_playback_open();
        let result = open_device_pair(&mut provider);
        assert!(result.is_err());
        assert_eq!(provider.capture_opens(), 0);
    }
}
