//! TCP links between the local node and the remote peers
//!
//! Three links make up a session: inbound audio, outbound audio, and the
//! control channel. Each runs on its own thread and owns its connect phase;
//! the connected stream is parked in a shared cell so the controller can
//! force it closed when a stop outlives the grace period, and so the clip
//! task can borrow the outbound stream.

pub mod control;
pub mod inbound;
pub mod outbound;

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::SockRef;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::EndpointAddress;
use crate::error::LinkError;

/// Shared slot for a link's connected stream.
///
/// Written only by the owning link's connect phase and emptied by whoever
/// closes the stream. Writers through the cell hold the lock for the whole
/// write, which serializes the outbound relay and the clip task.
pub type StreamCell = Arc<Mutex<Option<TcpStream>>>;

pub fn new_stream_cell() -> StreamCell {
    Arc::new(Mutex::new(None))
}

/// Shut down and drop the stream parked in the cell, if any.
///
/// Unblocks any thread sitting in a read or write on the stream.
pub fn force_close(cell: &StreamCell) {
    if let Some(stream) = cell.lock().take() {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// Connect to `endpoint` with a bounded connect time, then bound all reads
/// and writes so the owning thread can observe cancellation.
pub fn connect(
    endpoint: &EndpointAddress,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<TcpStream, LinkError> {
    let addr = endpoint.resolve()?;
    debug!(endpoint = %endpoint, "connecting");

    let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
        if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
            LinkError::ConnectTimeout {
                addr: endpoint.to_string(),
                timeout_ms: connect_timeout.as_millis() as u64,
            }
        } else {
            LinkError::ConnectFailed {
                addr: endpoint.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    Ok(stream)
}

/// Turn on TCP keepalive, used by the long-idle control link.
pub fn enable_keepalive(stream: &TcpStream) -> Result<(), LinkError> {
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    Ok(())
}

/// How [`send_all`] ended.
#[derive(Debug)]
pub enum SendEnd {
    Sent,
    Cancelled,
    Failed(io::Error),
}

/// Write the whole of `data` to the stream, resuming across timed-out
/// partial writes.
///
/// A timed-out attempt may already have put a prefix of the chunk on the
/// wire; the next attempt continues from the unsent remainder, keeping the
/// raw sample stream contiguous. Timeouts are where `cancel` is observed,
/// so a `Cancelled` return can leave a partial chunk transmitted.
pub fn send_all(stream: &mut TcpStream, data: &[u8], cancel: &CancelToken) -> SendEnd {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => {
                return SendEnd::Failed(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream accepted no bytes",
                ));
            }
            Ok(n) => written += n,
            Err(e) if is_retry(&e) => {
                if cancel.is_requested() {
                    return SendEnd::Cancelled;
                }
            }
            Err(e) => return SendEnd::Failed(e),
        }
    }
    SendEnd::Sent
}

/// Whether an io error means "no progress within the timeout window".
///
/// These are polled past so blocked loops can re-check the cancel flag;
/// anything else is a real stream failure.
pub fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
