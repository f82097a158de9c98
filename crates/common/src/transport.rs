//! Collaborator interfaces
//!
//! The bridge never talks to hardware directly. It sits between three
//! collaborators:
//!
//! - a USB serial function ([`UsbFunction`]) with one bulk IN and one bulk
//!   OUT endpoint, owned by the gadget framework
//! - a shared-memory peer transport ([`PeerTransport`]) that opens named
//!   byte-stream channels ([`PeerChannel`])
//! - a modem control multiplexer ([`ControlChannel`])
//!
//! Asynchronous notifications flow back through the sink closures passed
//! at open time and through the bridge's public completion methods.

use crate::error::TransportError;
use crate::request::Request;
use protocol::{ModemLines, SerialState};
use std::sync::Arc;

/// Bulk endpoint of the serial function, from the device's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::In => "ep-in",
            Self::Out => "ep-out",
        }
    }
}

/// A submit the function refused, handing the request back
#[derive(Debug)]
pub struct Rejected {
    pub error: TransportError,
    pub request: Request,
}

/// USB serial function (one logical port of the composite gadget)
///
/// Completions are delivered by calling the bridge's `out_complete` /
/// `in_complete` with the request that finished.
pub trait UsbFunction: Send + Sync {
    fn enable(&self, ep: Endpoint) -> Result<(), TransportError>;

    /// Disable the endpoint, aborting queued requests
    ///
    /// Synchronous: every request still queued on the endpoint is handed
    /// back. Later submits on a disabled endpoint must be rejected.
    fn disable(&self, ep: Endpoint) -> Vec<Request>;

    /// Queue a request; on success ownership passes to the function until
    /// its completion is reported
    fn submit(&self, ep: Endpoint, request: Request) -> Result<(), Rejected>;

    /// Cancel everything queued on the endpoint, handing it back
    fn cancel_all(&self, ep: Endpoint) -> Vec<Request>;

    /// Send a `SERIAL_STATE` notification to the host
    fn send_serial_state(&self, state: SerialState) -> Result<(), TransportError>;
}

/// Edge-triggered availability notification from a peer channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEvent {
    ReadAvail,
    WriteAvail,
}

/// Callback a peer channel uses to signal availability
pub type EventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Callback a control channel uses to report modem status changes
pub type StatusSink = Arc<dyn Fn(ModemLines) + Send + Sync>;

/// An open byte-stream channel to the peer
pub trait PeerChannel: Send + Sync {
    /// Write up to `data.len()` bytes; returns how many were accepted
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes; returns how many were read
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write_avail(&self) -> usize;

    fn read_avail(&self) -> usize;
}

/// Opens peer channels by name
pub trait PeerTransport: Send + Sync {
    /// Open `name`; [`TransportError::NotReady`] means try again later
    fn open(&self, name: &str, events: EventSink) -> Result<Arc<dyn PeerChannel>, TransportError>;
}

/// Modem control-line multiplexer
pub trait ControlChannel: Send + Sync {
    fn open(&self, channel_id: u8, status: StatusSink) -> Result<(), TransportError>;

    fn get_lines(&self, channel_id: u8) -> Result<ModemLines, TransportError>;

    /// Raise `set` and drop `clear`
    fn set_lines(
        &self,
        channel_id: u8,
        set: ModemLines,
        clear: ModemLines,
    ) -> Result<(), TransportError>;
}
