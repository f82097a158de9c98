//! Common building blocks for gser-sdio-bridge
//!
//! This crate holds what the bridge shares with its collaborators and its
//! tests: the transport traits, transfer requests, the deferred work queue,
//! error types and logging setup.

pub mod error;
pub mod logging;
pub mod request;
pub mod test_utils;
pub mod transport;
pub mod workqueue;

pub use error::{Error, Result, TransportError};
pub use logging::setup_logging;
pub use request::{Request, RequestId, RequestStatus};
pub use transport::{
    ControlChannel, Endpoint, EventSink, PeerChannel, PeerEvent, PeerTransport, Rejected,
    StatusSink, UsbFunction,
};
pub use workqueue::{KIND_COUNT, WorkHandler, WorkItem, WorkKind, WorkQueue, WorkerPool};
