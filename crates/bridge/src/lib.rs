//! USB gadget serial to SDIO channel bridge
//!
//! Relays bytes between the bulk endpoints of a USB serial function and
//! named shared-memory channels of an SDIO peer, one logical port per
//! channel, and mirrors modem control lines between the two sides.
//!
//! The bridge does no I/O of its own. Transport callbacks feed it
//! completions and availability edges; it schedules relay work on a queue
//! that either a [`common::WorkerPool`] or [`Bridge::run_until_idle`] drains.
//!
//! # Example
//!
//! ```
//! use bridge::{Bridge, BridgeConfig};
//! use common::test_utils::{MockControl, MockPeer, MockUsb};
//!
//! let mut config = BridgeConfig::default();
//! config.peer.open_delay_ms = 0;
//!
//! let peer = MockPeer::new();
//! let bridge = Bridge::new(config, peer.clone(), MockControl::new()).unwrap();
//! bridge.connect(0, MockUsb::new()).unwrap();
//! bridge.peer_probe("SDIO_DUN").unwrap();
//! bridge.run_until_idle();
//!
//! assert!(bridge.status(0).unwrap().peer_open);
//! ```

mod bridge;
pub mod config;
mod control;
pub mod error;
mod inbound;
pub mod interceptor;
mod lifecycle;
mod outbound;
pub mod pool;
mod port;
pub mod selftest;
pub mod status;

pub use bridge::Bridge;
pub use config::{BridgeConfig, MAX_PORTS, PortConfig};
pub use error::{BridgeError, Result};
pub use interceptor::{
    DeviceInfoResponder, DeviceInfoService, RestartHook, StreamInterceptor, Verdict,
    load_device_info_with_retry,
};
pub use port::InboundState;
pub use selftest::{SelftestReport, run_selftest};
pub use status::PortStatus;
