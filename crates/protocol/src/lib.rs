//! Protocol library for gser-sdio-bridge
//!
//! The bridge itself moves opaque bytes. This crate holds the few structured
//! things that cross its edges:
//!
//! - modem control-line encodings for the USB host and the modem control
//!   multiplexer, with the conversions between them ([`lines`])
//! - the optional device-info diagnostic exchange carried inside the serial
//!   byte stream ([`diag`])
//!
//! # Example
//!
//! ```
//! use protocol::{HostLines, ModemLines, SerialState};
//!
//! // Host raised DTR: the modem sees TIOCM_DTR
//! assert_eq!(ModemLines::from_host(HostLines::DTR), ModemLines::DTR);
//!
//! // Modem reports carrier: the host sees DCD
//! assert_eq!(ModemLines::CD.to_serial_state(), SerialState::DCD);
//! ```

pub mod diag;
pub mod error;
pub mod lines;

pub use diag::{
    DeviceInfoBlock, DiagAction, DiagCommand, DiagHeader, DiagReply, DiagSession, DiagState,
    HostFrame, classify, encode_reply,
};
pub use error::{ProtocolError, Result};
pub use lines::{HostLines, ModemLines, SerialState};
