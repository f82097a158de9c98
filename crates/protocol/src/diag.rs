//! Device-info diagnostic exchange
//!
//! A download tool on the host can ask the device for a fixed device-info
//! record over the ordinary serial byte stream. The exchange looks like this:
//!
//! ```text
//! Host                                   Device
//! ────                                   ──────
//!   "AT*PHONEINFO"            ─────────►
//!                             ◄─────────  "AT*PHONEINFO*WAIT"
//!   tag(PHONE_INFO, v0)       ─────────►
//!                             ◄─────────  header(16) + device info(256)
//!   tag(FINISH, v0)           ─────────►
//!                             ◄─────────  header(16), all zero
//! ```
//!
//! Binary command tags are little-endian `u32` values of
//! `command | version << 16`. `AT*PHONEINFO*RESET` asks the device to
//! restart into its download mode; what that means is up to the embedder.
//!
//! This module only knows the byte layouts and the session state machine;
//! it performs no I/O.

use crate::error::{ProtocolError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Enter the exchange
pub const AT_PHONEINFO: &[u8] = b"AT*PHONEINFO";

/// Request a restart into download mode
pub const AT_PHONEINFO_RESET: &[u8] = b"AT*PHONEINFO*RESET";

/// Acknowledgement sent after [`AT_PHONEINFO`]
pub const AT_PHONEINFO_WAIT: &[u8] = b"AT*PHONEINFO*WAIT";

/// Packet version carried in the upper half of every command tag
pub const PACKET_VERSION: u16 = 0;

/// Response header length
pub const HEADER_LEN: usize = 16;

/// Device-info block length
pub const DEVICE_INFO_LEN: usize = 256;

/// Raw partition sector size
pub const SECTOR_SIZE: usize = 512;

/// Offset of the device-info block within the first partition sector
pub const DEVICE_INFO_OFFSET: usize = 32;

/// Binary diagnostic commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DiagCommand {
    Finish = 0,
    PhoneInfo = 1,
    HashTable = 2,
    PartitionTable = 3,
}

impl DiagCommand {
    /// Wire tag for this command at [`PACKET_VERSION`]
    pub fn tag(self) -> u32 {
        (self as u32) | ((PACKET_VERSION as u32) << 16)
    }

    /// Decode a wire tag
    pub fn from_tag(tag: u32) -> Result<Self> {
        if (tag >> 16) as u16 != PACKET_VERSION {
            return Err(ProtocolError::UnknownCommand { tag });
        }
        match tag & 0xffff {
            0 => Ok(Self::Finish),
            1 => Ok(Self::PhoneInfo),
            2 => Ok(Self::HashTable),
            3 => Ok(Self::PartitionTable),
            _ => Err(ProtocolError::UnknownCommand { tag }),
        }
    }
}

/// What a chunk of host traffic means to the diagnostic exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFrame {
    /// `AT*PHONEINFO*RESET`
    Reset,
    /// `AT*PHONEINFO`
    Enter,
    /// A binary command tag
    Command(DiagCommand),
    /// Anything else
    Other,
}

/// Classify the start of a host transfer
///
/// The reset string shares its prefix with the enter string, so it is
/// checked first.
pub fn classify(data: &[u8]) -> HostFrame {
    if data.starts_with(AT_PHONEINFO_RESET) {
        return HostFrame::Reset;
    }
    if data.starts_with(AT_PHONEINFO) {
        return HostFrame::Enter;
    }
    if data.len() >= 4 {
        let tag = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if let Ok(command) = DiagCommand::from_tag(tag) {
            return HostFrame::Command(command);
        }
    }
    HostFrame::Other
}

/// Fixed 16-byte response header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagHeader {
    pub command: u16,
    pub ack_nack: u16,
    pub error_code: u32,
    pub data_length: u32,
    pub reserved: u32,
}

impl DiagHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.ack_nack);
        buf.put_u32_le(self.error_code);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.reserved);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: HEADER_LEN,
                available: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            command: cursor.read_u16::<LittleEndian>()?,
            ack_nack: cursor.read_u16::<LittleEndian>()?,
            error_code: cursor.read_u32::<LittleEndian>()?,
            data_length: cursor.read_u32::<LittleEndian>()?,
            reserved: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Opaque device-info record
///
/// Only the leading version word is interpreted: version 0 means the
/// record was never written (or the partition read failed).
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceInfoBlock(Box<[u8; DEVICE_INFO_LEN]>);

impl DeviceInfoBlock {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DEVICE_INFO_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: DEVICE_INFO_LEN,
                available: data.len(),
            });
        }
        let mut block = Box::new([0u8; DEVICE_INFO_LEN]);
        block.copy_from_slice(&data[..DEVICE_INFO_LEN]);
        Ok(Self(block))
    }

    /// Extract the record from the first sector of the raw partition
    pub fn from_sector(sector: &[u8]) -> Result<Self> {
        let end = DEVICE_INFO_OFFSET + DEVICE_INFO_LEN;
        if sector.len() < end {
            return Err(ProtocolError::BufferTooSmall {
                needed: end,
                available: sector.len(),
            });
        }
        Self::from_bytes(&sector[DEVICE_INFO_OFFSET..end])
    }

    pub fn version(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn is_valid(&self) -> bool {
        self.version() != 0
    }

    /// Model name field, NUL padded on the wire
    pub fn model_name(&self) -> String {
        String::from_utf8_lossy(&self.0[4..20])
            .trim_end_matches('\0')
            .to_string()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for DeviceInfoBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInfoBlock")
            .field("version", &self.version())
            .field("model", &self.model_name())
            .finish()
    }
}

/// Session state of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagState {
    #[default]
    Idle,
    AtResponse,
    PhoneInfo,
    Finish,
}

/// Reply the device owes the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagReply {
    Wait,
    PhoneInfo,
    Finish,
}

/// Outcome of feeding one host frame into a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagAction {
    /// Not part of the exchange; leave the bytes alone
    Pass,
    /// Host asked for a restart
    Restart,
    /// Consume the frame and answer with this reply
    Reply(DiagReply),
}

/// Per-link exchange state machine
#[derive(Debug, Default)]
pub struct DiagSession {
    state: DiagState,
}

impl DiagSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DiagState {
        self.state
    }

    /// Advance the session with one host frame
    ///
    /// Once the host has entered the exchange every frame is answered until
    /// the finish command returns the session to idle.
    pub fn on_frame(&mut self, frame: HostFrame) -> DiagAction {
        match frame {
            HostFrame::Reset => return DiagAction::Restart,
            HostFrame::Enter => self.state = DiagState::AtResponse,
            HostFrame::Command(command)
                if matches!(self.state, DiagState::AtResponse | DiagState::PhoneInfo) =>
            {
                match command {
                    DiagCommand::PhoneInfo => self.state = DiagState::PhoneInfo,
                    DiagCommand::Finish => self.state = DiagState::Finish,
                    _ => {}
                }
            }
            _ => {}
        }

        match self.state {
            DiagState::Idle => DiagAction::Pass,
            DiagState::AtResponse => DiagAction::Reply(DiagReply::Wait),
            DiagState::PhoneInfo => DiagAction::Reply(DiagReply::PhoneInfo),
            DiagState::Finish => {
                self.state = DiagState::Idle;
                DiagAction::Reply(DiagReply::Finish)
            }
        }
    }
}

/// Encode the bytes for a reply
pub fn encode_reply(reply: DiagReply, info: &DeviceInfoBlock) -> Bytes {
    match reply {
        DiagReply::Wait => Bytes::from_static(AT_PHONEINFO_WAIT),
        DiagReply::PhoneInfo => {
            let mut buf = BytesMut::with_capacity(HEADER_LEN + DEVICE_INFO_LEN);
            DiagHeader {
                command: DiagCommand::PhoneInfo as u16,
                data_length: DEVICE_INFO_LEN as u32,
                ..Default::default()
            }
            .encode(&mut buf);
            buf.put_slice(info.as_bytes());
            buf.freeze()
        }
        DiagReply::Finish => {
            let mut buf = BytesMut::with_capacity(HEADER_LEN);
            DiagHeader::default().encode(&mut buf);
            buf.freeze()
        }
    }
}
