//! Per-port state
//!
//! All mutable state of a port lives behind one mutex. Relays take it, pick
//! what they need, drop it around every transport call and take it again
//! before touching shared state. The two generation counters let them tell
//! whether the USB side or the peer side was replaced in between.

use crate::config::{PoolSettings, PortConfig};
use crate::interceptor::StreamInterceptor;
use crate::pool::RequestPool;
use common::{Endpoint, PeerChannel, Request, UsbFunction};
use protocol::{ModemLines, SerialState};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Inbound relay progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundState {
    #[default]
    Idle,
    /// Writing queued requests to the peer
    Draining,
    /// Head request partly written, waiting for peer space
    Partial,
}

/// Peer side of a port
#[derive(Clone, Default)]
pub(crate) enum PeerLink {
    #[default]
    Closed,
    /// Announced by the transport, open pending
    Probed,
    Open(Arc<dyn PeerChannel>),
}

impl PeerLink {
    pub fn channel(&self) -> Option<Arc<dyn PeerChannel>> {
        match self {
            Self::Open(channel) => Some(channel.clone()),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

/// Control-line shadow state
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LineState {
    /// Latest lines the host asked the modem to see
    pub to_peer: ModemLines,
    /// Last lines actually written to the control channel
    pub peer_sent: Option<ModemLines>,
    /// Latest modem status, in host encoding
    pub to_host: SerialState,
    /// Last serial state actually sent to the host
    pub host_sent: Option<SerialState>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub to_host: u64,
    pub to_peer: u64,
}

pub(crate) struct PortState {
    pub usb: Option<Arc<dyn UsbFunction>>,
    pub usb_generation: u64,
    pub peer: PeerLink,
    pub peer_generation: u64,
    /// Control channel failed to open; lines are not pushed to the modem
    pub ctrl_error: bool,
    pub open_attempts: u32,

    pub rx_pool: RequestPool,
    /// Completed OUT requests waiting to be written to the peer
    pub pending: VecDeque<Request>,
    /// Bytes of the head of `pending` the peer already accepted
    pub cursor: usize,
    pub inbound: InboundState,

    pub tx_pool: RequestPool,

    pub lines: LineState,
    pub counters: Counters,
    pub interceptor: Option<Arc<dyn StreamInterceptor>>,
}

impl PortState {
    fn new(pool: &PoolSettings) -> Self {
        Self {
            usb: None,
            usb_generation: 0,
            peer: PeerLink::Closed,
            peer_generation: 0,
            ctrl_error: false,
            open_attempts: 0,
            rx_pool: RequestPool::new("rx", pool.rx_queue_size, pool.rx_buf_size),
            pending: VecDeque::new(),
            cursor: 0,
            inbound: InboundState::Idle,
            tx_pool: RequestPool::new("tx", pool.tx_queue_size, pool.tx_buf_size),
            lines: LineState::default(),
            counters: Counters::default(),
            interceptor: None,
        }
    }

    /// Identity of the current USB and peer attachments
    pub fn generations(&self) -> (u64, u64) {
        (self.usb_generation, self.peer_generation)
    }

    /// Relays may move data only when both sides are present
    pub fn is_connected(&self) -> bool {
        self.usb.is_some() && self.peer.is_open()
    }

    /// Return every request waiting for the peer to its pool
    pub fn reclaim_pending(&mut self) {
        while let Some(req) = self.pending.pop_front() {
            self.rx_pool.release(req);
        }
        self.cursor = 0;
        self.inbound = InboundState::Idle;
    }

    /// Return requests handed back by the USB function to their pools
    pub fn reclaim(&mut self, ep: Endpoint, requests: Vec<Request>) {
        let pool = match ep {
            Endpoint::Out => &mut self.rx_pool,
            Endpoint::In => &mut self.tx_pool,
        };
        for req in requests {
            pool.release(req);
        }
    }
}

pub(crate) struct Port {
    pub index: usize,
    pub config: PortConfig,
    /// Serializes attach, detach and peer teardown
    pub lifecycle: Mutex<()>,
    state: Mutex<PortState>,
}

impl Port {
    pub fn new(index: usize, config: PortConfig, pool: &PoolSettings) -> Self {
        Self {
            index,
            config,
            lifecycle: Mutex::new(()),
            state: Mutex::new(PortState::new(pool)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
