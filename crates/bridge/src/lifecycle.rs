//! Port lifecycle: USB attach/detach and peer channel open/close
//!
//! The two sides come and go independently. Every transition bumps the
//! matching generation under the port lock before anything is torn down, so
//! a relay in the middle of a transport call notices on its way back and
//! lets go of what it holds.

use crate::bridge::BridgeInner;
use crate::error::{BridgeError, Result};
use crate::port::PeerLink;
use common::{Endpoint, EventSink, PeerEvent, StatusSink, UsbFunction, WorkItem, WorkKind};
use protocol::ModemLines;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl BridgeInner {
    pub(crate) fn connect(&self, index: usize, usb: Arc<dyn UsbFunction>) -> Result<()> {
        let port = self.port(index)?;
        let _lifecycle = port.lock_lifecycle();

        if port.lock().usb.is_some() {
            return Err(BridgeError::AlreadyAttached(index));
        }

        usb.enable(Endpoint::In).map_err(|e| {
            error!("Port {}: failed to enable IN endpoint: {}", index, e);
            BridgeError::Endpoint(e)
        })?;
        if let Err(e) = usb.enable(Endpoint::Out) {
            error!("Port {}: failed to enable OUT endpoint: {}", index, e);
            let stray = usb.disable(Endpoint::In);
            port.lock().reclaim(Endpoint::In, stray);
            return Err(BridgeError::Endpoint(e));
        }

        let mut state = port.lock();
        state.usb = Some(usb);
        state.usb_generation += 1;
        state.rx_pool.fill();
        state.tx_pool.fill();
        state.counters = Default::default();
        // Whatever the host saw before belongs to another session
        state.lines.host_sent = None;
        let peer_open = state.peer.is_open();
        drop(state);

        info!(
            "Port {}: USB attached (peer {})",
            index,
            if peer_open { "open" } else { "closed" }
        );

        self.schedule(index, WorkKind::HostNotify);
        if peer_open {
            self.start_io(index);
        }
        Ok(())
    }

    pub(crate) fn disconnect(&self, index: usize) -> Result<()> {
        let port = self.port(index)?;
        let _lifecycle = port.lock_lifecycle();

        let mut state = port.lock();
        let Some(usb) = state.usb.take() else {
            return Err(BridgeError::NotAttached(index));
        };
        state.usb_generation += 1;
        state.counters = Default::default();
        state.lines.to_peer = ModemLines::empty();
        state.lines.host_sent = None;
        state.reclaim_pending();
        let peer_open = state.peer.is_open();
        drop(state);

        if peer_open {
            self.schedule(index, WorkKind::PeerNotify);
        }

        let out = usb.disable(Endpoint::Out);
        let inp = usb.disable(Endpoint::In);

        let mut state = port.lock();
        state.reclaim(Endpoint::Out, out);
        state.reclaim(Endpoint::In, inp);
        debug!(
            "Port {}: rx {}/{} free, tx {}/{} free after detach",
            index,
            state.rx_pool.free_len(),
            state.rx_pool.allocated(),
            state.tx_pool.free_len(),
            state.tx_pool.allocated()
        );
        drop(state);

        info!("Port {}: USB detached", index);
        Ok(())
    }

    /// Submit OUT requests and pull whatever the peer already has
    fn start_io(&self, index: usize) {
        self.start_rx(index);
        self.schedule(index, WorkKind::Outbound);
    }

    pub(crate) fn peer_probe(&self, name: &str) -> Result<usize> {
        let port = self.port_by_channel(name)?;
        let index = port.index;

        let mut state = port.lock();
        if !matches!(state.peer, PeerLink::Closed) {
            debug!("Port {}: channel {} already probed", index, name);
            return Ok(index);
        }
        state.peer = PeerLink::Probed;
        state.open_attempts = 0;
        drop(state);

        info!("Port {}: peer channel {} announced", index, name);
        self.queue.schedule_after(
            WorkItem::new(index, WorkKind::PeerOpen),
            self.config.peer.open_delay(),
        );
        Ok(index)
    }

    pub(crate) fn run_peer_open(&self, index: usize) {
        let Ok(port) = self.port(index) else {
            return;
        };
        if !matches!(port.lock().peer, PeerLink::Probed) {
            return;
        }

        let name = port.config.data_channel.as_str();
        let weak = self.self_ref.clone();
        let events: EventSink = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.peer_event(index, event);
            }
        });

        let channel = match self.peer.open(name, events) {
            Ok(channel) => channel,
            Err(e) if e.is_transient() => {
                let mut state = port.lock();
                state.open_attempts += 1;
                let attempts = state.open_attempts;
                if let Some(max) = self.config.peer.max_open_retries
                    && attempts > max
                {
                    error!(
                        "Port {}: giving up on {} after {} attempts: {}",
                        index, name, attempts, e
                    );
                    state.peer = PeerLink::Closed;
                    return;
                }
                drop(state);

                debug!(
                    "Port {}: {} not ready ({}), attempt {}",
                    index, name, e, attempts
                );
                self.queue.schedule_after(
                    WorkItem::new(index, WorkKind::PeerOpen),
                    self.config.peer.open_retry(),
                );
                return;
            }
            Err(e) => {
                error!("Port {}: failed to open {}: {}", index, name, e);
                port.lock().peer = PeerLink::Closed;
                return;
            }
        };

        let channel_id = port.config.control_channel;
        let weak = self.self_ref.clone();
        let status: StatusSink = Arc::new(move |lines| {
            if let Some(inner) = weak.upgrade() {
                inner.peer_modem_status(index, lines);
            }
        });
        let initial = match self.control.open(channel_id, status) {
            Ok(()) => match self.control.get_lines(channel_id) {
                Ok(lines) => Some(lines),
                Err(e) => {
                    warn!("Port {}: failed to read modem lines: {}", index, e);
                    Some(ModemLines::empty())
                }
            },
            Err(e) => {
                warn!(
                    "Port {}: control channel {} unavailable: {}",
                    index, channel_id, e
                );
                None
            }
        };

        let mut state = port.lock();
        if !matches!(state.peer, PeerLink::Probed) {
            debug!("Port {}: {} removed while opening", index, name);
            return;
        }
        state.peer = PeerLink::Open(channel);
        state.peer_generation += 1;
        state.open_attempts = 0;
        state.ctrl_error = initial.is_none();
        // A freshly opened modem starts with every line down
        state.lines.peer_sent = Some(ModemLines::empty());
        if let Some(lines) = initial {
            state.lines.to_host = lines.to_serial_state();
        }
        let attached = state.usb.is_some();
        drop(state);

        info!("Port {}: peer channel {} open", index, name);

        self.schedule(index, WorkKind::PeerNotify);
        if attached {
            self.schedule(index, WorkKind::HostNotify);
            self.start_io(index);
        } else {
            // Nobody to deliver to; don't let the peer back up
            self.schedule(index, WorkKind::Outbound);
        }
    }

    pub(crate) fn peer_remove(&self, name: &str) -> Result<usize> {
        let port = self.port_by_channel(name)?;
        let index = port.index;
        let _lifecycle = port.lock_lifecycle();

        self.queue
            .cancel_delayed(WorkItem::new(index, WorkKind::PeerOpen));

        let mut state = port.lock();
        let was_open = state.peer.is_open();
        state.peer = PeerLink::Closed;
        if !was_open {
            drop(state);
            debug!("Port {}: channel {} withdrawn before open", index, name);
            return Ok(index);
        }
        state.peer_generation += 1;
        state.lines.to_host = Default::default();
        state.lines.peer_sent = None;
        state.reclaim_pending();
        let usb = state.usb.clone();
        drop(state);

        info!("Port {}: peer channel {} closed", index, name);

        if let Some(usb) = usb {
            // Report "no carrier" to the host
            self.schedule(index, WorkKind::HostNotify);

            let out = usb.cancel_all(Endpoint::Out);
            let inp = usb.cancel_all(Endpoint::In);
            let mut state = port.lock();
            state.reclaim(Endpoint::Out, out);
            state.reclaim(Endpoint::In, inp);
        }
        Ok(index)
    }

    pub(crate) fn peer_event(&self, index: usize, event: PeerEvent) {
        if index >= self.ports.len() {
            warn!("Peer event for unknown port {}", index);
            return;
        }
        match event {
            PeerEvent::ReadAvail => self.schedule(index, WorkKind::Outbound),
            PeerEvent::WriteAvail => self.schedule(index, WorkKind::Inbound),
        }
    }
}
