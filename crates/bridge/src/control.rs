//! Control-line bridge
//!
//! Host DTR goes to the modem through the control channel; modem carrier,
//! ring and DSR go to the host as `SERIAL_STATE` notifications. Each
//! direction keeps the latest value and the last value actually delivered,
//! and only talks to the transport when the two differ.

use crate::bridge::BridgeInner;
use crate::error::Result;
use common::WorkKind;
use protocol::{HostLines, ModemLines};
use tracing::{debug, trace, warn};

impl BridgeInner {
    pub(crate) fn host_lines_changed(&self, index: usize, lines: HostLines) -> Result<()> {
        let port = self.port(index)?;
        let to_peer = ModemLines::from_host(lines);

        let mut state = port.lock();
        if state.lines.to_peer == to_peer {
            trace!("Port {}: host lines unchanged ({})", index, to_peer);
            return Ok(());
        }
        state.lines.to_peer = to_peer;

        if !state.peer.is_open() {
            return Ok(());
        }

        // A host raising DTR has just opened the tty and wants to see the
        // modem status again
        if lines.contains(HostLines::DTR) && state.usb.is_some() {
            state.lines.host_sent = None;
            self.schedule(index, WorkKind::HostNotify);
        }
        drop(state);

        self.schedule(index, WorkKind::PeerNotify);
        Ok(())
    }

    pub(crate) fn run_peer_notify(&self, index: usize) {
        let Ok(port) = self.port(index) else {
            return;
        };

        let mut state = port.lock();
        if !state.peer.is_open() || state.ctrl_error {
            return;
        }
        let lines = state.lines.to_peer;
        if state.lines.peer_sent == Some(lines) {
            return;
        }
        let peer_generation = state.peer_generation;
        drop(state);

        let channel_id = port.config.control_channel;
        let result = self.control.set_lines(channel_id, lines, !lines);

        let mut state = port.lock();
        if state.peer_generation != peer_generation {
            return;
        }
        match result {
            Ok(()) => {
                debug!("Port {}: modem lines set to {}", index, lines);
                state.lines.peer_sent = Some(lines);
            }
            Err(e) => {
                warn!("Port {}: failed to set modem lines: {}", index, e);
                state.lines.peer_sent = None;
            }
        }
    }

    pub(crate) fn peer_modem_status(&self, index: usize, lines: ModemLines) {
        let Ok(port) = self.port(index) else {
            warn!("Modem status for unknown port {}", index);
            return;
        };

        let mut state = port.lock();
        state.lines.to_host = lines.to_serial_state();
        let attached = state.usb.is_some();
        drop(state);

        trace!("Port {}: modem status {}", index, lines);
        if attached {
            self.schedule(index, WorkKind::HostNotify);
        }
    }

    pub(crate) fn run_host_notify(&self, index: usize) {
        let Ok(port) = self.port(index) else {
            return;
        };

        let mut state = port.lock();
        let Some(usb) = state.usb.clone() else {
            return;
        };
        let serial = state.lines.to_host;
        if state.lines.host_sent == Some(serial) {
            return;
        }
        let usb_generation = state.usb_generation;
        drop(state);

        let result = usb.send_serial_state(serial);

        let mut state = port.lock();
        if state.usb_generation != usb_generation {
            return;
        }
        match result {
            Ok(()) => {
                debug!("Port {}: serial state {} sent to host", index, serial);
                state.lines.host_sent = Some(serial);
            }
            Err(e) => {
                debug!("Port {}: serial state notification failed: {}", index, e);
                state.lines.host_sent = None;
            }
        }
    }
}
