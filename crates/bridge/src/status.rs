//! Per-port status and counters

use crate::bridge::Bridge;
use crate::error::Result;
use crate::port::{InboundState, PeerLink, Port};
use serde::Serialize;
use std::fmt::Write;

/// Snapshot of one port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStatus {
    pub port: usize,
    pub data_channel: String,
    pub control_channel: u8,
    pub usb_attached: bool,
    pub peer_open: bool,
    pub peer_probed: bool,
    pub ctrl_error: bool,
    pub bytes_to_host: u64,
    pub bytes_to_peer: u64,
    /// Modem lines driven towards the peer (`TIOCM_*` bits)
    pub lines_to_peer: u32,
    /// Serial state reported to the host (CDC bits)
    pub lines_to_host: u8,
    pub rx_free: usize,
    pub rx_allocated: usize,
    pub tx_free: usize,
    pub tx_allocated: usize,
    /// OUT requests waiting to be written to the peer
    pub pending: usize,
    pub cursor: usize,
    pub inbound: InboundState,
}

impl PortStatus {
    fn capture(port: &Port) -> Self {
        let state = port.lock();
        Self {
            port: port.index,
            data_channel: port.config.data_channel.clone(),
            control_channel: port.config.control_channel,
            usb_attached: state.usb.is_some(),
            peer_open: state.peer.is_open(),
            peer_probed: matches!(state.peer, PeerLink::Probed),
            ctrl_error: state.ctrl_error,
            bytes_to_host: state.counters.to_host,
            bytes_to_peer: state.counters.to_peer,
            lines_to_peer: state.lines.to_peer.bits(),
            lines_to_host: state.lines.to_host.bits(),
            rx_free: state.rx_pool.free_len(),
            rx_allocated: state.rx_pool.allocated(),
            tx_free: state.tx_pool.free_len(),
            tx_allocated: state.tx_pool.allocated(),
            pending: state.pending.len(),
            cursor: state.cursor,
            inbound: state.inbound,
        }
    }
}

impl Bridge {
    pub fn status(&self, port: usize) -> Result<PortStatus> {
        Ok(PortStatus::capture(self.inner.port(port)?))
    }

    pub fn status_all(&self) -> Vec<PortStatus> {
        self.inner.ports.iter().map(PortStatus::capture).collect()
    }

    /// Human-readable report of every port
    pub fn status_report(&self) -> String {
        let mut out = String::new();
        for s in self.status_all() {
            let _ = writeln!(
                out,
                "port {} ({}, ctrl {})",
                s.port, s.data_channel, s.control_channel
            );
            let _ = writeln!(
                out,
                "  usb: {}  peer: {}{}",
                if s.usb_attached { "attached" } else { "detached" },
                if s.peer_open {
                    "open"
                } else if s.peer_probed {
                    "probed"
                } else {
                    "closed"
                },
                if s.ctrl_error { " (no control)" } else { "" }
            );
            let _ = writeln!(
                out,
                "  bytes to host: {}  bytes to peer: {}",
                s.bytes_to_host, s.bytes_to_peer
            );
            let _ = writeln!(
                out,
                "  lines to peer: {:#05x}  lines to host: {:#04x}",
                s.lines_to_peer, s.lines_to_host
            );
            let _ = writeln!(
                out,
                "  rx pool: {}/{} free  tx pool: {}/{} free",
                s.rx_free, s.rx_allocated, s.tx_free, s.tx_allocated
            );
            let _ = writeln!(
                out,
                "  pending: {}  cursor: {}  inbound: {:?}",
                s.pending, s.cursor, s.inbound
            );
        }
        out
    }

    /// Zero the byte counters of every port
    pub fn reset_counters(&self) {
        for port in &self.inner.ports {
            port.lock().counters = Default::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BridgeConfig;
    use crate::Bridge;
    use common::test_utils::{MockControl, MockPeer};

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig::default(), MockPeer::new(), MockControl::new()).unwrap()
    }

    #[test]
    fn test_status_of_fresh_bridge() {
        let bridge = bridge();
        let status = bridge.status(1).unwrap();
        assert_eq!(status.data_channel, "SDIO_NMEA");
        assert_eq!(status.control_channel, 10);
        assert!(!status.usb_attached);
        assert!(!status.peer_open);
        assert_eq!(status.rx_allocated, 0);
        assert!(bridge.status(2).is_err());
    }

    #[test]
    fn test_report_lists_every_port() {
        let report = bridge().status_report();
        assert!(report.contains("port 0 (SDIO_DUN, ctrl 9)"));
        assert!(report.contains("port 1 (SDIO_NMEA, ctrl 10)"));
        assert!(report.contains("inbound: Idle"));
    }

    #[test]
    fn test_status_serializes() {
        let json = serde_json::to_value(bridge().status(0).unwrap()).unwrap();
        assert_eq!(json["data_channel"], "SDIO_DUN");
        assert_eq!(json["inbound"], "idle");
    }

    #[test]
    fn test_status_all_serializes_every_port() {
        let json = serde_json::to_value(bridge().status_all()).unwrap();
        let ports = json.as_array().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1]["port"], 1);
        assert_eq!(ports[1]["data_channel"], "SDIO_NMEA");
        assert_eq!(ports[1]["usb_attached"], false);
        assert_eq!(ports[1]["peer_open"], false);
        assert_eq!(ports[1]["bytes_to_host"], 0);
    }
}
