//! Shared fixtures for the bridge integration tests

#![allow(dead_code)]

use bridge::{Bridge, BridgeConfig};
use common::test_utils::{MockControl, MockPeer, MockPeerChannel, MockUsb};
use common::{Endpoint, RequestStatus};
use std::sync::Arc;

/// Default configuration with the peer opening as soon as it is announced
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.peer.open_delay_ms = 0;
    config.peer.open_retry_ms = 0;
    config
}

pub struct Harness {
    pub bridge: Bridge,
    pub peer: Arc<MockPeer>,
    pub control: Arc<MockControl>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let peer = MockPeer::new();
        let control = MockControl::new();
        let bridge = Bridge::new(config, peer.clone(), control.clone()).unwrap();
        Self {
            bridge,
            peer,
            control,
        }
    }

    pub fn channel_name(&self, port: usize) -> String {
        self.bridge.config().ports[port].data_channel.clone()
    }

    pub fn attach(&self, port: usize) -> Arc<MockUsb> {
        let usb = MockUsb::new();
        self.bridge.connect(port, usb.clone()).unwrap();
        self.bridge.run_until_idle();
        usb
    }

    pub fn open_peer(&self, port: usize) -> Arc<MockPeerChannel> {
        let name = self.channel_name(port);
        self.bridge.peer_probe(&name).unwrap();
        self.bridge.run_until_idle();
        self.peer.channel(&name)
    }

    /// USB attached and peer open
    pub fn connected(&self, port: usize) -> (Arc<MockUsb>, Arc<MockPeerChannel>) {
        let usb = self.attach(port);
        let channel = self.open_peer(port);
        assert_eq!(usb.queued(Endpoint::Out), self.bridge.config().pool.rx_queue_size);
        (usb, channel)
    }

    /// Play the host writing `data`, one full OUT request at a time
    ///
    /// Returns how many bytes were handed over before the bridge stopped
    /// offering OUT requests.
    pub fn host_send(&self, port: usize, usb: &MockUsb, data: &[u8]) -> usize {
        let mut sent = 0;
        while sent < data.len() {
            let Some(mut request) = usb.take_out() else {
                if self.bridge.run_until_idle() == 0 && usb.queued(Endpoint::Out) == 0 {
                    break;
                }
                continue;
            };
            sent += request.fill(&data[sent..]);
            self.bridge.out_complete(port, request, RequestStatus::Ok);
        }
        self.bridge.run_until_idle();
        sent
    }

    /// Play the host reading every IN request until the bridge runs dry
    pub fn host_receive(&self, port: usize, usb: &MockUsb) -> Vec<u8> {
        let mut received = Vec::new();
        loop {
            self.bridge.run_until_idle();
            let Some(request) = usb.take_in() else {
                break;
            };
            received.extend_from_slice(request.data());
            self.bridge.in_complete(port, request, RequestStatus::Ok);
        }
        received
    }
}
