//! Loopback self-test
//!
//! Runs the bridge on its worker pool against in-memory collaborators, with
//! one simulated host per port, and checks that a random payload arrives
//! intact in both directions.

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::status::PortStatus;
use anyhow::{Context, Result, bail};
use common::test_utils::{MockControl, MockPeer, MockPeerChannel, MockUsb};
use common::RequestStatus;
use rand::Rng;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a self-test may take before it counts as stalled
const SELFTEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Peer data is offered in chunks of this size
const PEER_CHUNK: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct SelftestReport {
    pub bytes_per_direction: usize,
    pub elapsed_ms: u128,
    pub ports: Vec<PortStatus>,
}

pub fn run_selftest(config: &BridgeConfig, bytes: usize) -> Result<SelftestReport> {
    let mut config = config.clone();
    config.peer.open_delay_ms = 0;
    config.diag.enabled = false;

    let peer = MockPeer::new();
    let control = MockControl::new();
    let bridge = Bridge::new(config.clone(), peer.clone(), control)
        .context("Failed to build bridge")?;
    let workers = bridge
        .spawn_workers(config.bridge.workers)
        .context("Failed to start workers")?;

    let mut payload = vec![0u8; bytes];
    rand::rng().fill(&mut payload[..]);

    let started = Instant::now();
    let mut hosts = Vec::new();
    for (index, port) in config.ports.iter().enumerate() {
        let usb = MockUsb::new();
        bridge.connect(index, usb.clone())?;
        bridge.peer_probe(&port.data_channel)?;
        let channel = peer.channel(&port.data_channel);

        let bridge = bridge.clone();
        let payload = payload.clone();
        let handle = std::thread::Builder::new()
            .name(format!("selftest-host-{}", index))
            .spawn(move || simulate_host(&bridge, index, &usb, &channel, &payload))?;
        hosts.push(handle);
    }

    let mut failure = None;
    for handle in hosts {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failure = Some(e),
            Err(_) => failure = Some(anyhow::anyhow!("Simulated host panicked")),
        }
    }

    // Let the last relay runs settle their counters
    let deadline = Instant::now() + SELFTEST_TIMEOUT;
    while !bridge.is_idle() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    let report = SelftestReport {
        bytes_per_direction: bytes,
        elapsed_ms: started.elapsed().as_millis(),
        ports: bridge.status_all(),
    };

    for index in 0..bridge.port_count() {
        bridge.disconnect(index)?;
    }
    workers.shutdown();

    if let Some(e) = failure {
        return Err(e);
    }
    info!(
        "Self-test moved {} bytes each way on {} ports in {} ms",
        bytes,
        report.ports.len(),
        report.elapsed_ms
    );
    Ok(report)
}

/// Play the USB host for one port until the payload went through both ways
fn simulate_host(
    bridge: &Bridge,
    index: usize,
    usb: &MockUsb,
    channel: &MockPeerChannel,
    payload: &[u8],
) -> Result<()> {
    let deadline = Instant::now() + SELFTEST_TIMEOUT;

    while !bridge.status(index)?.peer_open {
        if Instant::now() > deadline {
            bail!("Port {}: peer channel never opened", index);
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut sent = 0;
    let mut offered = 0;
    let mut received = Vec::with_capacity(payload.len());

    while sent < payload.len()
        || received.len() < payload.len()
        || channel.written_len() < payload.len()
    {
        if Instant::now() > deadline {
            bail!(
                "Port {}: stalled (sent {}, peer got {}, host got {})",
                index,
                sent,
                channel.written_len(),
                received.len()
            );
        }

        let mut progressed = false;

        if sent < payload.len()
            && let Some(mut request) = usb.take_out()
        {
            sent += request.fill(&payload[sent..]);
            bridge.out_complete(index, request, RequestStatus::Ok);
            progressed = true;
        }

        if offered < payload.len() && channel.readable_len() < PEER_CHUNK {
            let end = payload.len().min(offered + PEER_CHUNK);
            channel.push_readable(&payload[offered..end]);
            offered = end;
            progressed = true;
        }

        if let Some(request) = usb.take_in() {
            received.extend_from_slice(request.data());
            bridge.in_complete(index, request, RequestStatus::Ok);
            progressed = true;
        }

        if !progressed {
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    if channel.written() != payload {
        bail!("Port {}: host to peer data corrupted", index);
    }
    if received != payload {
        bail!("Port {}: peer to host data corrupted", index);
    }
    debug!("Port {}: loopback verified", index);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selftest_passes_on_default_config() {
        let report = run_selftest(&BridgeConfig::default(), 10_000).unwrap();
        assert_eq!(report.ports.len(), 2);
        assert!(report.ports.iter().all(|p| p.peer_open));
        assert!(report.ports.iter().all(|p| p.bytes_to_peer == 10_000));
        assert!(report.ports.iter().all(|p| p.bytes_to_host == 10_000));
    }
}
