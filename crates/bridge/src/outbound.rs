//! Outbound relay: peer channel data to USB IN requests

use crate::bridge::BridgeInner;
use common::{Endpoint, PeerChannel, Rejected, Request, RequestStatus, WorkKind};
use tracing::{debug, trace, warn};

/// Chunk size used to discard peer data nobody can receive
const DISCARD_CHUNK: usize = 1024;

impl BridgeInner {
    pub(crate) fn in_complete(&self, index: usize, request: Request, status: RequestStatus) {
        let Ok(port) = self.port(index) else {
            warn!("IN completion for unknown port {}", index);
            return;
        };

        let mut state = port.lock();
        let current = state.usb.is_some() && request.generation() == state.usb_generation;
        state.tx_pool.release(request);
        drop(state);

        match status {
            status if status.is_aborted() => trace!("Port {}: IN request aborted", index),
            RequestStatus::Error => debug!("Port {}: IN request failed", index),
            _ => {}
        }

        // A freed request may be all the relay was waiting for
        if current && !status.is_aborted() {
            self.schedule(index, WorkKind::Outbound);
        }
    }

    pub(crate) fn run_outbound(&self, index: usize) {
        let Ok(port) = self.port(index) else {
            return;
        };

        let (channel, attached) = {
            let state = port.lock();
            let Some(channel) = state.peer.channel() else {
                return;
            };
            (channel, state.usb.is_some())
        };

        if !attached {
            self.discard_peer_input(index, channel.as_ref());
            return;
        }

        loop {
            let mut state = port.lock();
            if !state.is_connected() {
                break;
            }
            // Re-read every pass: the function may have been swapped during
            // the previous submit
            let (Some(usb), Some(channel)) = (state.usb.clone(), state.peer.channel()) else {
                break;
            };
            let Some(mut request) = state.tx_pool.acquire() else {
                trace!("Port {}: IN pool empty", index);
                break;
            };
            let generations = state.generations();
            request.set_generation(state.usb_generation);
            drop(state);

            let avail = channel.read_avail();
            let result = if avail == 0 {
                Ok(0)
            } else {
                let want = avail.min(request.capacity());
                channel.read(&mut request.buf_mut()[..want])
            };

            let read = match result {
                Ok(0) => {
                    // Nothing there after all; never submit an empty frame
                    port.lock().tx_pool.release(request);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Port {}: peer read failed: {}", index, e);
                    port.lock().tx_pool.release(request);
                    break;
                }
            };
            request.set_len(read);

            let mut state = port.lock();
            if state.generations() != generations {
                debug!(
                    "Port {}: transport changed during read, dropping {} bytes",
                    index, read
                );
                state.tx_pool.release(request);
                break;
            }
            drop(state);

            match usb.submit(Endpoint::In, request) {
                Ok(()) => {
                    let mut state = port.lock();
                    if state.generations() == generations {
                        state.counters.to_host += read as u64;
                    }
                }
                Err(Rejected { error, request }) => {
                    if error.is_transient() {
                        debug!("Port {}: IN submit failed: {}", index, error);
                    } else {
                        warn!(
                            "Port {}: USB side gone, dropping {} bytes from peer",
                            index, read
                        );
                    }
                    port.lock().tx_pool.release(request);
                    break;
                }
            }
        }
    }

    /// Read and drop everything the peer has while no host is attached
    fn discard_peer_input(&self, index: usize, channel: &dyn PeerChannel) {
        let mut scratch = [0u8; DISCARD_CHUNK];
        let mut dropped = 0usize;

        while channel.read_avail() > 0 {
            match channel.read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(n) => dropped += n,
            }
        }

        if dropped > 0 {
            debug!("Port {}: no USB host, discarded {} bytes", index, dropped);
        }
    }
}
