//! Inbound relay: USB OUT completions to the peer channel
//!
//! Completed OUT requests queue up in `pending`. The relay writes the head
//! request to the peer, as much as the peer has room for, and remembers how
//! far it got in `cursor`. A request leaves the queue only once every byte
//! was accepted, so a slow peer never causes reordering or loss.

use crate::bridge::BridgeInner;
use crate::interceptor::Verdict;
use crate::port::InboundState;
use common::{Endpoint, Rejected, Request, RequestStatus, WorkKind};
use tracing::{debug, trace, warn};

enum Step {
    /// Head request fully written; look at the next one
    Next,
    /// Nothing more to do until the next event
    Stop,
    /// Head request partly written and the peer reported space left
    Yield,
}

impl BridgeInner {
    pub(crate) fn out_complete(&self, index: usize, mut request: Request, status: RequestStatus) {
        let Ok(port) = self.port(index) else {
            warn!("OUT completion for unknown port {}", index);
            return;
        };

        request.set_status(status);
        let mut state = port.lock();

        if state.usb.is_none() || request.generation() != state.usb_generation {
            trace!("Port {}: stale OUT completion {:?}", index, request.id());
            state.rx_pool.release(request);
            return;
        }

        match status {
            RequestStatus::Ok if !request.is_empty() => {
                trace!(
                    "Port {}: OUT {:?} completed with {} bytes",
                    index,
                    request.id(),
                    request.len()
                );
                state.pending.push_back(request);
            }
            RequestStatus::Ok => state.rx_pool.release(request),
            status if status.is_aborted() => {
                trace!("Port {}: OUT {:?} aborted", index, request.id());
                state.rx_pool.release(request);
                return;
            }
            _ => {
                warn!("Port {}: OUT {:?} failed: {:?}", index, request.id(), status);
                state.rx_pool.release(request);
            }
        }
        drop(state);

        // Also resubmits whatever was just released
        self.schedule(index, WorkKind::Inbound);
    }

    pub(crate) fn run_inbound(&self, index: usize) {
        let Ok(port) = self.port(index) else {
            return;
        };

        loop {
            match self.inbound_step(index) {
                Step::Next => continue,
                Step::Stop => break,
                Step::Yield => {
                    self.schedule(index, WorkKind::Inbound);
                    break;
                }
            }
        }

        {
            let mut state = port.lock();
            if state.inbound == InboundState::Draining {
                state.inbound = if state.cursor > 0 {
                    InboundState::Partial
                } else {
                    InboundState::Idle
                };
            }
        }

        self.start_rx(index);
    }

    /// Write (part of) the head request to the peer
    fn inbound_step(&self, index: usize) -> Step {
        let port = &self.ports[index];

        let mut state = port.lock();
        let Some(channel) = state.peer.channel() else {
            if !state.pending.is_empty() {
                debug!("Port {}: peer closed, dropping queued host data", index);
            }
            state.reclaim_pending();
            return Step::Stop;
        };
        let Some(mut request) = state.pending.pop_front() else {
            state.inbound = InboundState::Idle;
            return Step::Stop;
        };
        state.inbound = InboundState::Draining;
        let generations = state.generations();
        let cursor = state.cursor;
        let interceptor = if cursor == 0 && !request.is_inspected() {
            state.interceptor.clone()
        } else {
            None
        };
        drop(state);

        if let Some(interceptor) = interceptor {
            match interceptor.inspect(index, request.data()) {
                Verdict::Forward => request.mark_inspected(),
                Verdict::Consume { reply } => {
                    port.lock().rx_pool.release(request);
                    if let Some(reply) = reply {
                        self.send_to_host(index, &reply);
                    }
                    return Step::Next;
                }
            }
        }

        let avail = channel.write_avail();
        let result = if avail == 0 {
            Ok(0)
        } else {
            let end = request.len().min(cursor.saturating_add(avail));
            channel.write(&request.data()[cursor..end])
        };

        let mut state = port.lock();
        if state.generations() != generations {
            // Detached or closed while we held the request; the queue and
            // cursor were reset without it
            debug!("Port {}: transport changed during write", index);
            state.rx_pool.release(request);
            return Step::Next;
        }

        match result {
            Ok(0) => {
                trace!("Port {}: peer has no write space", index);
                state.pending.push_front(request);
                Step::Stop
            }
            Ok(written) => {
                state.counters.to_peer += written as u64;
                let done = cursor + written;
                if done >= request.len() {
                    state.cursor = 0;
                    state.rx_pool.release(request);
                    Step::Next
                } else {
                    state.cursor = done;
                    state.pending.push_front(request);
                    state.inbound = InboundState::Partial;
                    drop(state);
                    if channel.write_avail() > 0 {
                        Step::Yield
                    } else {
                        Step::Stop
                    }
                }
            }
            Err(e) => {
                debug!("Port {}: peer write failed: {}", index, e);
                state.pending.push_front(request);
                Step::Stop
            }
        }
    }

    /// Keep every free OUT request submitted while both sides are up
    pub(crate) fn start_rx(&self, index: usize) {
        let port = &self.ports[index];

        loop {
            let mut state = port.lock();
            if !state.is_connected() {
                return;
            }
            let Some(usb) = state.usb.clone() else {
                return;
            };
            let Some(mut request) = state.rx_pool.acquire() else {
                return;
            };
            request.set_generation(state.usb_generation);
            drop(state);

            if let Err(Rejected { error, request }) = usb.submit(Endpoint::Out, request) {
                debug!("Port {}: OUT submit failed: {}", index, error);
                port.lock().rx_pool.release(request);
                return;
            }
        }
    }

    /// Queue `data` on the IN endpoint, bypassing the peer
    pub(crate) fn send_to_host(&self, index: usize, data: &[u8]) -> usize {
        let port = &self.ports[index];
        let mut sent = 0;

        while sent < data.len() {
            let mut state = port.lock();
            let Some(usb) = state.usb.clone() else {
                break;
            };
            let Some(mut request) = state.tx_pool.acquire() else {
                warn!(
                    "Port {}: no IN request for reply, dropping {} bytes",
                    index,
                    data.len() - sent
                );
                break;
            };
            request.set_generation(state.usb_generation);
            drop(state);

            let n = request.fill(&data[sent..]);
            match usb.submit(Endpoint::In, request) {
                Ok(()) => {
                    port.lock().counters.to_host += n as u64;
                    sent += n;
                }
                Err(Rejected { error, request }) => {
                    debug!("Port {}: reply submit failed: {}", index, error);
                    port.lock().tx_pool.release(request);
                    break;
                }
            }
        }
        sent
    }
}
