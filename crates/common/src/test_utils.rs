//! Test utilities for gser-sdio-bridge
//!
//! In-memory stand-ins for the three collaborators the bridge sits between,
//! plus helpers shared by the test suites and the loopback self-test.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockPeer, pattern_bytes};
//! use common::{PeerChannel, PeerEvent, PeerTransport};
//! use std::sync::Arc;
//!
//! let peer = MockPeer::new();
//! let channel = peer.open("SDIO_DUN", Arc::new(|_: PeerEvent| {})).unwrap();
//! assert_eq!(channel.write(&pattern_bytes(10)).unwrap(), 10);
//! assert_eq!(peer.channel("SDIO_DUN").written(), pattern_bytes(10));
//! ```

use crate::error::TransportError;
use crate::request::{Request, RequestStatus};
use crate::transport::{
    ControlChannel, Endpoint, EventSink, PeerChannel, PeerEvent, PeerTransport, Rejected,
    StatusSink, UsbFunction,
};
use protocol::{ModemLines, SerialState};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Write space a mock channel reports when no limit is configured
pub const UNLIMITED_SPACE: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic, non-repeating-at-small-scale payload
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// USB function
// ============================================================================

#[derive(Default)]
struct UsbState {
    in_enabled: bool,
    out_enabled: bool,
    queued_in: VecDeque<Request>,
    queued_out: VecDeque<Request>,
    in_lengths: Vec<usize>,
    serial_states: Vec<SerialState>,
    fail_enable: Option<Endpoint>,
    reject_submits: Option<TransportError>,
    fail_serial_state: bool,
}

/// A USB serial function whose endpoints are plain queues
///
/// Tests play the host: take OUT requests, fill them and report them
/// complete to the bridge; take IN requests, read them and report them
/// complete.
#[derive(Default)]
pub struct MockUsb {
    state: Mutex<UsbState>,
}

impl MockUsb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `enable` of `ep` fail
    pub fn fail_enable(&self, ep: Endpoint) {
        lock(&self.state).fail_enable = Some(ep);
    }

    /// Reject every submit with `error` until cleared
    pub fn set_reject_submits(&self, error: Option<TransportError>) {
        lock(&self.state).reject_submits = error;
    }

    pub fn set_fail_serial_state(&self, fail: bool) {
        lock(&self.state).fail_serial_state = fail;
    }

    pub fn is_enabled(&self, ep: Endpoint) -> bool {
        let state = lock(&self.state);
        match ep {
            Endpoint::In => state.in_enabled,
            Endpoint::Out => state.out_enabled,
        }
    }

    /// Oldest request queued on the OUT endpoint
    pub fn take_out(&self) -> Option<Request> {
        lock(&self.state).queued_out.pop_front()
    }

    /// Oldest request queued on the IN endpoint
    pub fn take_in(&self) -> Option<Request> {
        lock(&self.state).queued_in.pop_front()
    }

    pub fn queued(&self, ep: Endpoint) -> usize {
        let state = lock(&self.state);
        match ep {
            Endpoint::In => state.queued_in.len(),
            Endpoint::Out => state.queued_out.len(),
        }
    }

    /// Length of every IN submission so far
    pub fn in_lengths(&self) -> Vec<usize> {
        lock(&self.state).in_lengths.clone()
    }

    /// Every serial state notification sent so far
    pub fn serial_states(&self) -> Vec<SerialState> {
        lock(&self.state).serial_states.clone()
    }

    fn drain(queue: &mut VecDeque<Request>, status: RequestStatus) -> Vec<Request> {
        queue
            .drain(..)
            .map(|mut req| {
                req.set_status(status);
                req
            })
            .collect()
    }
}

impl UsbFunction for MockUsb {
    fn enable(&self, ep: Endpoint) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_enable == Some(ep) {
            state.fail_enable = None;
            return Err(TransportError::NoDevice);
        }
        match ep {
            Endpoint::In => state.in_enabled = true,
            Endpoint::Out => state.out_enabled = true,
        }
        Ok(())
    }

    fn disable(&self, ep: Endpoint) -> Vec<Request> {
        let mut state = lock(&self.state);
        match ep {
            Endpoint::In => {
                state.in_enabled = false;
                Self::drain(&mut state.queued_in, RequestStatus::Shutdown)
            }
            Endpoint::Out => {
                state.out_enabled = false;
                Self::drain(&mut state.queued_out, RequestStatus::Shutdown)
            }
        }
    }

    fn submit(&self, ep: Endpoint, request: Request) -> Result<(), Rejected> {
        let mut state = lock(&self.state);
        let enabled = match ep {
            Endpoint::In => state.in_enabled,
            Endpoint::Out => state.out_enabled,
        };
        if !enabled {
            return Err(Rejected {
                error: TransportError::Shutdown,
                request,
            });
        }
        if let Some(error) = state.reject_submits.clone() {
            return Err(Rejected { error, request });
        }
        match ep {
            Endpoint::In => {
                state.in_lengths.push(request.len());
                state.queued_in.push_back(request);
            }
            Endpoint::Out => state.queued_out.push_back(request),
        }
        Ok(())
    }

    fn cancel_all(&self, ep: Endpoint) -> Vec<Request> {
        let mut state = lock(&self.state);
        match ep {
            Endpoint::In => Self::drain(&mut state.queued_in, RequestStatus::Cancelled),
            Endpoint::Out => Self::drain(&mut state.queued_out, RequestStatus::Cancelled),
        }
    }

    fn send_serial_state(&self, serial: SerialState) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_serial_state {
            return Err(TransportError::Busy);
        }
        state.serial_states.push(serial);
        Ok(())
    }
}

// ============================================================================
// Peer channels
// ============================================================================

type WriteHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ChannelState {
    written: Vec<u8>,
    write_chunk: Option<usize>,
    write_space: Option<usize>,
    reported_write_avail: Option<usize>,
    readable: VecDeque<u8>,
    phantom_avail: usize,
    fail_writes: usize,
    fail_reads: usize,
    write_calls: usize,
    read_calls: usize,
    events: Option<EventSink>,
}

/// One named byte-stream channel of [`MockPeer`]
#[derive(Default)]
pub struct MockPeerChannel {
    state: Mutex<ChannelState>,
    on_write: Mutex<Option<WriteHook>>,
}

impl MockPeerChannel {
    /// Everything the bridge has written so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn written_len(&self) -> usize {
        lock(&self.state).written.len()
    }

    /// Accept at most `chunk` bytes per write call
    pub fn set_write_chunk(&self, chunk: Option<usize>) {
        lock(&self.state).write_chunk = chunk;
    }

    /// Limit the total write space; `None` means unlimited
    pub fn set_write_space(&self, space: Option<usize>) {
        lock(&self.state).write_space = space;
    }

    /// Free up `bytes` of write space and signal it
    pub fn grant_write_space(&self, bytes: usize) {
        let sink = {
            let mut state = lock(&self.state);
            state.write_space = Some(state.write_space.unwrap_or(0) + bytes);
            state.events.clone()
        };
        if let Some(sink) = sink {
            sink(PeerEvent::WriteAvail);
        }
    }

    /// Queue bytes for the bridge to read and signal them
    pub fn push_readable(&self, data: &[u8]) {
        let sink = {
            let mut state = lock(&self.state);
            state.readable.extend(data.iter().copied());
            state.events.clone()
        };
        if let Some(sink) = sink {
            sink(PeerEvent::ReadAvail);
        }
    }

    /// Report `bytes` more readable than a read will actually return
    pub fn set_phantom_read_avail(&self, bytes: usize) {
        lock(&self.state).phantom_avail = bytes;
    }

    /// Report `avail` as write space no matter how much writes accept
    pub fn set_reported_write_avail(&self, avail: Option<usize>) {
        lock(&self.state).reported_write_avail = avail;
    }

    pub fn fail_next_writes(&self, count: usize) {
        lock(&self.state).fail_writes = count;
    }

    pub fn fail_next_reads(&self, count: usize) {
        lock(&self.state).fail_reads = count;
    }

    pub fn write_calls(&self) -> usize {
        lock(&self.state).write_calls
    }

    pub fn read_calls(&self) -> usize {
        lock(&self.state).read_calls
    }

    pub fn readable_len(&self) -> usize {
        lock(&self.state).readable.len()
    }

    /// Run `hook` right after the next successful write returns its count
    pub fn on_next_write(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.on_write) = Some(Box::new(hook));
    }

    /// Fire an event as if the transport raised it
    pub fn signal(&self, event: PeerEvent) {
        let sink = lock(&self.state).events.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    fn attach(&self, events: EventSink) {
        lock(&self.state).events = Some(events);
    }
}

impl PeerChannel for MockPeerChannel {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let accepted = {
            let mut state = lock(&self.state);
            state.write_calls += 1;
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(TransportError::Io("write failed".into()));
            }
            let mut n = data.len();
            if let Some(chunk) = state.write_chunk {
                n = n.min(chunk);
            }
            if let Some(space) = state.write_space {
                n = n.min(space);
                state.write_space = Some(space - n);
            }
            state.written.extend_from_slice(&data[..n]);
            n
        };

        // Outside the lock so the hook can call back into the bridge
        let hook = lock(&self.on_write).take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(accepted)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = lock(&self.state);
        state.read_calls += 1;
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(TransportError::Io("read failed".into()));
        }
        if state.readable.is_empty() {
            state.phantom_avail = 0;
            return Ok(0);
        }
        let n = buf.len().min(state.readable.len());
        for (slot, byte) in buf.iter_mut().zip(state.readable.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_avail(&self) -> usize {
        let state = lock(&self.state);
        state
            .reported_write_avail
            .or(state.write_space)
            .unwrap_or(UNLIMITED_SPACE)
    }

    fn read_avail(&self) -> usize {
        let state = lock(&self.state);
        state.readable.len() + state.phantom_avail
    }
}

#[derive(Default)]
struct PeerState {
    channels: HashMap<String, Arc<MockPeerChannel>>,
    not_ready: HashMap<String, usize>,
    failures: HashMap<String, TransportError>,
    opens: HashMap<String, usize>,
}

/// Peer transport handing out [`MockPeerChannel`]s by name
#[derive(Default)]
pub struct MockPeer {
    state: Mutex<PeerState>,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The channel called `name`, created on first use
    pub fn channel(&self, name: &str) -> Arc<MockPeerChannel> {
        lock(&self.state)
            .channels
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Answer the next `times` opens of `name` with `NotReady`
    pub fn set_not_ready(&self, name: &str, times: usize) {
        lock(&self.state).not_ready.insert(name.to_string(), times);
    }

    /// Fail every open of `name` with `error`
    pub fn fail_open(&self, name: &str, error: TransportError) {
        lock(&self.state).failures.insert(name.to_string(), error);
    }

    /// Open attempts for `name`, failed ones included
    pub fn open_count(&self, name: &str) -> usize {
        lock(&self.state).opens.get(name).copied().unwrap_or(0)
    }
}

impl PeerTransport for MockPeer {
    fn open(&self, name: &str, events: EventSink) -> Result<Arc<dyn PeerChannel>, TransportError> {
        let channel = {
            let mut state = lock(&self.state);
            *state.opens.entry(name.to_string()).or_default() += 1;

            if let Some(remaining) = state.not_ready.get_mut(name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(TransportError::NotReady);
            }
            if let Some(error) = state.failures.get(name) {
                return Err(error.clone());
            }
            state
                .channels
                .entry(name.to_string())
                .or_default()
                .clone()
        };

        channel.attach(events);
        Ok(channel)
    }
}

// ============================================================================
// Control channel
// ============================================================================

#[derive(Default)]
struct ControlState {
    status: HashMap<u8, ModemLines>,
    outgoing: HashMap<u8, ModemLines>,
    set_calls: Vec<(u8, ModemLines, ModemLines)>,
    sinks: HashMap<u8, StatusSink>,
    fail_open: Vec<u8>,
    fail_set: bool,
}

/// Control multiplexer that records every line change
#[derive(Default)]
pub struct MockControl {
    state: Mutex<ControlState>,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Change the modem status of `channel_id` and notify the opener
    pub fn set_peer_lines(&self, channel_id: u8, lines: ModemLines) {
        let sink = {
            let mut state = lock(&self.state);
            state.status.insert(channel_id, lines);
            state.sinks.get(&channel_id).cloned()
        };
        if let Some(sink) = sink {
            sink(lines);
        }
    }

    pub fn fail_open(&self, channel_id: u8) {
        lock(&self.state).fail_open.push(channel_id);
    }

    pub fn set_fail_set_lines(&self, fail: bool) {
        lock(&self.state).fail_set = fail;
    }

    pub fn is_open(&self, channel_id: u8) -> bool {
        lock(&self.state).sinks.contains_key(&channel_id)
    }

    /// Every `set_lines` call as (channel, set, clear)
    pub fn set_calls(&self) -> Vec<(u8, ModemLines, ModemLines)> {
        lock(&self.state).set_calls.clone()
    }

    /// Lines the bridge currently drives towards the modem
    pub fn outgoing(&self, channel_id: u8) -> ModemLines {
        lock(&self.state)
            .outgoing
            .get(&channel_id)
            .copied()
            .unwrap_or_default()
    }
}

impl ControlChannel for MockControl {
    fn open(&self, channel_id: u8, status: StatusSink) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_open.contains(&channel_id) {
            return Err(TransportError::NoDevice);
        }
        state.sinks.insert(channel_id, status);
        Ok(())
    }

    fn get_lines(&self, channel_id: u8) -> Result<ModemLines, TransportError> {
        Ok(lock(&self.state)
            .status
            .get(&channel_id)
            .copied()
            .unwrap_or_default())
    }

    fn set_lines(
        &self,
        channel_id: u8,
        set: ModemLines,
        clear: ModemLines,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_set {
            return Err(TransportError::Io("set_lines failed".into()));
        }
        state.set_calls.push((channel_id, set, clear));
        let current = state.outgoing.get(&channel_id).copied().unwrap_or_default();
        let next = ModemLines::from_bits_truncate((current.bits() | set.bits()) & !clear.bits());
        state.outgoing.insert(channel_id, next);
        Ok(())
    }
}

// ============================================================================
// Async helpers
// ============================================================================

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
