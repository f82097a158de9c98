//! Transfer requests
//!
//! A [`Request`] is a fixed-capacity buffer that moves between the bridge's
//! pools and the transports. It is always owned by exactly one party: a
//! pool, a queue, a relay in the middle of an operation, or the USB function
//! while submitted. Handing it over moves it.

/// Identity of a request within its pool, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u32);

/// Completion status reported by the USB function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestStatus {
    #[default]
    Ok,
    /// Endpoint was disabled while the request was queued
    Shutdown,
    /// Request was cancelled by the function driver
    Cancelled,
    /// Any other controller-reported failure
    Error,
}

impl RequestStatus {
    /// The request came back because its endpoint went away
    pub fn is_aborted(self) -> bool {
        matches!(self, Self::Shutdown | Self::Cancelled)
    }
}

#[derive(Debug)]
pub struct Request {
    id: RequestId,
    buf: Box<[u8]>,
    len: usize,
    status: RequestStatus,
    generation: u64,
    inspected: bool,
}

impl Request {
    pub fn new(id: RequestId, capacity: usize) -> Self {
        Self {
            id,
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            status: RequestStatus::Ok,
            generation: 0,
            inspected: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Used length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the used length, clamped to the capacity
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    /// The used part of the buffer
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The whole buffer, for filling
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Copy `data` in, truncated to the capacity; returns bytes copied
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&data[..n]);
        self.len = n;
        n
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
    }

    /// Attach generation the request was last submitted under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn is_inspected(&self) -> bool {
        self.inspected
    }

    pub fn mark_inspected(&mut self) {
        self.inspected = true;
    }

    /// Forget everything about the last transfer
    pub fn reset(&mut self) {
        self.len = 0;
        self.status = RequestStatus::Ok;
        self.inspected = false;
    }
}
