//! Request pools
//!
//! Each port keeps one pool per direction. A pool allocates up to `depth`
//! requests of `buf_size` bytes and then only recycles them; an empty pool is
//! backpressure, not an error.

use common::{Request, RequestId};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct RequestPool {
    name: &'static str,
    free: VecDeque<Request>,
    allocated: usize,
    depth: usize,
    buf_size: usize,
    next_id: u32,
}

impl RequestPool {
    pub fn new(name: &'static str, depth: usize, buf_size: usize) -> Self {
        Self {
            name,
            free: VecDeque::with_capacity(depth),
            allocated: 0,
            depth,
            buf_size,
            next_id: 0,
        }
    }

    /// Allocate requests until `depth` exist; returns how many were added
    pub fn fill(&mut self) -> usize {
        let mut added = 0;
        while self.allocated < self.depth {
            self.free
                .push_back(Request::new(RequestId(self.next_id), self.buf_size));
            self.next_id = self.next_id.wrapping_add(1);
            self.allocated += 1;
            added += 1;
        }
        if added > 0 {
            tracing::trace!("{} pool: allocated {} requests", self.name, added);
        }
        added
    }

    pub fn acquire(&mut self) -> Option<Request> {
        self.free.pop_front()
    }

    /// Take a request back, clearing its transfer state
    pub fn release(&mut self, mut request: Request) {
        request.reset();
        self.free.push_back(request);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Requests currently owned by someone other than the pool
    pub fn outstanding(&self) -> usize {
        self.allocated.saturating_sub(self.free.len())
    }
}
