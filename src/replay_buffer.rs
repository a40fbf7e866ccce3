//! The replay ring buffer.
//!
//! Every session records its ciphered output into a fixed-capacity ring
//! holding the most recent bytes written. When a replacement transport
//! attaches, the unacknowledged tail is read back out of the ring and
//! retransmitted, so the peer observes a gapless byte stream.

use core::fmt::{Debug, Formatter};
use std::sync::Mutex;

use crate::error::Error;

/// A fixed-capacity circular log of the most recent bytes written.
pub struct ReplayBuffer {
    buf: Box<[u8]>,
    off: usize,
    looped: bool,
}

impl ReplayBuffer {
    /// Allocates a ring holding the last `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "replay buffer capacity must be non-zero");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            off: 0,
            looped: false,
        }
    }

    /// The total space of the ring.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The number of valid bytes currently stored, in `[0, capacity]`.
    pub fn len(&self) -> usize {
        if self.looped {
            self.buf.len()
        } else {
            self.off
        }
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `p`, discarding the oldest bytes once the ring is full. A
    /// write larger than the ring keeps only its tail.
    pub fn write(&mut self, p: &[u8]) {
        let capacity = self.buf.len();
        let n = p.len();

        if n >= capacity {
            self.buf.copy_from_slice(&p[n - capacity..]);
            self.looped = true;
            self.off = 0;
            return;
        }

        let right = capacity - self.off;
        if n < right {
            self.buf[self.off..self.off + n].copy_from_slice(p);
            self.off += n;
            return;
        }

        // The write wraps: fill to the end, continue from the front.
        self.buf[self.off..].copy_from_slice(&p[..right]);
        self.buf[..n - right].copy_from_slice(&p[right..]);
        self.looped = true;
        self.off = n - right;
    }

    /// The last `n` bytes written, in write order. Fails when the ring no
    /// longer holds that many.
    pub fn read_last(&self, n: usize) -> Result<Vec<u8>, Error> {
        if n > self.len() {
            return Err(Error::NotAcceptable);
        }

        let mut out = vec![0u8; n];
        if n <= self.off {
            out.copy_from_slice(&self.buf[self.off - n..self.off]);
        } else {
            let wrapped = n - self.off;
            out[..wrapped].copy_from_slice(&self.buf[self.buf.len() - wrapped..]);
            out[wrapped..].copy_from_slice(&self.buf[..self.off]);
        }
        Ok(out)
    }

    /// Clears the ring for recycling.
    pub fn reset(&mut self) {
        self.off = 0;
        self.looped = false;
    }

    /// Deep-copies contents and cursor into `dst`, reallocating it when the
    /// capacities differ.
    pub fn copy_to(&self, dst: &mut ReplayBuffer) {
        if dst.buf.len() != self.buf.len() {
            dst.buf = vec![0u8; self.buf.len()].into_boxed_slice();
        }
        dst.buf.copy_from_slice(&self.buf);
        dst.off = self.off;
        dst.looped = self.looped;
    }
}

impl Debug for ReplayBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplayBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// A pool of replay buffers of one canonical capacity, recycled across
/// sessions to keep allocation off the data path.
#[derive(Debug)]
pub struct ReplayBufferPool {
    capacity: usize,
    free: Mutex<Vec<ReplayBuffer>>,
}

impl ReplayBufferPool {
    /// Creates a pool handing out rings of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    /// The capacity of every buffer this pool hands out.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A cleared buffer, recycled when one is available.
    pub fn get(&self) -> ReplayBuffer {
        let recycled = self.free.lock().unwrap().pop();
        match recycled {
            Some(mut buf) => {
                buf.reset();
                buf
            }
            None => ReplayBuffer::with_capacity(self.capacity),
        }
    }

    /// Returns a buffer to the pool. A buffer sized for a different
    /// configuration is dropped instead: it must never carry a session of
    /// the new size.
    pub fn put(&self, buf: ReplayBuffer) {
        if buf.capacity() != self.capacity {
            return;
        }
        self.free.lock().unwrap().push(buf);
    }
}
