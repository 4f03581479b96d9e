use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use tracing::{debug, error, trace};
use crate::buffers::packet_buffer::PacketBuffer;

/// A pool of fixed-capacity [PacketBuffer]s shared between the receive loop, the resend timers
///  and application sends.
///
/// Buffers in excess of `max_retained` are discarded when they are returned, so a burst of
///  load grows the pool temporarily without retaining the surplus afterwards.
pub struct BufferPool {
    buf_size: usize,
    max_retained: usize,
    buffers: Mutex<Vec<PacketBuffer>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BufferPool {
    pub fn new(buf_size: usize, warm_up: usize, max_retained: usize) -> Self {
        let max_retained = max_retained.max(warm_up);

        let mut buffers = Vec::with_capacity(max_retained);
        for _ in 0..warm_up {
            buffers.push(PacketBuffer::new(buf_size));
        }
        debug!("buffer pool warmed up with {} buffers of {} bytes", warm_up, buf_size);

        BufferPool {
            buf_size,
            max_retained,
            buffers: Mutex::new(buffers),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get(&self) -> PacketBuffer {
        self.acquired.fetch_add(1, Ordering::AcqRel);

        if let Some(mut buffer) = self.buffers.lock().pop() {
            if !buffer.is_empty_state() {
                error!("buffer reused while not empty (position {}, {} bytes written) - this points to concurrent misuse of a pooled buffer", buffer.position(), buffer.bytes_written());
                buffer.reset();
            }
            trace!("returning buffer from pool");
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        PacketBuffer::new(self.buf_size)
    }

    pub fn release(&self, mut buffer: PacketBuffer) {
        self.released.fetch_add(1, Ordering::AcqRel);

        if buffer.capacity() != self.buf_size {
            error!("returned buffer does not have the regular capacity of {} bytes but {} - discarding it", self.buf_size, buffer.capacity());
            return;
        }

        buffer.reset();

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_retained {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    /// number of buffers currently available for reuse
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// number of buffers handed out and not returned yet
    pub fn outstanding(&self) -> u64 {
        self.acquired_count().saturating_sub(self.released_count())
    }
}
