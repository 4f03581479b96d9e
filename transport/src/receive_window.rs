use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::header::Header;
use crate::sequence::SequenceNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// the packet that was expected next
    Orderly,
    /// a packet further ahead, there is a gap before it
    OutOfOrder,
    /// a packet that was received before
    Duplicate,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("sequence {sequence} is {distance} ahead of the delivery cursor with a window size of {window_size}")]
pub struct WindowCapacityExceeded {
    pub sequence: SequenceNumber,
    pub distance: u64,
    pub window_size: u32,
}

/// A received packet with its cursor positioned at the start of the application payload
#[derive(Debug)]
pub struct ReceivedPacket {
    pub header: Header,
    pub message_kind: u8,
    pub packet: PacketBuffer,
}

enum ReceiveSlot {
    Empty,
    /// received, waiting for delivery until all previous packets are delivered
    Pending(SequenceNumber, ReceivedPacket),
    /// received and already handed to the application out of order
    Delivered(SequenceNumber),
}

impl ReceiveSlot {
    fn sequence(&self) -> Option<SequenceNumber> {
        match self {
            ReceiveSlot::Empty => None,
            ReceiveSlot::Pending(sequence, _) | ReceiveSlot::Delivered(sequence) => Some(*sequence),
        }
    }
}

/// The receiver side of a peer's reliable traffic, removing duplicates and restoring the send
///  order for ordered packets.
///
/// `last_processed` is the delivery cursor: every packet before it was delivered. The
///  `expected_sequence` is the first sequence number that was not received yet, so all slots
///  between the two are occupied. Accepted packets are in `[last_processed, last_processed + window_size)`.
///
/// Unordered reliable packets are handed back for immediate delivery and leave a `Delivered`
///  marker in their slot; ordered packets wait for all their predecessors.
pub struct ReceiveWindow {
    window_size: u32,
    slots: Vec<ReceiveSlot>,
    expected_sequence: u64,
    last_processed: u64,
    buffer_pool: Arc<BufferPool>,
}

impl ReceiveWindow {
    pub fn new(window_size: u32, buffer_pool: Arc<BufferPool>) -> ReceiveWindow {
        assert!(window_size > 0);

        ReceiveWindow {
            window_size,
            slots: (0..window_size).map(|_| ReceiveSlot::Empty).collect(),
            expected_sequence: 0,
            last_processed: 0,
            buffer_pool,
        }
    }

    pub fn expected_sequence(&self) -> u64 {
        self.expected_sequence
    }

    pub fn last_processed(&self) -> u64 {
        self.last_processed
    }

    fn slot_index(&self, sequence: u64) -> usize {
        (sequence % u64::from(self.window_size)) as usize
    }

    pub fn classify(&self, sequence: SequenceNumber) -> Result<Classification, WindowCapacityExceeded> {
        let s = sequence.widen();

        if s < self.last_processed {
            return Ok(Classification::Duplicate);
        }

        let distance = s - self.last_processed;
        if distance >= u64::from(self.window_size) {
            return Err(WindowCapacityExceeded {
                sequence,
                distance,
                window_size: self.window_size,
            });
        }

        if self.slots[self.slot_index(s)].sequence().is_some() {
            debug_assert_eq!(self.slots[self.slot_index(s)].sequence(), Some(sequence));
            return Ok(Classification::Duplicate);
        }

        if s == self.expected_sequence {
            Ok(Classification::Orderly)
        }
        else {
            Ok(Classification::OutOfOrder)
        }
    }

    /// Registers a received packet. Duplicates go back to the pool right away, and so does the
    ///  packet if it exceeds the window. An unordered packet is returned for immediate delivery
    ///  the first time it is seen.
    pub fn on_packet(&mut self, sequence: SequenceNumber, received: ReceivedPacket, ordered: bool) -> Result<(Classification, Option<ReceivedPacket>), WindowCapacityExceeded> {
        let classification = match self.classify(sequence) {
            Ok(c) => c,
            Err(e) => {
                debug!("{}", e);
                self.buffer_pool.release(received.packet);
                return Err(e);
            }
        };
        trace!("sequence {} classified as {:?}", sequence, classification);

        if classification == Classification::Duplicate {
            self.buffer_pool.release(received.packet);
            return Ok((classification, None));
        }

        let s = sequence.widen();
        let idx = self.slot_index(s);
        let deliver_now = if ordered {
            self.slots[idx] = ReceiveSlot::Pending(sequence, received);
            None
        }
        else {
            self.slots[idx] = ReceiveSlot::Delivered(sequence);
            Some(received)
        };

        if classification == Classification::Orderly {
            while self.expected_sequence - self.last_processed < u64::from(self.window_size)
                && self.slots[self.slot_index(self.expected_sequence)].sequence().is_some()
            {
                self.expected_sequence += 1;
            }
        }

        Ok((classification, deliver_now))
    }

    /// The next packet that can be delivered in order, advancing the delivery cursor past
    ///  packets that were delivered out of order already. `None` at the first gap.
    pub fn next_deliverable(&mut self) -> Option<ReceivedPacket> {
        loop {
            let idx = self.slot_index(self.last_processed);
            match std::mem::replace(&mut self.slots[idx], ReceiveSlot::Empty) {
                ReceiveSlot::Empty => return None,
                ReceiveSlot::Delivered(_) => {
                    self.last_processed += 1;
                }
                ReceiveSlot::Pending(sequence, received) => {
                    trace!("delivering sequence {}", sequence);
                    self.last_processed += 1;
                    return Some(received);
                }
            }
        }
    }

    /// returns all buffered packets to the pool
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if let ReceiveSlot::Pending(_, received) = std::mem::replace(slot, ReceiveSlot::Empty) {
                self.buffer_pool.release(received.packet);
            }
        }
    }
}

impl Drop for ReceiveWindow {
    fn drop(&mut self) {
        self.clear();
    }
}
