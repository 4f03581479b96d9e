use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::packet_buffer::PacketBuffer;
use crate::sequence::SequenceNumber;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendWindowError {
    #[error("send window is full")]
    Full,
    #[error("sequence numbers are exhausted")]
    Exhausted,
}

struct InFlight {
    sequence: SequenceNumber,
    packet: PacketBuffer,
}

/// The sender side of a peer's reliable traffic: it assigns sequence numbers and keeps a copy
///  of every packet on the wire until it is acknowledged, resending it periodically.
///
/// Packets live in a ring of `window_size` slots indexed by `sequence mod window_size`. A new
///  packet is only accepted if its sequence number is less than `window_size` ahead of the
///  oldest unacknowledged packet, so an unacknowledged slot is never overwritten - callers get
///  [SendWindowError::Full] and retry later.
pub struct SendWindow {
    window_size: u32,
    slots: Vec<Option<InFlight>>,
    /// `None` after the last sequence number was assigned
    next_sequence: Option<SequenceNumber>,
    oldest_unacked: SequenceNumber,
    num_in_flight: usize,
    buffer_pool: Arc<BufferPool>,
}

impl SendWindow {
    pub fn new(window_size: u32, buffer_pool: Arc<BufferPool>) -> SendWindow {
        assert!(window_size > 0);

        SendWindow {
            window_size,
            slots: (0..window_size).map(|_| None).collect(),
            next_sequence: Some(SequenceNumber::ZERO),
            oldest_unacked: SequenceNumber::ZERO,
            num_in_flight: 0,
            buffer_pool,
        }
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn num_in_flight(&self) -> usize {
        self.num_in_flight
    }

    pub fn oldest_unacked(&self) -> SequenceNumber {
        self.oldest_unacked
    }

    /// Returns the sequence number the next packet must carry, without consuming it. The
    ///  packet must be passed to [SendWindow::register_sent] afterwards.
    pub fn prepare_send(&self) -> Result<SequenceNumber, SendWindowError> {
        let next = self.next_sequence
            .ok_or(SendWindowError::Exhausted)?;

        if next.widen() - self.oldest_unacked.widen() >= u64::from(self.window_size) {
            trace!("send window full: next sequence {}, oldest unacknowledged {}", next, self.oldest_unacked);
            return Err(SendWindowError::Full);
        }
        Ok(next)
    }

    /// Takes ownership of a packet that was (or is about to be) sent, retaining it for resends
    ///  until it is acknowledged
    pub fn register_sent(&mut self, sequence: SequenceNumber, mut packet: PacketBuffer, now: Instant) -> &PacketBuffer {
        debug_assert_eq!(Some(sequence), self.next_sequence, "sequence was not prepared");

        packet.set_last_write_time(now);
        self.next_sequence = sequence.checked_next();
        if self.num_in_flight == 0 {
            self.oldest_unacked = sequence;
        }
        self.num_in_flight += 1;

        let slot = &mut self.slots[sequence.slot(self.window_size)];
        if let Some(overwritten) = slot.take() {
            // this can only happen if prepare_send was bypassed
            debug!("send slot for sequence {} still held unacknowledged packet {}", sequence, overwritten.sequence);
            self.num_in_flight -= 1;
            self.buffer_pool.release(overwritten.packet);
        }

        &slot.insert(InFlight { sequence, packet }).packet
    }

    /// Frees the slot of an acknowledged packet, returning its buffer to the pool. Acks for
    ///  unknown or already acknowledged sequence numbers are ignored.
    pub fn on_ack(&mut self, sequence: SequenceNumber) -> bool {
        let slot = &mut self.slots[sequence.slot(self.window_size)];
        match slot {
            Some(in_flight) if in_flight.sequence == sequence => {}
            _ => {
                trace!("ignoring ack for sequence {} which is not in flight", sequence);
                return false;
            }
        }

        if let Some(acked) = slot.take() {
            self.buffer_pool.release(acked.packet);
        }
        self.num_in_flight -= 1;
        trace!("sequence {} acknowledged", sequence);

        self.advance_oldest_unacked();
        true
    }

    fn advance_oldest_unacked(&mut self) {
        let Some(next) = self.next_sequence else {
            // nothing can be sent anyway
            return;
        };

        while self.oldest_unacked < next && self.slots[self.oldest_unacked.slot(self.window_size)].is_none() {
            match self.oldest_unacked.checked_next() {
                Some(s) => self.oldest_unacked = s,
                None => break,
            }
        }
    }

    /// Collects all packets that were last sent at least `timeout` ago, stamping them with `now`.
    ///  The returned sequence numbers are in ascending order.
    pub fn due_for_resend(&mut self, now: Instant, timeout: Duration) -> Vec<SequenceNumber> {
        let mut result = Vec::new();
        for in_flight in self.slots.iter_mut().flatten() {
            let is_due = in_flight.packet.last_write_time()
                .map_or(true, |t| now.saturating_duration_since(t) >= timeout);

            if is_due {
                in_flight.packet.set_last_write_time(now);
                result.push(in_flight.sequence);
            }
        }
        result.sort();
        result
    }

    pub fn packet(&self, sequence: SequenceNumber) -> Option<&PacketBuffer> {
        match &self.slots[sequence.slot(self.window_size)] {
            Some(in_flight) if in_flight.sequence == sequence => Some(&in_flight.packet),
            _ => None,
        }
    }

    /// returns all retained buffers to the pool
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(in_flight) = slot.take() {
                self.buffer_pool.release(in_flight.packet);
            }
        }
        self.num_in_flight = 0;
    }
}

impl Drop for SendWindow {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn packet(pool: &BufferPool, marker: u8) -> PacketBuffer {
        let mut buf = pool.get();
        buf.write_u8(marker).unwrap();
        buf
    }

    fn send(window: &mut SendWindow, pool: &BufferPool, now: Instant) -> SequenceNumber {
        let sequence = window.prepare_send().unwrap();
        window.register_sent(sequence, packet(pool, sequence.to_raw() as u8), now);
        sequence
    }

    #[test]
    fn test_sequence_assignment() {
        let pool = Arc::new(BufferPool::new(16, 0, 16));
        let mut window = SendWindow::new(4, pool.clone());
        let now = Instant::now();

        for expected in 0..4 {
            assert_eq!(send(&mut window, &pool, now), SequenceNumber::from_raw(expected));
        }
        assert_eq!(window.num_in_flight(), 4);
        assert_eq!(window.packet(SequenceNumber::from_raw(2)).unwrap().as_ref(), &[2]);
    }

    #[test]
    fn test_prepare_does_not_consume() {
        let pool = Arc::new(BufferPool::new(16, 0, 16));
        let window = SendWindow::new(4, pool);
        assert_eq!(window.prepare_send(), Ok(SequenceNumber::ZERO));
        assert_eq!(window.prepare_send(), Ok(SequenceNumber::ZERO));
    }

    #[test]
    fn test_window_full_is_rejected() {
        let pool = Arc::new(BufferPool::new(16, 0, 16));
        let mut window = SendWindow::new(3, pool.clone());
        let now = Instant::now();

        for _ in 0..3 {
            send(&mut window, &pool, now);
        }
        assert_eq!(window.prepare_send(), Err(SendWindowError::Full));

        // acking a later packet does not help while the oldest one is unacknowledged
        assert!(window.on_ack(SequenceNumber::from_raw(1)));
        assert_eq!(window.prepare_send(), Err(SendWindowError::Full));
        assert_eq!(window.packet(SequenceNumber::ZERO).unwrap().as_ref(), &[0], "unacknowledged packet must not be overwritten");

        assert!(window.on_ack(SequenceNumber::ZERO));
        assert_eq!(window.oldest_unacked(), SequenceNumber::from_raw(2));
        assert_eq!(window.prepare_send(), Ok(SequenceNumber::from_raw(3)));
        send(&mut window, &pool, now);
        assert_eq!(window.prepare_send(), Ok(SequenceNumber::from_raw(4)));
    }

    #[rstest]
    #[case::in_flight(1, true)]
    #[case::duplicate(0, false)]
    #[case::never_sent(7, false)]
    #[case::same_slot_other_sequence(5, false)]
    fn test_on_ack(#[case] ack: u32, #[case] expected: bool) {
        let pool = Arc::new(BufferPool::new(16, 0, 16));
        let mut window = SendWindow::new(4, pool.clone());
        let now = Instant::now();
        send(&mut window, &pool, now);
        send(&mut window, &pool, now);
        window.on_ack(SequenceNumber::ZERO);

        assert_eq!(window.on_ack(SequenceNumber::from_raw(ack)), expected);
        assert_eq!(pool.outstanding(), if expected { 0 } else { 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_timeout() {
        let timeout = Duration::from_millis(100);
        let pool = Arc::new(BufferPool::new(16, 0, 16));
        let mut window = SendWindow::new(8, pool.clone());

        send(&mut window, &pool, Instant::now());
        tokio::time::advance(Duration::from_millis(50)).await;
        send(&mut window, &pool, Instant::now());

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(window.due_for_resend(Instant::now(), timeout).is_empty());

        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(window.due_for_resend(Instant::now(), timeout), vec![SequenceNumber::ZERO]);
        assert!(window.due_for_resend(Instant::now(), timeout).is_empty(), "resend restarts the timer");

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(window.due_for_resend(Instant::now(), timeout), vec![SequenceNumber::from_raw(1)]);

        window.on_ack(SequenceNumber::ZERO);
        window.on_ack(SequenceNumber::from_raw(1));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(window.due_for_resend(Instant::now(), timeout).is_empty(), "acknowledged packets are never resent");
    }

    #[test]
    fn test_exhaustion() {
        let pool = Arc::new(BufferPool::new(16, 0, 16));
        let mut window = SendWindow::new(4, pool.clone());
        window.next_sequence = Some(SequenceNumber::from_raw(u32::MAX));
        window.oldest_unacked = SequenceNumber::from_raw(u32::MAX);

        assert_eq!(send(&mut window, &pool, Instant::now()), SequenceNumber::from_raw(u32::MAX));
        assert_eq!(window.prepare_send(), Err(SendWindowError::Exhausted));
    }

    #[test]
    fn test_drop_releases_buffers() {
        let pool = Arc::new(BufferPool::new(16, 0, 16));
        let mut window = SendWindow::new(4, pool.clone());
        for _ in 0..3 {
            send(&mut window, &pool, Instant::now());
        }
        assert_eq!(pool.outstanding(), 3);

        drop(window);
        assert_eq!(pool.outstanding(), 0);
    }
}
