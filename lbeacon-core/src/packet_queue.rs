//! Bounded FIFO of outbound packets shared between producer tasks and the
//! gateway session (spec §4.3).
//!
//! `examples/original_source/src/pkt_Queue.c` serializes producers and the
//! consumer with a hand-rolled spin flag (`do { status = x.locker; x.locker
//! = true; } while (status);`). Spec §9 calls this out by name as something
//! not to carry forward; a `std::sync::Mutex` around a `VecDeque` gives the
//! same FIFO-order, single-writer-at-a-time guarantee without busy-waiting
//! a core.

use std::{
    collections::VecDeque,
    sync::Mutex,
};

/// What a queued packet is destined for. AT-command framing belongs to the
/// legacy ZigBee/XBee uplink, out of scope for this UDP-only gateway
/// session; it is kept as a discriminant because the queue itself is
/// otherwise payload-agnostic and a second kind costs nothing to carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    AtCommand,
}

/// An 8-byte destination identifier, the queue's addressing unit (spec
/// §4.3). For this gateway session it is always the assigned gateway
/// address padded/truncated to 8 bytes; kept fixed-size to match the
/// original queue's slot layout.
pub type DestinationId = [u8; 8];

struct QueuedPacket {
    kind: PacketKind,
    destination: DestinationId,
    payload: Vec<u8>,
}

/// A bounded, FIFO, multi-producer/single-consumer packet queue.
pub struct PacketQueue {
    capacity: usize,
    inner: Mutex<VecDeque<QueuedPacket>>,
}

impl PacketQueue {
    /// Creates an empty queue holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, inner: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Enqueues a packet at the tail. Returns `false` without modifying the
    /// queue if it is already at capacity.
    pub fn push(&self, kind: PacketKind, destination: DestinationId, payload: Vec<u8>) -> bool {
        let mut queue = self.inner.lock().expect("packet queue mutex poisoned");
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(QueuedPacket { kind, destination, payload });
        true
    }

    /// Dequeues the packet at the head, if any.
    pub fn pop(&self) -> Option<(PacketKind, DestinationId, Vec<u8>)> {
        let mut queue = self.inner.lock().expect("packet queue mutex poisoned");
        queue.pop_front().map(|p| (p.kind, p.destination, p.payload))
    }

    /// Whether the queue currently holds no packets.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("packet queue mutex poisoned").is_empty()
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.inner.lock().expect("packet queue mutex poisoned").len() >= self.capacity
    }

    /// Number of packets currently queued.
    pub fn length(&self) -> usize {
        self.inner.lock().expect("packet queue mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_fifo_order_between_producers_on_one_thread() {
        let queue = PacketQueue::new(4);
        assert!(queue.push(PacketKind::Data, [0; 8], vec![1]));
        assert!(queue.push(PacketKind::Data, [0; 8], vec![2]));
        assert!(queue.push(PacketKind::Data, [0; 8], vec![3]));

        let (_, _, first) = queue.pop().unwrap();
        let (_, _, second) = queue.pop().unwrap();
        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2]);
        assert_eq!(queue.length(), 1);
    }

    #[test]
    fn push_fails_closed_once_full() {
        let queue = PacketQueue::new(1);
        assert!(queue.push(PacketKind::Data, [0; 8], vec![1]));
        assert!(!queue.push(PacketKind::Data, [0; 8], vec![2]));
        assert!(queue.is_full());
    }

    #[test]
    fn pop_on_empty_queue_returns_none() {
        let queue = PacketQueue::new(1);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
