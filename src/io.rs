use crate::event::Event;
use std::collections::BinaryHeap;

/// One scheduled send: an event paired with the time it is allowed to leave
/// and a monotonic insertion sequence used to break ties in FIFO order.
struct Scheduled {
    deliver_at: u64,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.seq == other.seq
    }
}
impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so `BinaryHeap` (a max-heap) pops the earliest delivery time
    // first, with ties broken by earliest insertion.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deliver_at
            .cmp(&self.deliver_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One time-indexed delivery queue. Messages never leave before their
/// scheduled time, and messages scheduled for the same time preserve
/// insertion order — the queue provides a minimum latency, never a reorder.
#[derive(Default)]
struct DeliveryQueue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl DeliveryQueue {
    fn push(&mut self, deliver_at: u64, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { deliver_at, seq, event });
    }

    fn drain_ready(&mut self, timestamp: u64) -> Vec<Event> {
        let mut ready = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deliver_at > timestamp {
                break;
            }
            ready.push(self.heap.pop().unwrap().event);
        }
        ready
    }
}

/// The two scheduled-send queues to the network (peer caches) and to
/// memory. `tick` drains whichever entries have matured.
#[derive(Default)]
pub struct IoGateway {
    net: DeliveryQueue,
    mem: DeliveryQueue,
}

impl IoGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_net(&mut self, deliver_at: u64, event: Event) {
        self.net.push(deliver_at, event);
    }

    pub fn send_mem(&mut self, deliver_at: u64, event: Event) {
        self.mem.push(deliver_at, event);
    }

    /// Returns (net_ready, mem_ready) for this timestamp, each in
    /// timestamp-then-insertion order.
    pub fn drain_ready(&mut self, timestamp: u64) -> (Vec<Event>, Vec<Event>) {
        (self.net.drain_ready(timestamp), self.mem.drain_ready(timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Command, EventFlags, EventId};

    fn ev(seq: u32) -> Event {
        Event {
            id: EventId { epoch: 0, seq },
            cmd: Command::GetS,
            base_addr: 0,
            addr: 0,
            size: 64,
            src: "a".into(),
            dst: "b".into(),
            delivery_time: 0,
            response_to: None,
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: None,
            granted_state: None,
        }
    }

    #[test]
    fn respects_minimum_latency() {
        let mut gw = IoGateway::new();
        gw.send_net(10, ev(1));
        let (ready, _) = gw.drain_ready(5);
        assert!(ready.is_empty());
        let (ready, _) = gw.drain_ready(10);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn preserves_insertion_order_at_same_delivery_time() {
        let mut gw = IoGateway::new();
        gw.send_net(5, ev(1));
        gw.send_net(5, ev(2));
        gw.send_net(5, ev(3));
        let (ready, _) = gw.drain_ready(5);
        let seqs: Vec<_> = ready.iter().map(|e| e.id.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn net_and_mem_queues_are_independent() {
        let mut gw = IoGateway::new();
        gw.send_net(1, ev(1));
        gw.send_mem(1, ev(2));
        let (net, mem) = gw.drain_ready(1);
        assert_eq!(net.len(), 1);
        assert_eq!(mem.len(), 1);
    }
}
