use std::cmp::Ordering;
use std::time::Duration;
use tracing::debug;
use veilnet_common::Timestamp;

/// Total order used to sequence packets on egress
///
/// Supplied at construction; the queue itself never inspects packet
/// contents.
pub trait QueueOrder<T> {
    fn cmp(&self, a: &T, b: &T) -> Ordering;
}

impl<T, F> QueueOrder<T> for F
where
    F: Fn(&T, &T) -> Ordering,
{
    fn cmp(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}

/// Delay-sensitive packet queue with drop-on-overload
///
/// Packets carry their enqueue time. Past the depth threshold the packet
/// with the highest queueing delay is shed; packets older than the max age
/// are shed on drain. Egress order is the policy order, not arrival order.
pub struct CodelQueue<T, O: QueueOrder<T>> {
    order: O,
    overflow_depth: usize,
    max_age: Duration,
    entries: Vec<Entry<T>>,
    dropped: u64,
}

struct Entry<T> {
    packet: T,
    enqueued_at: Timestamp,
}

impl<T, O: QueueOrder<T>> CodelQueue<T, O> {
    pub fn new(order: O, overflow_depth: usize, max_age: Duration) -> Self {
        Self {
            order,
            overflow_depth,
            max_age,
            entries: Vec::new(),
            dropped: 0,
        }
    }

    pub fn enqueue(&mut self, packet: T, now: Timestamp) {
        self.entries.push(Entry {
            packet,
            enqueued_at: now,
        });

        if self.entries.len() > self.overflow_depth {
            // shed the longest-waiting packet
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.enqueued_at)
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(oldest);
                self.dropped += 1;
                debug!(depth = self.entries.len(), "packet queue overflow drop");
            }
        }
    }

    /// Call `f` on each packet in policy order and clear the queue
    ///
    /// Packets older than the max age are dropped instead of delivered.
    pub fn drain_with<F: FnMut(T)>(&mut self, now: Timestamp, mut f: F) {
        let max_age = self.max_age;
        let before = self.entries.len();
        self.entries
            .retain(|e| now.since(e.enqueued_at) <= max_age);
        let aged_out = before - self.entries.len();
        if aged_out > 0 {
            self.dropped += aged_out as u64;
            debug!(count = aged_out, "dropped stale packets");
        }

        let order = &self.order;
        self.entries
            .sort_by(|a, b| order.cmp(&a.packet, &b.packet));

        for entry in self.entries.drain(..) {
            f(entry.packet);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Packets shed so far, for stats reporting
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
