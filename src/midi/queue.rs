//! Outbound messages held until their timestamp comes due.
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    pub at: f64,
    pub port: String,
    pub bytes: Vec<u8>,
}

struct Entry {
    seq: u64,
    msg: Pending,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed: BinaryHeap is a max-heap, we want the earliest message on top
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .msg
            .at
            .total_cmp(&self.msg.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap on timestamp. Messages with equal timestamps keep push order.
#[derive(Default)]
pub struct TimedQueue {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl TimedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, port: &str, bytes: &[u8], at: f64) {
        self.seq += 1;
        self.heap.push(Entry {
            seq: self.seq,
            msg: Pending {
                at,
                port: port.to_string(),
                bytes: bytes.to_vec(),
            },
        });
    }

    /// Remove and return every message due at or before `now`, in order.
    pub fn pop_due(&mut self, now: f64) -> Vec<Pending> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|e| e.msg.at <= now) {
            if let Some(entry) = self.heap.pop() {
                due.push(entry.msg);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
