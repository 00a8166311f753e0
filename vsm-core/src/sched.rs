use crate::types::{NodeId, Timestamp, Value};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

// ─── Timer kinds ──────────────────────────────────────────────

/// What fires when a deadline elapses.
#[derive(Clone, Debug)]
pub enum TimerKind {
    /// Monitor `T_START`; stale unless the monitor is still in the epoch
    /// that scheduled it.
    MonitorStart { node: NodeId, epoch: u64 },
    /// Monitor `T_STOP`.
    MonitorStop { node: NodeId, epoch: u64 },
    /// A delayed emission owned by the emit node `node`.
    Emission {
        node: NodeId,
        signal: String,
        value: Value,
    },
}

// ─── Timer heap ───────────────────────────────────────────────

#[derive(Debug)]
struct TimerEntry {
    deadline: Timestamp,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Min-heap of deadlines; equal deadlines release in insertion order.
/// Cancellation is lazy — cancelled entries are dropped when they surface.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    cancelled: HashSet<u64>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Timestamp, kind: TimerKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq,
            kind,
        }));
        seq
    }

    pub fn cancel(&mut self, seq: u64) {
        self.cancelled.insert(seq);
    }

    /// Cancel every pending entry matching the predicate. Idempotent.
    pub fn cancel_matching<F: Fn(&TimerKind) -> bool>(&mut self, pred: F) {
        let doomed: Vec<u64> = self
            .heap
            .iter()
            .filter(|Reverse(e)| !self.cancelled.contains(&e.seq) && pred(&e.kind))
            .map(|Reverse(e)| e.seq)
            .collect();
        self.cancelled.extend(doomed);
    }

    /// Earliest live deadline, discarding cancelled entries on the way.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.remove(&entry.seq) {
                self.heap.pop();
                continue;
            }
            return Some(entry.deadline);
        }
        None
    }

    /// Pop the next live entry with `deadline ≤ now`.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(Timestamp, TimerKind)> {
        loop {
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {
                    let Reverse(entry) = self.heap.pop().unwrap();
                    if self.cancelled.remove(&entry.seq) {
                        continue;
                    }
                    return Some((entry.deadline, entry.kind));
                }
                _ => return None,
            }
        }
    }
}

// ─── Replay rate ──────────────────────────────────────────────

/// Pure wall↔logical clock transform. 100% is real time; 50% plays at
/// half speed (one logical second takes two wall seconds).
#[derive(Clone, Copy, Debug)]
pub struct RateTransform {
    percent: f64,
}

impl RateTransform {
    /// Valid range is 0 < rate ≤ 10000.
    pub fn new(percent: f64) -> Option<Self> {
        if percent > 0.0 && percent <= 10000.0 {
            Some(Self { percent })
        } else {
            None
        }
    }

    pub fn percent(self) -> f64 {
        self.percent
    }

    pub fn to_logical(self, wall_ms: u64) -> Timestamp {
        (wall_ms as f64 * self.percent / 100.0).round() as Timestamp
    }

    pub fn to_wall(self, logical_ms: Timestamp) -> u64 {
        (logical_ms as f64 * 100.0 / self.percent).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emission(n: NodeId) -> TimerKind {
        TimerKind::Emission {
            node: n,
            signal: "x".into(),
            value: Value::Int(n as i64),
        }
    }

    #[test]
    fn pops_in_deadline_then_insertion_order() {
        let mut heap = TimerHeap::new();
        heap.schedule(50, emission(0));
        heap.schedule(10, emission(1));
        heap.schedule(10, emission(2));
        let order: Vec<NodeId> = std::iter::from_fn(|| heap.pop_due(100))
            .map(|(_, kind)| match kind {
                TimerKind::Emission { node, .. } => node,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn pop_due_respects_now() {
        let mut heap = TimerHeap::new();
        heap.schedule(100, emission(0));
        assert!(heap.pop_due(99).is_none());
        assert!(heap.pop_due(100).is_some());
    }

    #[test]
    fn cancellation_is_lazy_and_idempotent() {
        let mut heap = TimerHeap::new();
        let seq = heap.schedule(10, emission(0));
        heap.schedule(20, emission(1));
        heap.cancel(seq);
        heap.cancel(seq);
        assert_eq!(heap.next_deadline(), Some(20));
        let (deadline, _) = heap.pop_due(u64::MAX).unwrap();
        assert_eq!(deadline, 20);
        assert!(heap.pop_due(u64::MAX).is_none());
    }

    #[test]
    fn cancel_matching_spares_others() {
        let mut heap = TimerHeap::new();
        heap.schedule(10, emission(0));
        heap.schedule(10, emission(1));
        heap.cancel_matching(|k| matches!(k, TimerKind::Emission { node: 0, .. }));
        match heap.pop_due(10) {
            Some((_, TimerKind::Emission { node, .. })) => assert_eq!(node, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rate_transform_scales_both_ways() {
        let half = RateTransform::new(50.0).unwrap();
        assert_eq!(half.to_logical(2000), 1000);
        assert_eq!(half.to_wall(1000), 2000);
        let double = RateTransform::new(200.0).unwrap();
        assert_eq!(double.to_logical(500), 1000);
        assert!(RateTransform::new(0.0).is_none());
        assert!(RateTransform::new(10001.0).is_none());
        assert!(RateTransform::new(100.0).is_some());
    }
}
