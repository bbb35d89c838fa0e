use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

#[derive(Debug)]
struct Pending<T> {
    block: u64,
    received_at: DateTime<Utc>,
    item: T,
}

/// Holds chain events until they are `confirmations` blocks deep. Events that
/// wait longer than `max_pending` are assumed reorged out and dropped.
#[derive(Debug)]
pub struct ReorgBuffer<T> {
    pending: VecDeque<Pending<T>>,
    confirmations: u64,
    max_pending: Duration,
    dropped: u64,
}

impl<T> ReorgBuffer<T> {
    pub fn new(confirmations: u64, max_pending: std::time::Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            confirmations,
            max_pending: Duration::from_std(max_pending).unwrap_or(Duration::minutes(5)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, block: u64, item: T, now: DateTime<Utc>) {
        self.pending.push_back(Pending {
            block,
            received_at: now,
            item,
        });
    }

    /// Drop pending events matching `pred`, e.g. logs the node marked `removed`.
    pub fn retract<F: Fn(&T) -> bool>(&mut self, pred: F) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| !pred(&p.item));
        let removed = before - self.pending.len();
        self.dropped += removed as u64;
        removed
    }

    /// Release every event that is deep enough at `current_block`, dropping the
    /// ones that have been pending too long.
    pub fn release(&mut self, current_block: u64, now: DateTime<Utc>) -> Vec<T> {
        let mut ready = Vec::new();
        let mut keep = VecDeque::with_capacity(self.pending.len());

        for p in self.pending.drain(..) {
            let depth = current_block.saturating_sub(p.block);
            if current_block >= p.block && depth >= self.confirmations {
                ready.push(p.item);
            } else if now - p.received_at > self.max_pending {
                self.dropped += 1;
            } else {
                keep.push_back(p);
            }
        }

        self.pending = keep;
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Events dropped as reorg losses since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_confirmations_forwards_immediately() {
        let now = Utc::now();
        let mut buf = ReorgBuffer::new(0, std::time::Duration::from_secs(300));
        buf.push(100, "a", now);
        assert_eq!(buf.release(100, now), vec!["a"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_waits_for_depth() {
        let now = Utc::now();
        let mut buf = ReorgBuffer::new(2, std::time::Duration::from_secs(300));
        buf.push(100, "a", now);
        assert!(buf.release(101, now).is_empty());
        assert_eq!(buf.release(102, now), vec!["a"]);
    }

    #[test]
    fn test_stale_events_dropped_and_counted() {
        let now = Utc::now();
        let mut buf = ReorgBuffer::new(3, std::time::Duration::from_secs(300));
        buf.push(100, "a", now);
        let later = now + Duration::seconds(301);
        assert!(buf.release(101, later).is_empty());
        assert_eq!(buf.dropped(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_retract_removed_logs() {
        let now = Utc::now();
        let mut buf = ReorgBuffer::new(1, std::time::Duration::from_secs(300));
        buf.push(100, ("0xa", 1), now);
        buf.push(100, ("0xb", 2), now);
        assert_eq!(buf.retract(|(tx, _)| *tx == "0xa"), 1);
        assert_eq!(buf.release(101, now), vec![("0xb", 2)]);
        assert_eq!(buf.dropped(), 1);
    }
}
