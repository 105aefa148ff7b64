//! Fixed-capacity frame history.
//!
//! Slots are allocated once; `head` indexes the oldest entry. Pushing into a
//! full buffer overwrites the oldest slot.

use std::sync::Arc;

use crate::stream::types::RawFrame;

#[derive(Debug, Clone)]
pub struct FrameHistory {
    slots: Vec<Option<Arc<RawFrame>>>,
    head: usize,
    len: usize,
}

impl FrameHistory {
    /// Create a history holding at most `capacity` frames (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a frame, returning the evicted frame when the buffer was full.
    pub fn push(&mut self, frame: Arc<RawFrame>) -> Option<Arc<RawFrame>> {
        let capacity = self.capacity();
        if self.len < capacity {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(frame);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(frame);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    /// Most recent frame.
    pub fn latest(&self) -> Option<&Arc<RawFrame>> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.len - 1) % self.capacity();
        self.slots[idx].as_ref()
    }

    /// Frames from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RawFrame>> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(record_id: u32) -> Arc<RawFrame> {
        Arc::new(RawFrame {
            record_id,
            ..Default::default()
        })
    }

    #[test]
    fn test_history_never_exceeds_capacity() {
        let mut history = FrameHistory::with_capacity(4);
        for i in 0..25 {
            history.push(frame(i));
            assert!(history.len() <= 4);
        }
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_history_keeps_most_recent_in_arrival_order() {
        let mut history = FrameHistory::with_capacity(3);
        for i in 0..7 {
            history.push(frame(i));
        }
        let ids: Vec<u32> = history.iter().map(|f| f.record_id).collect();
        assert_eq!(ids, vec![4, 5, 6]);
        assert_eq!(history.latest().map(|f| f.record_id), Some(6));
    }

    #[test]
    fn test_push_reports_evicted_frame() {
        let mut history = FrameHistory::with_capacity(2);
        assert!(history.push(frame(1)).is_none());
        assert!(history.push(frame(2)).is_none());
        let evicted = history.push(frame(3));
        assert_eq!(evicted.map(|f| f.record_id), Some(1));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut history = FrameHistory::with_capacity(0);
        history.push(frame(1));
        history.push(frame(2));
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.latest().map(|f| f.record_id), Some(2));

        history.clear();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
    }
}
