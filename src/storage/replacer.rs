use std::collections::{HashSet, VecDeque};

use crate::types::FrameId;

/// Victim selection policy. The buffer pool tells the replacer which
/// frames became pinned (not evictable) or unpinned (evictable); the
/// replacer picks which evictable frame goes next.
///
/// Implementations carry no locks of their own; the buffer pool serializes
/// access.
pub trait Replacer: Send {
    /// Pick and remove an eviction victim, or `None` when nothing is
    /// evictable.
    fn victim(&mut self) -> Option<FrameId>;

    /// The frame was pinned; it must not be chosen as a victim.
    fn pin(&mut self, frame_id: FrameId);

    /// The frame's pin count hit zero; it is evictable again.
    fn unpin(&mut self, frame_id: FrameId);

    /// How many frames are currently evictable.
    fn size(&self) -> usize;

    /// The pool grew; future victim decisions see the new frame count.
    fn set_capacity(&mut self, capacity: usize);
}

/// Least-recently-used eviction.
///
/// `unpin` pushes the frame to the head of the list, `victim` takes from
/// the tail (the frame unpinned longest ago). A victim is only offered
/// once the replacer is at capacity, so pages are never evicted while
/// free frames still exist.
pub struct LruReplacer {
    capacity: usize,
    // head = most recently unpinned, tail = victim candidate
    list: VecDeque<FrameId>,
    present: HashSet<FrameId>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            list: VecDeque::new(),
            present: HashSet::new(),
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        if self.list.len() < self.capacity {
            return None;
        }
        let victim = self.list.pop_back()?;
        self.present.remove(&victim);
        Some(victim)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if self.present.remove(&frame_id) {
            self.list.retain(|f| *f != frame_id);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        // a frame that is already evictable keeps its position
        if self.present.contains(&frame_id) {
            return;
        }
        self.list.push_front(frame_id);
        self.present.insert(frame_id);
    }

    fn size(&self) -> usize {
        self.list.len()
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }
}

/// First-in-first-out eviction: the frame unpinned earliest is evicted
/// first, regardless of later accesses.
pub struct FifoReplacer {
    queue: VecDeque<FrameId>,
    present: HashSet<FrameId>,
}

impl FifoReplacer {
    pub fn new(_capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            present: HashSet::new(),
        }
    }
}

impl Replacer for FifoReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        let victim = self.queue.pop_front()?;
        self.present.remove(&victim);
        Some(victim)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if self.present.remove(&frame_id) {
            self.queue.retain(|f| *f != frame_id);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.present.contains(&frame_id) {
            return;
        }
        self.queue.push_back(frame_id);
        self.present.insert(frame_id);
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    fn set_capacity(&mut self, _capacity: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_victim_order() {
        let mut replacer = LruReplacer::new(3);
        replacer.unpin(0);
        replacer.unpin(1);
        replacer.unpin(2);

        // 0 was unpinned first, so it is the least recently used
        assert_eq!(replacer.victim(), Some(0));
        // below capacity now, nothing is offered
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_lru_holds_victims_below_capacity() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpin(0);
        replacer.unpin(1);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_lru_pin_removes() {
        let mut replacer = LruReplacer::new(2);
        replacer.unpin(0);
        replacer.unpin(1);
        replacer.pin(0);
        assert_eq!(replacer.size(), 1);
        replacer.unpin(0);
        // 1 is now the oldest
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_fifo_ignores_recency() {
        let mut replacer = FifoReplacer::new(3);
        replacer.unpin(0);
        replacer.unpin(1);
        replacer.unpin(2);
        // re-unpinning 0 does not move it
        replacer.unpin(0);

        assert_eq!(replacer.victim(), Some(0));
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);
    }
}
