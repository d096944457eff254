use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::PAGE_SIZE;

/// One buffer pool frame's worth of state: the page bytes plus the
/// metadata the pool needs to manage residency.
///
/// The page does not know its own page id. The buffer pool's reverse map
/// (`frame -> page id`) is the single source of truth for which page a
/// frame holds, so a frame can be remapped without touching the bytes.
pub struct Page {
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
}

impl Page {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
        }
    }

    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().unwrap()
    }

    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().unwrap()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pin. Returns the new pin count, or `None` when the count
    /// was already zero (the caller unpinned more than it pinned).
    pub fn unpin(&self) -> Option<u32> {
        let mut current = self.pin_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.pin_count.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(seen) => current = seen,
            }
        }
    }

    /// Zero the bytes and clear all metadata. Only called while the frame
    /// is unmapped.
    pub fn reset(&self) {
        let mut data = self.write_data();
        data.iter_mut().for_each(|b| *b = 0);
        drop(data);
        self.dirty.store(false, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
    }
}
