use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::config::{ReplacementPolicy, RuntimeConfig};
use crate::error::{ErrorKind, SmallError};
use crate::storage::disk_manager::DiskManager;
use crate::storage::page::Page;
use crate::storage::replacer::{FifoReplacer, LruReplacer, Replacer};
use crate::types::{FrameId, PageId, SmallResult, INVALID_PAGE_ID};

const SHARD_COUNT: usize = 8;

/// Caches pages in a fixed set of frames.
///
/// The page table (`page id -> frame`) is sharded across a small number of
/// locks keyed by `page_id % SHARD_COUNT`. The miss path (load, evict,
/// remap) is serialized by a single miss lock so that a frame is never
/// concurrently remapped; the hit path only touches one shard lock and
/// atomics. No shard lock is ever held across disk I/O.
///
/// Every write-back goes through the write-ahead log first: the page
/// after-image is appended (and fsync'd) before the page lands in the
/// database file, which is what makes recovery an idempotent replay.
pub struct BufferPoolManager {
    disk: Arc<DiskManager>,

    frames: RwLock<Vec<Arc<Page>>>,
    shards: Vec<RwLock<HashMap<PageId, FrameId>>>,
    /// Reverse map frame -> page id; `INVALID_PAGE_ID` for empty frames.
    /// This is the source of truth for what a frame holds.
    frame_pages: Mutex<Vec<PageId>>,
    free_list: Mutex<VecDeque<FrameId>>,
    replacer: Mutex<Box<dyn Replacer>>,
    /// Serializes the miss path (victim selection, eviction, remapping).
    miss_lock: Mutex<()>,
    pool_size: AtomicUsize,

    num_hits: AtomicUsize,
    num_accesses: AtomicUsize,
    num_replacements: AtomicUsize,
    num_writebacks: AtomicUsize,

    // background flusher
    flush_interval_ms: AtomicU64,
    max_flush_per_cycle: AtomicUsize,
    flusher_stop: Mutex<Option<Sender<()>>>,
    flusher_handle: Mutex<Option<JoinHandle<()>>>,

    // sequential read-ahead
    readahead_enabled: AtomicBool,
    readahead_window: AtomicU32,
    last_fetched: AtomicU32,
    prefetch_tx: Mutex<Option<Sender<PageId>>>,
    prefetch_handles: Mutex<Vec<JoinHandle<()>>>,

    autoresize_enabled: AtomicBool,
    running: AtomicBool,
}

impl BufferPoolManager {
    pub fn new(disk: Arc<DiskManager>, config: &RuntimeConfig) -> Arc<Self> {
        let pool_size = config.buffer_pool_pages.max(1);
        let mut frames = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            frames.push(Arc::new(Page::new()));
        }

        let replacer: Box<dyn Replacer> = match config.replacement_policy {
            ReplacementPolicy::Lru => Box::new(LruReplacer::new(pool_size)),
            ReplacementPolicy::Fifo => Box::new(FifoReplacer::new(pool_size)),
        };

        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }

        let pool = Arc::new(Self {
            disk,
            frames: RwLock::new(frames),
            shards,
            frame_pages: Mutex::new(vec![INVALID_PAGE_ID; pool_size]),
            free_list: Mutex::new((0..pool_size).collect()),
            replacer: Mutex::new(replacer),
            miss_lock: Mutex::new(()),
            pool_size: AtomicUsize::new(pool_size),
            num_hits: AtomicUsize::new(0),
            num_accesses: AtomicUsize::new(0),
            num_replacements: AtomicUsize::new(0),
            num_writebacks: AtomicUsize::new(0),
            flush_interval_ms: AtomicU64::new(config.flush_interval_ms),
            max_flush_per_cycle: AtomicUsize::new(config.max_flush_per_cycle),
            flusher_stop: Mutex::new(None),
            flusher_handle: Mutex::new(None),
            readahead_enabled: AtomicBool::new(config.readahead_enabled),
            readahead_window: AtomicU32::new(config.readahead_window),
            last_fetched: AtomicU32::new(INVALID_PAGE_ID),
            prefetch_tx: Mutex::new(None),
            prefetch_handles: Mutex::new(Vec::new()),
            autoresize_enabled: AtomicBool::new(config.autoresize_enabled),
            running: AtomicBool::new(true),
        });

        if config.flush_interval_ms > 0 {
            pool.start_background_flusher();
        }
        if config.readahead_enabled && config.io_worker_threads > 0 {
            pool.start_readahead_workers(config.io_worker_threads);
        }
        pool
    }

    fn shard_index(page_id: PageId) -> usize {
        page_id as usize & (SHARD_COUNT - 1)
    }

    fn frame(&self, frame_id: FrameId) -> Arc<Page> {
        Arc::clone(&self.frames.read().unwrap()[frame_id])
    }

    /// Fetch a pinned reference to a page, loading it from disk on a miss.
    /// The pin is released when the returned guard drops.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard, SmallError> {
        let guard = self.fetch_page_inner(page_id)?;
        self.maybe_readahead(page_id);
        Ok(guard)
    }

    fn fetch_page_inner(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard, SmallError> {
        if page_id == INVALID_PAGE_ID {
            return Err(SmallError::new(ErrorKind::InvalidParam, "invalid page id"));
        }
        self.num_accesses.fetch_add(1, Ordering::Relaxed);

        if let Some(guard) = self.try_fetch_resident(page_id) {
            self.num_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(guard);
        }

        let _miss = self.miss_lock.lock().unwrap();

        // another thread may have loaded the page while we waited
        if let Some(guard) = self.try_fetch_resident(page_id) {
            self.num_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(guard);
        }

        let frame_id = self.obtain_frame()?;
        let page = self.frame(frame_id);

        {
            let mut data = page.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut data) {
                drop(data);
                self.free_list.lock().unwrap().push_front(frame_id);
                return Err(e);
            }
        }

        page.set_dirty(false);
        page.pin();
        self.frame_pages.lock().unwrap()[frame_id] = page_id;
        self.shards[Self::shard_index(page_id)]
            .write()
            .unwrap()
            .insert(page_id, frame_id);
        self.replacer.lock().unwrap().pin(frame_id);

        Ok(PageGuard::new(Arc::clone(self), page, page_id))
    }

    /// Hit path: pin the page while holding its shard lock so eviction
    /// (which re-checks the pin count under the same lock) cannot race us.
    fn try_fetch_resident(self: &Arc<Self>, page_id: PageId) -> Option<PageGuard> {
        let shard = self.shards[Self::shard_index(page_id)].read().unwrap();
        let frame_id = *shard.get(&page_id)?;
        let page = self.frame(frame_id);
        page.pin();
        drop(shard);
        self.replacer.lock().unwrap().pin(frame_id);
        Some(PageGuard::new(Arc::clone(self), page, page_id))
    }

    /// Allocate a fresh page id and hand back a pinned, zeroed frame for
    /// it. Nothing is written to disk until the page is flushed.
    pub fn new_page(self: &Arc<Self>) -> Result<(PageId, PageGuard), SmallError> {
        let _miss = self.miss_lock.lock().unwrap();

        let frame_id = self.obtain_frame()?;
        let page = self.frame(frame_id);
        let page_id = self.disk.allocate_page();

        {
            let mut data = page.write_data();
            data.iter_mut().for_each(|b| *b = 0);
        }

        page.set_dirty(false);
        page.pin();
        self.frame_pages.lock().unwrap()[frame_id] = page_id;
        self.shards[Self::shard_index(page_id)]
            .write()
            .unwrap()
            .insert(page_id, frame_id);
        self.replacer.lock().unwrap().pin(frame_id);

        debug!("new page {} in frame {}", page_id, frame_id);
        Ok((page_id, PageGuard::new(Arc::clone(self), page, page_id)))
    }

    /// Pick a frame for a new resident page: a free frame when one exists,
    /// otherwise an eviction victim. Caller must hold the miss lock.
    fn obtain_frame(&self) -> Result<FrameId, SmallError> {
        loop {
            if let Some(frame_id) = self.free_list.lock().unwrap().pop_front() {
                return Ok(frame_id);
            }

            let victim = self.replacer.lock().unwrap().victim();
            let frame_id = match victim {
                Some(f) => f,
                None => {
                    if self.autoresize_enabled.load(Ordering::Acquire) && self.try_grow() {
                        continue;
                    }
                    return Err(SmallError::new(
                        ErrorKind::BufferFull,
                        "no free frame and nothing evictable",
                    ));
                }
            };

            let page = self.frame(frame_id);
            let old_page_id = self.frame_pages.lock().unwrap()[frame_id];
            if old_page_id == INVALID_PAGE_ID {
                return Ok(frame_id);
            }

            // the pin count is re-checked under the shard lock: the hit
            // path pins while holding it, so a page seen unpinned here
            // cannot gain a pin after we removed the mapping
            {
                let mut shard = self.shards[Self::shard_index(old_page_id)].write().unwrap();
                if page.pin_count() > 0 {
                    // pinned after all; it re-enters the replacer on unpin
                    continue;
                }
                shard.remove(&old_page_id);
            }
            self.frame_pages.lock().unwrap()[frame_id] = INVALID_PAGE_ID;

            if page.is_dirty() {
                if let Err(e) = self.write_back(old_page_id, &page) {
                    // restore the mapping; the page is still intact in memory
                    self.frame_pages.lock().unwrap()[frame_id] = old_page_id;
                    self.shards[Self::shard_index(old_page_id)]
                        .write()
                        .unwrap()
                        .insert(old_page_id, frame_id);
                    self.replacer.lock().unwrap().unpin(frame_id);
                    return Err(e);
                }
            }

            self.num_replacements.fetch_add(1, Ordering::Relaxed);
            debug!("evicted page {} from frame {}", old_page_id, frame_id);
            return Ok(frame_id);
        }
    }

    /// Log the after-image, then write the page to the database file. The
    /// dirty flag is cleared under the page's read lock before the write
    /// completes, so a later mutation re-dirties the page even if it races
    /// with us.
    fn write_back(&self, page_id: PageId, page: &Page) -> SmallResult {
        let data = page.read_data();
        page.set_dirty(false);
        let result = self
            .disk
            .wal()
            .append(page_id, &data)
            .and_then(|_| self.disk.write_page(page_id, &data));
        drop(data);

        match result {
            Ok(()) => {
                self.num_writebacks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                page.set_dirty(true);
                Err(e)
            }
        }
    }

    /// Drop one pin, ORing in the caller's dirty flag. When the count
    /// reaches zero the frame becomes evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> SmallResult {
        let shard = self.shards[Self::shard_index(page_id)].read().unwrap();
        let frame_id = match shard.get(&page_id) {
            Some(&f) => f,
            None => {
                return Err(SmallError::new(
                    ErrorKind::NotFound,
                    &format!("page {} is not resident", page_id),
                ))
            }
        };
        let page = self.frame(frame_id);
        drop(shard);

        if is_dirty {
            page.set_dirty(true);
        }
        match page.unpin() {
            None => Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("page {} was not pinned", page_id),
            )),
            Some(0) => {
                self.replacer.lock().unwrap().unpin(frame_id);
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Write a resident dirty page through to disk. A page that is not
    /// resident (or is clean) is left alone.
    pub fn flush_page(&self, page_id: PageId) -> SmallResult {
        let _miss = self.miss_lock.lock().unwrap();
        self.flush_page_locked(page_id)
    }

    fn flush_page_locked(&self, page_id: PageId) -> SmallResult {
        let frame_id = {
            let shard = self.shards[Self::shard_index(page_id)].read().unwrap();
            match shard.get(&page_id) {
                Some(&f) => f,
                None => return Ok(()),
            }
        };
        let page = self.frame(frame_id);
        if !page.is_dirty() {
            return Ok(());
        }
        self.write_back(page_id, &page)
    }

    /// Drop a page from the pool and return its id to the allocator. Only
    /// legal while nothing holds a pin on it.
    pub fn delete_page(&self, page_id: PageId) -> SmallResult {
        let _miss = self.miss_lock.lock().unwrap();

        let frame_id = {
            let mut shard = self.shards[Self::shard_index(page_id)].write().unwrap();
            match shard.get(&page_id) {
                Some(&f) => {
                    let page = self.frame(f);
                    if page.pin_count() > 0 {
                        return Err(SmallError::new(
                            ErrorKind::InvalidParam,
                            &format!("page {} is pinned", page_id),
                        ));
                    }
                    shard.remove(&page_id);
                    Some(f)
                }
                None => None,
            }
        };

        if let Some(frame_id) = frame_id {
            let page = self.frame(frame_id);
            self.frame_pages.lock().unwrap()[frame_id] = INVALID_PAGE_ID;
            self.replacer.lock().unwrap().pin(frame_id);
            if page.is_dirty() {
                self.write_back(page_id, &page)?;
            }
            page.reset();
            self.free_list.lock().unwrap().push_back(frame_id);
        }

        self.disk.deallocate_page(page_id);
        Ok(())
    }

    /// Write every dirty resident page through, then durably flush the
    /// database file. The miss lock is held throughout so no frame is
    /// remapped mid-flush.
    pub fn flush_all_pages(&self) -> SmallResult {
        let _miss = self.miss_lock.lock().unwrap();

        let mapped: Vec<(FrameId, PageId)> = {
            let frame_pages = self.frame_pages.lock().unwrap();
            frame_pages
                .iter()
                .enumerate()
                .filter(|(_, pid)| **pid != INVALID_PAGE_ID)
                .map(|(fid, pid)| (fid, *pid))
                .collect()
        };

        for (frame_id, page_id) in mapped {
            let page = self.frame(frame_id);
            if page.is_dirty() {
                self.write_back(page_id, &page)?;
            }
        }
        self.disk.flush_all()
    }

    // ------------------------------------------------------------------
    // background flusher
    // ------------------------------------------------------------------

    fn start_background_flusher(self: &Arc<Self>) {
        let (tx, rx) = channel::bounded::<()>(1);
        *self.flusher_stop.lock().unwrap() = Some(tx);

        let pool = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("bp-flusher".to_string())
            .spawn(move || loop {
                let interval = pool.flush_interval_ms.load(Ordering::Acquire).max(1);
                match rx.recv_timeout(Duration::from_millis(interval)) {
                    Err(RecvTimeoutError::Timeout) => pool.flush_cycle(),
                    _ => break,
                }
            })
            .expect("spawn flusher thread");
        *self.flusher_handle.lock().unwrap() = Some(handle);
        info!("background flusher started");
    }

    /// One flusher pass: write back at most `max_flush_per_cycle` dirty
    /// unpinned pages. Pinned pages are skipped; the write-back itself
    /// holds the page's read lock, so a torn image is never observed.
    fn flush_cycle(&self) {
        let max_flush = self.max_flush_per_cycle.load(Ordering::Acquire);
        let mut flushed = 0;

        let mapped: Vec<(FrameId, PageId)> = {
            let frame_pages = self.frame_pages.lock().unwrap();
            frame_pages
                .iter()
                .enumerate()
                .filter(|(_, pid)| **pid != INVALID_PAGE_ID)
                .map(|(fid, pid)| (fid, *pid))
                .collect()
        };

        for (frame_id, page_id) in mapped {
            if flushed >= max_flush {
                break;
            }
            let _miss = self.miss_lock.lock().unwrap();
            // the snapshot may be stale; re-verify under the miss lock
            if self.frame_pages.lock().unwrap()[frame_id] != page_id {
                continue;
            }
            let page = self.frame(frame_id);
            if !page.is_dirty() || page.pin_count() > 0 {
                continue;
            }
            match self.write_back(page_id, &page) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!("background flush of page {} failed: {}", page_id, e);
                    break;
                }
            }
        }

        if flushed > 0 {
            debug!("background flusher wrote {} pages", flushed);
        }
    }

    // ------------------------------------------------------------------
    // sequential read-ahead
    // ------------------------------------------------------------------

    fn start_readahead_workers(self: &Arc<Self>, workers: usize) {
        let (tx, rx) = channel::unbounded::<PageId>();
        *self.prefetch_tx.lock().unwrap() = Some(tx);

        let mut handles = self.prefetch_handles.lock().unwrap();
        for i in 0..workers {
            let pool = Arc::clone(self);
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bp-prefetch-{}", i))
                .spawn(move || {
                    for page_id in rx.iter() {
                        if !pool.running.load(Ordering::Acquire) {
                            break;
                        }
                        if pool.is_resident(page_id) {
                            continue;
                        }
                        // best effort: errors are ignored, the guard is
                        // dropped immediately so the page is unpinned
                        let _ = pool.fetch_page_inner(page_id);
                    }
                })
                .expect("spawn prefetch thread");
            handles.push(handle);
        }
        info!("{} read-ahead workers started", workers);
    }

    fn is_resident(&self, page_id: PageId) -> bool {
        self.shards[Self::shard_index(page_id)]
            .read()
            .unwrap()
            .contains_key(&page_id)
    }

    /// Detect a sequential scan: a fetch of `last + 1` queues the next
    /// `readahead_window` page ids for background prefetch.
    fn maybe_readahead(&self, page_id: PageId) {
        let last = self.last_fetched.swap(page_id, Ordering::AcqRel);
        if !self.readahead_enabled.load(Ordering::Acquire) {
            return;
        }
        if last == INVALID_PAGE_ID || page_id != last.wrapping_add(1) {
            return;
        }

        let window = self.readahead_window.load(Ordering::Acquire);
        let known_pages = self.disk.num_pages();
        let tx_guard = self.prefetch_tx.lock().unwrap();
        if let Some(tx) = tx_guard.as_ref() {
            for ahead in 1..=window {
                let next = page_id.wrapping_add(ahead);
                if next >= known_pages {
                    break;
                }
                let _ = tx.try_send(next);
            }
        }
    }

    // ------------------------------------------------------------------
    // sizing
    // ------------------------------------------------------------------

    /// Grow the pool. Shrinking is not supported.
    pub fn resize_pool(&self, new_size: usize) -> bool {
        let _miss = self.miss_lock.lock().unwrap();
        self.grow_locked(new_size)
    }

    fn try_grow(&self) -> bool {
        let current = self.pool_size.load(Ordering::Acquire);
        self.grow_locked(current + current / 2 + 1)
    }

    fn grow_locked(&self, new_size: usize) -> bool {
        let current = self.pool_size.load(Ordering::Acquire);
        if new_size <= current {
            return false;
        }

        let mut frames = self.frames.write().unwrap();
        let mut frame_pages = self.frame_pages.lock().unwrap();
        let mut free_list = self.free_list.lock().unwrap();
        for frame_id in current..new_size {
            frames.push(Arc::new(Page::new()));
            frame_pages.push(INVALID_PAGE_ID);
            free_list.push_back(frame_id);
        }
        self.replacer.lock().unwrap().set_capacity(new_size);
        self.pool_size.store(new_size, Ordering::Release);
        info!("buffer pool grown from {} to {} frames", current, new_size);
        true
    }

    // ------------------------------------------------------------------
    // lifecycle and statistics
    // ------------------------------------------------------------------

    /// Stop the flusher and read-ahead workers. Does not flush; callers
    /// checkpoint explicitly before closing the disk manager.
    pub fn stop_workers(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.flusher_stop.lock().unwrap().take() {
            drop(tx);
        }
        if let Some(handle) = self.flusher_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(tx) = self.prefetch_tx.lock().unwrap().take() {
            drop(tx);
        }
        let mut handles = self.prefetch_handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Acquire)
    }

    pub fn free_frames_count(&self) -> usize {
        self.free_list.lock().unwrap().len()
    }

    pub fn hit_rate(&self) -> f64 {
        let accesses = self.num_accesses.load(Ordering::Relaxed);
        if accesses == 0 {
            return 0.0;
        }
        self.num_hits.load(Ordering::Relaxed) as f64 / accesses as f64
    }

    pub fn num_hits(&self) -> usize {
        self.num_hits.load(Ordering::Relaxed)
    }

    pub fn num_accesses(&self) -> usize {
        self.num_accesses.load(Ordering::Relaxed)
    }

    pub fn num_replacements(&self) -> usize {
        self.num_replacements.load(Ordering::Relaxed)
    }

    pub fn num_writebacks(&self) -> usize {
        self.num_writebacks.load(Ordering::Relaxed)
    }

    pub fn set_flush_interval_ms(&self, ms: u64) {
        self.flush_interval_ms.store(ms, Ordering::Release);
    }

    pub fn set_max_flush_per_cycle(&self, n: usize) {
        self.max_flush_per_cycle.store(n, Ordering::Release);
    }

    pub fn enable_readahead(&self, enabled: bool) {
        self.readahead_enabled.store(enabled, Ordering::Release);
    }
}

/// A pinned reference to a resident page.
///
/// Holding the guard is what keeps the page in its frame; dropping it
/// releases the pin (reporting the accumulated dirty flag), so a caller
/// cannot forget to unpin. Mutating through [`PageGuard::write`] marks the
/// page dirty.
pub struct PageGuard {
    pool: Arc<BufferPoolManager>,
    page: Arc<Page>,
    page_id: PageId,
    dirty: AtomicBool,
}

impl std::fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .finish()
    }
}

impl PageGuard {
    fn new(pool: Arc<BufferPoolManager>, page: Arc<Page>, page_id: PageId) -> Self {
        Self {
            pool,
            page,
            page_id,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Shared access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.page.read_data()
    }

    /// Exclusive access to the page bytes; the page is reported dirty when
    /// the guard drops.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.dirty.store(true, Ordering::Release);
        self.page.write_data()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let dirty = self.dirty.load(Ordering::Acquire);
        if let Err(e) = self.pool.unpin_page(self.page_id, dirty) {
            error!("unpin of page {} failed: {}", self.page_id, e);
        }
    }
}
