use std::convert::TryInto;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use crate::config::{RuntimeConfig, PAGE_SIZE};
use crate::error::{ErrorKind, SmallError};
use crate::storage::buffer_pool::{BufferPoolManager, PageGuard};
use crate::storage::disk_manager::DiskManager;
use crate::storage::page_format::{self, PageType, PAGE_HEADER_SIZE};
use crate::types::{PageId, SmallResult, INVALID_PAGE_ID};

/// "SMALBASE", little-endian on disk.
pub const META_MAGIC: u64 = 0x534D_414C_4241_5345;

pub const META_VERSION: u32 = 1;

pub const META_INFO_SIZE: usize = 24;

/// Contents of page 0.
///
/// # Format (page payload, little-endian, after the page header)
///
/// - 8 bytes: magic
/// - 4 bytes: format version
/// - 4 bytes: page size
/// - 4 bytes: next page id (high-water mark at last checkpoint)
/// - 4 bytes: catalog root page id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetaInfo {
    pub magic: u64,
    pub version: u32,
    pub page_size: u32,
    pub next_page_id: PageId,
    pub catalog_root: PageId,
}

impl MetaInfo {
    pub fn encode(&self) -> [u8; META_INFO_SIZE] {
        let mut out = [0u8; META_INFO_SIZE];
        out[0..8].copy_from_slice(&self.magic.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.next_page_id.to_le_bytes());
        out[20..24].copy_from_slice(&self.catalog_root.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= META_INFO_SIZE);
        Self {
            magic: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            version: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            page_size: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            next_page_id: PageId::from_le_bytes(bytes[16..20].try_into().unwrap()),
            catalog_root: PageId::from_le_bytes(bytes[20..24].try_into().unwrap()),
        }
    }
}

/// Counters reported by `.info` and the tests.
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub num_pages: PageId,
    pub disk_reads: usize,
    pub disk_writes: usize,
    pub pool_size: usize,
    pub free_frames: usize,
    pub hits: usize,
    pub accesses: usize,
    pub hit_rate: f64,
    pub replacements: usize,
    pub writebacks: usize,
    pub wal_bytes: u64,
}

/// The storage API consumed by the catalog, the executor and the B+ tree.
///
/// Everything above this layer works with typed, pinned [`PageGuard`]s;
/// asking for a page under the wrong type fails without interpreting the
/// payload, which is how structural corruption is caught at read time.
pub struct StorageEngine {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    io_batch_max: usize,
    is_shutdown: AtomicBool,
}

impl StorageEngine {
    /// Open (or create) a database: replay the WAL into the data file,
    /// start the buffer pool and make sure page 0 holds a valid meta page.
    pub fn open<P: AsRef<Path>>(db_file: P, config: &RuntimeConfig) -> Result<Self, SmallError> {
        let disk = Arc::new(DiskManager::open(db_file)?);
        disk.wal().recover(&disk)?;

        let pool = BufferPoolManager::new(Arc::clone(&disk), config);
        let engine = Self {
            disk,
            pool,
            io_batch_max: config.io_batch_max.max(1),
            is_shutdown: AtomicBool::new(false),
        };
        engine.bootstrap_meta()?;
        Ok(engine)
    }

    fn bootstrap_meta(&self) -> SmallResult {
        if self.disk.num_pages() == 0 {
            self.initialize_meta_page()?;
            return Ok(());
        }

        let meta = self.get_meta_info()?;
        if meta.page_size as usize != PAGE_SIZE {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("database uses page size {}", meta.page_size),
            ));
        }
        // pages may have been allocated but never written before the last
        // shutdown; never hand their ids out again
        self.disk.ensure_next_page_id(meta.next_page_id);
        Ok(())
    }

    /// Create page 0 and stamp it with a fresh [`MetaInfo`].
    pub fn initialize_meta_page(&self) -> SmallResult {
        let (page_id, guard) = self.pool.new_page()?;
        if page_id != 0 {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("meta page must be page 0, allocator produced {}", page_id),
            ));
        }

        let meta = MetaInfo {
            magic: META_MAGIC,
            version: META_VERSION,
            page_size: PAGE_SIZE as u32,
            next_page_id: 1,
            catalog_root: INVALID_PAGE_ID,
        };
        {
            let mut data = guard.write();
            page_format::initialize_page(&mut data, PageType::Meta);
            let bytes = meta.encode();
            data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(&bytes);
        }
        drop(guard);
        self.pool.flush_page(0)?;
        info!("initialized fresh database");
        Ok(())
    }

    pub fn get_meta_info(&self) -> Result<MetaInfo, SmallError> {
        let guard = self.get_meta_page()?;
        let data = guard.read();
        let meta = MetaInfo::decode(&data[PAGE_HEADER_SIZE..]);
        if meta.magic != META_MAGIC {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                "page 0 does not carry the meta magic",
            ));
        }
        Ok(meta)
    }

    /// Overwrite the meta page. The page image goes through the WAL before
    /// it reaches the database file, so a torn meta update is recoverable.
    pub fn update_meta_info(&self, meta: &MetaInfo) -> SmallResult {
        let guard = self.get_meta_page()?;
        {
            let mut data = guard.write();
            let bytes = meta.encode();
            data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(&bytes);
        }
        drop(guard);
        self.pool.flush_page(0)
    }

    pub fn get_catalog_root(&self) -> Result<PageId, SmallError> {
        Ok(self.get_meta_info()?.catalog_root)
    }

    pub fn set_catalog_root(&self, root: PageId) -> SmallResult {
        let mut meta = self.get_meta_info()?;
        meta.catalog_root = root;
        meta.next_page_id = self.disk.num_pages();
        self.update_meta_info(&meta)
    }

    pub fn get_next_page_id(&self) -> PageId {
        self.disk.num_pages()
    }

    // ------------------------------------------------------------------
    // typed page creation
    // ------------------------------------------------------------------

    fn create_page(&self, page_type: PageType) -> Result<(PageId, PageGuard), SmallError> {
        let (page_id, guard) = self.pool.new_page()?;
        {
            let mut data = guard.write();
            page_format::initialize_page(&mut data, page_type);
        }
        Ok((page_id, guard))
    }

    pub fn create_data_page(&self) -> Result<(PageId, PageGuard), SmallError> {
        self.create_page(PageType::Data)
    }

    pub fn create_index_page(&self) -> Result<(PageId, PageGuard), SmallError> {
        self.create_page(PageType::Index)
    }

    pub fn create_catalog_page(&self) -> Result<(PageId, PageGuard), SmallError> {
        self.create_page(PageType::Catalog)
    }

    // ------------------------------------------------------------------
    // typed page retrieval
    // ------------------------------------------------------------------

    /// All typed accessors validate the on-disk page type the same way; a
    /// mismatch fails before anything interprets the payload.
    fn get_page_typed(&self, page_id: PageId, expected: PageType) -> Result<PageGuard, SmallError> {
        let guard = self.pool.fetch_page(page_id)?;
        let actual = page_format::page_type(&guard.read());
        if actual != Some(expected) {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!(
                    "page {} is not a {} page (found {})",
                    page_id,
                    expected.name(),
                    actual.map(|t| t.name()).unwrap_or("unknown"),
                ),
            ));
        }
        Ok(guard)
    }

    pub fn get_data_page(&self, page_id: PageId) -> Result<PageGuard, SmallError> {
        self.get_page_typed(page_id, PageType::Data)
    }

    pub fn get_index_page(&self, page_id: PageId) -> Result<PageGuard, SmallError> {
        self.get_page_typed(page_id, PageType::Index)
    }

    pub fn get_catalog_page(&self, page_id: PageId) -> Result<PageGuard, SmallError> {
        self.get_page_typed(page_id, PageType::Catalog)
    }

    pub fn get_meta_page(&self) -> Result<PageGuard, SmallError> {
        self.get_page_typed(0, PageType::Meta)
    }

    /// Fetch several pages in one call. The batch is capped by the
    /// configured `io_batch_max` so one caller cannot pin an unbounded
    /// slice of the pool; the first failure aborts.
    pub fn get_pages(&self, page_ids: &[PageId]) -> Result<Vec<PageGuard>, SmallError> {
        if page_ids.len() > self.io_batch_max {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!(
                    "batch of {} pages exceeds the configured maximum {}",
                    page_ids.len(),
                    self.io_batch_max
                ),
            ));
        }
        let mut guards = Vec::with_capacity(page_ids.len());
        for page_id in page_ids {
            guards.push(self.pool.fetch_page(*page_id)?);
        }
        Ok(guards)
    }

    // ------------------------------------------------------------------
    // record operations
    // ------------------------------------------------------------------

    /// Append a record to a pinned page; `None` when the page is full.
    pub fn append_record(&self, guard: &PageGuard, bytes: &[u8]) -> Option<u16> {
        if page_format::free_space(&guard.read()) < bytes.len() + page_format::SLOT_SIZE {
            return None;
        }
        let mut data = guard.write();
        page_format::append_row(&mut data, bytes)
    }

    /// Tombstone one record.
    pub fn delete_record(&self, guard: &PageGuard, slot: u16) -> SmallResult {
        let mut data = guard.write();
        if !page_format::delete_row(&mut data, slot) {
            return Err(SmallError::new(
                ErrorKind::NotFound,
                &format!("slot {} not present in page {}", slot, guard.page_id()),
            ));
        }
        Ok(())
    }

    /// Replace a record in place; the new bytes must have the old length.
    pub fn update_record(&self, guard: &PageGuard, slot: u16, bytes: &[u8]) -> SmallResult {
        let mut data = guard.write();
        if !page_format::overwrite_row(&mut data, slot, bytes) {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("slot {} of page {} cannot take the record", slot, guard.page_id()),
            ));
        }
        Ok(())
    }

    pub fn get_record(&self, guard: &PageGuard, slot: u16) -> Option<Vec<u8>> {
        let data = guard.read();
        page_format::get_row(&data, slot).map(|r| r.to_vec())
    }

    pub fn for_each_record<F>(&self, guard: &PageGuard, f: F)
    where
        F: FnMut(u16, &[u8]),
    {
        let data = guard.read();
        page_format::for_each_row(&data, f);
    }

    // ------------------------------------------------------------------
    // page chains
    // ------------------------------------------------------------------

    /// Point `from`'s chain link at `to`.
    pub fn link_pages(&self, from: PageId, to: PageId) -> SmallResult {
        let guard = self.pool.fetch_page(from)?;
        let mut data = guard.write();
        page_format::set_next_page_id(&mut data, to);
        Ok(())
    }

    /// Walk the chain starting at `head`, returning pinned references in
    /// chain order. Dropping the guards unpins the pages.
    pub fn get_page_chain(&self, head: PageId) -> Result<Vec<PageGuard>, SmallError> {
        let mut guards = Vec::new();
        let mut next = head;
        let limit = self.disk.num_pages() as usize + 1;
        while next != INVALID_PAGE_ID {
            if guards.len() > limit {
                return Err(SmallError::new(
                    ErrorKind::InvalidParam,
                    &format!("page chain starting at {} loops", head),
                ));
            }
            let guard = self.pool.fetch_page(next)?;
            next = page_format::next_page_id(&guard.read());
            guards.push(guard);
        }
        Ok(guards)
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Make everything durable in the database file and drop the WAL.
    pub fn checkpoint(&self) -> SmallResult {
        let mut meta = self.get_meta_info()?;
        meta.next_page_id = self.disk.num_pages();
        self.update_meta_info(&meta)?;

        self.pool.flush_all_pages()?;
        self.disk.wal().truncate()
    }

    /// Checkpoint, stop the background workers and close the file.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.stop_workers();
        if let Err(e) = self.checkpoint() {
            log::error!("checkpoint during shutdown failed: {}", e);
        }
        self.disk.shutdown();
        info!("storage engine shut down");
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            num_pages: self.disk.num_pages(),
            disk_reads: self.disk.num_reads(),
            disk_writes: self.disk.num_writes(),
            pool_size: self.pool.pool_size(),
            free_frames: self.pool.free_frames_count(),
            hits: self.pool.num_hits(),
            accesses: self.pool.num_accesses(),
            hit_rate: self.pool.hit_rate(),
            replacements: self.pool.num_replacements(),
            writebacks: self.pool.num_writebacks(),
            wal_bytes: self.disk.wal().size().unwrap_or(0),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Drop a page from the pool and free its id for reuse.
    pub fn remove_page(&self, page_id: PageId) -> SmallResult {
        self.pool.delete_page(page_id)
    }

    /// Write one dirty page through (WAL first, then the data file).
    pub fn flush_page(&self, page_id: PageId) -> SmallResult {
        self.pool.flush_page(page_id)
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
