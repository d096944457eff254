use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{debug, info};

use crate::config::PAGE_SIZE;
use crate::error::{ErrorKind, SmallError};
use crate::storage::wal::WalManager;
use crate::types::{PageId, SmallResult, INVALID_PAGE_ID};

/// Exclusive owner of the database file.
///
/// Translates page ids to file offsets (`page_id * PAGE_SIZE`), allocates
/// page ids from a high-water mark (recycling freed ids first), and owns
/// the write-ahead log that sits next to the database file.
///
/// All file access is serialized by an internal mutex; the counters can be
/// read without any lock.
pub struct DiskManager {
    db_path: PathBuf,
    file: Mutex<File>,
    wal: WalManager,

    /// High-water mark: the next page id that has never been handed out.
    next_page_id: AtomicU32,
    /// Deallocated ids, reused before the high-water mark advances.
    free_page_ids: Mutex<VecDeque<PageId>>,

    num_reads: AtomicUsize,
    num_writes: AtomicUsize,
    is_shutdown: AtomicBool,
}

impl DiskManager {
    /// Open (or create) the database file and its side-by-side WAL file
    /// (`<db_file>.wal`). The high-water mark is inferred from the file
    /// length.
    pub fn open<P: AsRef<Path>>(db_file: P) -> Result<Self, SmallError> {
        let db_path = db_file.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_path)?;

        let size = file.metadata()?.len();
        let next_page_id = (size / PAGE_SIZE as u64) as PageId;

        let mut wal_path = db_path.clone().into_os_string();
        wal_path.push(".wal");
        let wal = WalManager::open(PathBuf::from(wal_path))?;

        info!(
            "opened database file {:?}, {} pages on disk",
            db_path, next_page_id
        );

        Ok(Self {
            db_path,
            file: Mutex::new(file),
            wal,
            next_page_id: AtomicU32::new(next_page_id),
            free_page_ids: Mutex::new(VecDeque::new()),
            num_reads: AtomicUsize::new(0),
            num_writes: AtomicUsize::new(0),
            is_shutdown: AtomicBool::new(false),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    fn file_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }

    fn check_open(&self) -> SmallResult {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(SmallError::new(ErrorKind::Io, "disk manager is shut down"));
        }
        Ok(())
    }

    /// Read one page into `buf`. Reading past the end of the file yields a
    /// zero-filled page (first-touch semantics for freshly allocated ids).
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> SmallResult {
        if page_id == INVALID_PAGE_ID || buf.len() != PAGE_SIZE {
            return Err(SmallError::new(ErrorKind::InvalidParam, "bad read_page args"));
        }

        let mut file = self.file.lock().unwrap();
        self.check_open()?;

        let offset = Self::file_offset(page_id);
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            buf.iter_mut().for_each(|b| *b = 0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0;
        while read_total < PAGE_SIZE {
            let n = file.read(&mut buf[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        // a short read at the tail of the file behaves like first touch
        buf[read_total..].iter_mut().for_each(|b| *b = 0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write exactly one page and flush it to the file. Advances the
    /// high-water mark when the write lands past it.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> SmallResult {
        if page_id == INVALID_PAGE_ID || buf.len() != PAGE_SIZE {
            return Err(SmallError::new(ErrorKind::InvalidParam, "bad write_page args"));
        }

        let mut file = self.file.lock().unwrap();
        self.check_open()?;

        file.seek(SeekFrom::Start(Self::file_offset(page_id)))?;
        file.write_all(buf)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        self.next_page_id.fetch_max(page_id + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Hand out a page id: a recycled one when available, otherwise the
    /// high-water mark.
    pub fn allocate_page(&self) -> PageId {
        if let Some(page_id) = self.free_page_ids.lock().unwrap().pop_front() {
            debug!("reusing freed page id {}", page_id);
            return page_id;
        }
        self.next_page_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Return a page id to the free queue. No on-disk change happens; the
    /// bytes stay where they are until the id is reused.
    pub fn deallocate_page(&self, page_id: PageId) {
        if page_id == INVALID_PAGE_ID {
            return;
        }
        self.free_page_ids.lock().unwrap().push_back(page_id);
    }

    /// Durably flush the database file.
    pub fn flush_all(&self) -> SmallResult {
        let file = self.file.lock().unwrap();
        self.check_open()?;
        file.sync_all()?;
        Ok(())
    }

    /// Idempotent close: flush and refuse further I/O.
    pub fn shutdown(&self) {
        let file = self.file.lock().unwrap();
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = file.sync_all();
        info!("disk manager shut down, {} pages", self.num_pages());
    }

    /// Current high-water mark, which equals the number of page ids ever
    /// handed out or materialized.
    pub fn num_pages(&self) -> PageId {
        self.next_page_id.load(Ordering::Acquire)
    }

    /// Raise the high-water mark to at least `min_next`. Used when opening
    /// a database whose meta page remembers a higher mark than the file
    /// length implies (pages allocated but never written back).
    pub fn ensure_next_page_id(&self, min_next: PageId) {
        self.next_page_id.fetch_max(min_next, Ordering::AcqRel);
    }

    pub fn num_reads(&self) -> usize {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> usize {
        self.num_writes.load(Ordering::Relaxed)
    }
}
