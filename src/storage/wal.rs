use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use log::{info, warn};

use crate::config::PAGE_SIZE;
use crate::error::{ErrorKind, SmallError};
use crate::storage::disk_manager::DiskManager;
use crate::types::{PageId, SmallResult};

/// "MDBWAL_1", little-endian on disk.
pub const WAL_MAGIC: u64 = 0x4D44_4257_414C_5F31;

const WAL_HEADER_SIZE: usize = 16;

/// Physical page-level write-ahead log.
///
/// Each record is the full after-image of one page:
///
/// ```text
/// { magic: u64, page_id: u32, length: u32 = PAGE_SIZE, bytes[PAGE_SIZE] }
/// ```
///
/// A record is appended (and fsync'd) before the corresponding page write
/// reaches the database file, so replaying the log after a crash is
/// idempotent: every valid record simply overwrites its page. A record
/// with a wrong magic or length, or one cut short by the crash, marks the
/// end of the recoverable prefix.
pub struct WalManager {
    path: PathBuf,
    file: Mutex<File>,
}

impl WalManager {
    pub fn open(path: PathBuf) -> Result<Self, SmallError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one page after-image and fsync the log.
    ///
    /// Must be called before the page itself is written to the database
    /// file; the disk write may then fail or be lost without breaking
    /// recoverability.
    pub fn append(&self, page_id: PageId, bytes: &[u8]) -> SmallResult {
        if bytes.len() != PAGE_SIZE {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                "wal records carry exactly one page",
            ));
        }

        // header and after-image as one contiguous append
        let mut record = Vec::with_capacity(WAL_HEADER_SIZE + PAGE_SIZE);
        record.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        record.extend_from_slice(&page_id.to_le_bytes());
        record.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        record.extend_from_slice(bytes);

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&record)?;
        file.sync_data()?;
        Ok(())
    }

    /// Replay the log into the database file. Returns the number of
    /// records applied. Scanning stops at the first record whose magic or
    /// length is wrong, or whose bytes were cut short (the torn tail of a
    /// crashed append).
    pub fn recover(&self, disk: &DiskManager) -> Result<usize, SmallError> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;

        let mut replayed = 0;
        loop {
            let mut header = [0u8; WAL_HEADER_SIZE];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let magic = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let page_id = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let length = u32::from_le_bytes(header[12..16].try_into().unwrap());
            if magic != WAL_MAGIC || length as usize != PAGE_SIZE {
                warn!("wal: invalid record header, stopping replay");
                break;
            }

            let mut page = vec![0u8; PAGE_SIZE];
            match file.read_exact(&mut page) {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::UnexpectedEof => {
                    warn!("wal: torn record for page {}, stopping replay", page_id);
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            disk.write_page(page_id, &page)?;
            replayed += 1;
        }

        if replayed > 0 {
            info!("wal: replayed {} records from {:?}", replayed, self.path);
        }
        Ok(replayed)
    }

    /// Discard all records. Called after a checkpoint has made every page
    /// image durable in the database file.
    pub fn truncate(&self) -> SmallResult {
        let file = self.file.lock().unwrap();
        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Current log size in bytes.
    pub fn size(&self) -> Result<u64, SmallError> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len())
    }
}
