pub mod buffer_pool;
pub mod disk_manager;
pub mod engine;
pub mod page;
pub mod page_format;
pub mod replacer;
pub mod wal;

pub use buffer_pool::{BufferPoolManager, PageGuard};
pub use disk_manager::DiskManager;
pub use engine::{MetaInfo, StorageEngine, StorageStats};
pub use page::Page;
pub use page_format::{PageHeader, PageType, SlotEntry, PAGE_HEADER_SIZE, SLOT_SIZE};
pub use replacer::{FifoReplacer, LruReplacer, Replacer};
pub use wal::WalManager;
