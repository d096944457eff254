mod test_utils;

use small_base::{DiskManager, PAGE_SIZE};
use test_utils::{new_temp_dir, scratch_db_path, setup};

#[test]
fn test_first_touch_reads_zeroes() {
    setup();
    let dir = new_temp_dir();
    let dm = DiskManager::open(scratch_db_path(&dir)).unwrap();

    let mut buf = vec![0xAAu8; PAGE_SIZE];
    dm.read_page(7, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn test_write_read_round_trip() {
    setup();
    let dir = new_temp_dir();
    let dm = DiskManager::open(scratch_db_path(&dir)).unwrap();

    let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    dm.write_page(3, &page).unwrap();

    let mut read_back = vec![0u8; PAGE_SIZE];
    dm.read_page(3, &mut read_back).unwrap();
    assert_eq!(read_back, page);

    // writing page 3 materializes pages 0..=3
    assert_eq!(dm.num_pages(), 4);
    assert_eq!(dm.num_writes(), 1);
    assert_eq!(dm.num_reads(), 1);
}

#[test]
fn test_allocate_reuses_freed_ids() {
    setup();
    let dir = new_temp_dir();
    let dm = DiskManager::open(scratch_db_path(&dir)).unwrap();

    let a = dm.allocate_page();
    let b = dm.allocate_page();
    assert_eq!((a, b), (0, 1));

    dm.deallocate_page(a);
    assert_eq!(dm.allocate_page(), a);
    assert_eq!(dm.allocate_page(), 2);
}

#[test]
fn test_file_length_is_page_aligned() {
    setup();
    let dir = new_temp_dir();
    let path = scratch_db_path(&dir);
    let dm = DiskManager::open(&path).unwrap();

    let page = vec![1u8; PAGE_SIZE];
    dm.write_page(0, &page).unwrap();
    dm.write_page(2, &page).unwrap();
    dm.flush_all().unwrap();
    dm.shutdown();

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len % PAGE_SIZE as u64, 0);
    assert_eq!(len, 3 * PAGE_SIZE as u64);
}

#[test]
fn test_high_water_mark_survives_reopen() {
    setup();
    let dir = new_temp_dir();
    let path = scratch_db_path(&dir);

    {
        let dm = DiskManager::open(&path).unwrap();
        let page = vec![9u8; PAGE_SIZE];
        dm.write_page(4, &page).unwrap();
        dm.shutdown();
    }

    let dm = DiskManager::open(&path).unwrap();
    assert_eq!(dm.num_pages(), 5);
    assert_eq!(dm.allocate_page(), 5);
}

#[test]
fn test_shutdown_is_idempotent_and_final() {
    setup();
    let dir = new_temp_dir();
    let dm = DiskManager::open(scratch_db_path(&dir)).unwrap();

    dm.shutdown();
    dm.shutdown();

    let mut buf = vec![0u8; PAGE_SIZE];
    let e = dm.read_page(0, &mut buf).unwrap_err();
    assert_eq!(e.kind, small_base::ErrorKind::Io);
    let e = dm.write_page(0, &buf).unwrap_err();
    assert_eq!(e.kind, small_base::ErrorKind::Io);
}

#[test]
fn test_invalid_args_rejected() {
    setup();
    let dir = new_temp_dir();
    let dm = DiskManager::open(scratch_db_path(&dir)).unwrap();

    let mut short = vec![0u8; 16];
    assert_eq!(
        dm.read_page(0, &mut short).unwrap_err().kind,
        small_base::ErrorKind::InvalidParam
    );
    let mut buf = vec![0u8; PAGE_SIZE];
    assert_eq!(
        dm.read_page(small_base::INVALID_PAGE_ID, &mut buf)
            .unwrap_err()
            .kind,
        small_base::ErrorKind::InvalidParam
    );
}
