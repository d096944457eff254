mod test_utils;

use small_base::storage::page_format;
use small_base::{ErrorKind, INVALID_PAGE_ID};
use test_utils::{new_temp_dir, open_engine, quiet_config, setup};

/// Asking for a page under the wrong type must fail for every accessor,
/// before the payload is interpreted.
#[test]
fn test_page_type_validation_is_uniform() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());

    let (data_id, guard) = engine.create_data_page().unwrap();
    drop(guard);
    let (index_id, guard) = engine.create_index_page().unwrap();
    drop(guard);
    let (catalog_id, guard) = engine.create_catalog_page().unwrap();
    drop(guard);

    // the right type works
    engine.get_data_page(data_id).unwrap();
    engine.get_index_page(index_id).unwrap();
    engine.get_catalog_page(catalog_id).unwrap();
    engine.get_meta_page().unwrap();

    // every wrong combination fails the same way
    assert_eq!(
        engine.get_index_page(data_id).unwrap_err().kind,
        ErrorKind::InvalidParam
    );
    assert_eq!(
        engine.get_data_page(index_id).unwrap_err().kind,
        ErrorKind::InvalidParam
    );
    assert_eq!(
        engine.get_catalog_page(data_id).unwrap_err().kind,
        ErrorKind::InvalidParam
    );
    assert_eq!(
        engine.get_data_page(0).unwrap_err().kind,
        ErrorKind::InvalidParam
    );
}

#[test]
fn test_meta_info_round_trip() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());

    let meta = engine.get_meta_info().unwrap();
    assert_eq!(meta.page_size as usize, small_base::PAGE_SIZE);
    assert_eq!(meta.catalog_root, INVALID_PAGE_ID);

    engine.set_catalog_root(9).unwrap();
    assert_eq!(engine.get_catalog_root().unwrap(), 9);

    let meta = engine.get_meta_info().unwrap();
    assert_eq!(meta.catalog_root, 9);
}

/// Page chains: link pages together, walk the chain, and observe the
/// pinned guards it returns.
#[test]
fn test_page_chain_walk() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (id, guard) = engine.create_data_page().unwrap();
        drop(guard);
        ids.push(id);
    }
    engine.link_pages(ids[0], ids[1]).unwrap();
    engine.link_pages(ids[1], ids[2]).unwrap();

    let chain = engine.get_page_chain(ids[0]).unwrap();
    let walked: Vec<_> = chain.iter().map(|g| g.page_id()).collect();
    assert_eq!(walked, ids);

    // the tail has no successor
    let tail = chain.last().unwrap();
    assert_eq!(page_format::next_page_id(&tail.read()), INVALID_PAGE_ID);
}

#[test]
fn test_record_wrappers() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());

    let (page_id, guard) = engine.create_data_page().unwrap();
    let a = engine.append_record(&guard, b"aaaa").unwrap();
    let b = engine.append_record(&guard, b"bbbb").unwrap();

    assert_eq!(engine.get_record(&guard, a).unwrap(), b"aaaa");
    engine.update_record(&guard, a, b"AAAA").unwrap();
    assert_eq!(engine.get_record(&guard, a).unwrap(), b"AAAA");

    engine.delete_record(&guard, a).unwrap();
    assert!(engine.get_record(&guard, a).is_none());

    let mut live = Vec::new();
    engine.for_each_record(&guard, |slot, bytes| live.push((slot, bytes.to_vec())));
    assert_eq!(live, vec![(b, b"bbbb".to_vec())]);

    drop(guard);
    engine.flush_page(page_id).unwrap();
}

#[test]
fn test_get_pages_respects_batch_cap() {
    setup();
    let dir = new_temp_dir();
    let mut config = quiet_config();
    config.io_batch_max = 2;
    let engine = open_engine(&dir, &config);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (id, guard) = engine.create_data_page().unwrap();
        drop(guard);
        ids.push(id);
    }

    let guards = engine.get_pages(&ids[..2]).unwrap();
    assert_eq!(guards.len(), 2);
    drop(guards);

    let e = engine.get_pages(&ids).unwrap_err();
    assert_eq!(e.kind, ErrorKind::InvalidParam);
}

#[test]
fn test_stats_report_counts() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());

    let (page_id, guard) = engine.create_data_page().unwrap();
    drop(guard);
    engine.get_data_page(page_id).unwrap();

    let stats = engine.stats();
    assert!(stats.num_pages >= 2);
    assert!(stats.hits <= stats.accesses);
    assert!(stats.hit_rate >= 0.0 && stats.hit_rate <= 1.0);
    assert_eq!(stats.pool_size, quiet_config().buffer_pool_pages);
}
