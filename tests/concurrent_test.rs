mod test_utils;

use std::sync::Arc;
use std::thread;

use small_base::{Database, ErrorKind, QueryResult};
use test_utils::{new_temp_dir, open_database, open_engine, quiet_config, rows_of, run, setup};

/// Two mutators appending to the same page serialize on the page's write
/// lock; afterwards iteration sees some interleaving of both append
/// sequences, with nothing lost.
#[test]
fn test_concurrent_appends_linearize() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());

    let (page_id, guard) = engine.create_data_page().unwrap();
    drop(guard);

    let mut handles = Vec::new();
    for writer in 0..2u8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..20u8 {
                let guard = engine.get_data_page(page_id).unwrap();
                let record = [writer, i];
                engine.append_record(&guard, &record).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let guard = engine.get_data_page(page_id).unwrap();
    let mut per_writer = vec![Vec::new(), Vec::new()];
    engine.for_each_record(&guard, |_, bytes| {
        per_writer[bytes[0] as usize].push(bytes[1]);
    });

    // each writer's own records appear in its append order
    for sequence in &per_writer {
        assert_eq!(sequence.len(), 20);
        let expected: Vec<u8> = (0..20).collect();
        assert_eq!(sequence, &expected);
    }
}

/// Readers hammering a pool far smaller than the page set always observe
/// the bytes written before the stress started. FIFO eviction keeps
/// victims available whenever any frame is unpinned; fetches that catch
/// the pool with every frame transiently pinned back off and retry.
#[test]
fn test_concurrent_reads_under_eviction() {
    setup();
    let dir = new_temp_dir();
    let mut config = quiet_config();
    config.buffer_pool_pages = 8;
    config.replacement_policy = small_base::ReplacementPolicy::Fifo;
    let engine = open_engine(&dir, &config);

    let mut page_ids = Vec::new();
    for i in 0..32u8 {
        let (page_id, guard) = engine.create_data_page().unwrap();
        guard.write()[64] = i;
        drop(guard);
        page_ids.push(page_id);
    }
    engine.checkpoint().unwrap();
    let page_ids = Arc::new(page_ids);

    let mut handles = Vec::new();
    for seed in 0..4usize {
        let engine = Arc::clone(&engine);
        let page_ids = Arc::clone(&page_ids);
        handles.push(thread::spawn(move || {
            for round in 0..200usize {
                let pick = (seed * 31 + round * 17) % page_ids.len();
                loop {
                    match engine.get_data_page(page_ids[pick]) {
                        Ok(guard) => {
                            assert_eq!(guard.read()[64], pick as u8);
                            break;
                        }
                        Err(e) if e.kind == ErrorKind::BufferFull => thread::yield_now(),
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = engine.stats();
    assert!(stats.replacements > 0);
    assert!(stats.hits <= stats.accesses);
}

/// Concurrent INSERT statements against one table: every row lands
/// exactly once.
#[test]
fn test_concurrent_inserts_through_executor() {
    setup();
    let dir = new_temp_dir();
    let db = Arc::new(open_database(&dir));
    run(&db, "CREATE TABLE log(writer INT, seq INT)");

    let mut handles = Vec::new();
    for writer in 0..4i32 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for seq in 0..25i32 {
                db.run_sql(
                    &format!("INSERT INTO log VALUES ({}, {})", writer, seq),
                    "root",
                )
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let result = run(&db, "SELECT writer FROM log");
    assert_eq!(rows_of(&result).len(), 100);

    // each writer contributed each sequence number exactly once
    for writer in 0..4 {
        let result = run(
            &db,
            &format!("SELECT seq FROM log WHERE writer = {}", writer),
        );
        let mut seqs: Vec<i32> = rows_of(&result)
            .into_iter()
            .map(|r| r[0].parse().unwrap())
            .collect();
        seqs.sort_unstable();
        let expected: Vec<i32> = (0..25).collect();
        assert_eq!(seqs, expected);
    }
}

/// Statements keep succeeding while the background flusher runs.
#[test]
fn test_mutations_with_background_flusher() {
    setup();
    let dir = new_temp_dir();
    let mut config = quiet_config();
    config.flush_interval_ms = 5;
    config.max_flush_per_cycle = 4;
    let db = Database::open(test_utils::scratch_db_path(&dir), &config).unwrap();

    run(&db, "CREATE TABLE t(a INT)");
    for i in 0..200 {
        run(&db, &format!("INSERT INTO t VALUES ({})", i));
    }
    let result = run(&db, "SELECT a FROM t WHERE a >= 150");
    match result {
        QueryResult::Rows { rows, .. } => assert_eq!(rows.len(), 50),
        QueryResult::Summary(s) => panic!("unexpected summary {}", s),
    }
    db.shutdown();
}
