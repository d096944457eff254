mod test_utils;

use small_base::sql::plan_statement;
use small_base::{ErrorKind, PlanNode};
use test_utils::{new_temp_dir, open_database, rows_of, run, setup};

/// Lexical errors carry a source position.
#[test]
fn test_tokenizer_error_has_location() {
    setup();
    let e = plan_statement("SELECT 'unterminated FROM t").unwrap_err();
    assert_eq!(e.kind, ErrorKind::Parse);
    assert!(e.location().is_some());
}

#[test]
fn test_unsupported_statements_named() {
    setup();
    for sql in [
        "SELECT a FROM t ORDER BY a",
        "SELECT a FROM t LIMIT 3",
        "SELECT a, b FROM t1, t2",
        "SELECT count(a) FROM t",
        "SELECT a FROM t WHERE a IN (1,2)",
    ]
    .iter()
    {
        let e = plan_statement(sql).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Unsupported, "statement: {}", sql);
    }
}

#[test]
fn test_wildcard_projection() {
    setup();
    let plan = plan_statement("SELECT * FROM t").unwrap();
    match plan {
        PlanNode::Project { columns, .. } => assert_eq!(columns, vec!["*".to_string()]),
        other => panic!("expected projection, got {:?}", other),
    }

    let dir = new_temp_dir();
    let db = open_database(&dir);
    run(&db, "CREATE TABLE t(a INT, b VARCHAR(5))");
    run(&db, "INSERT INTO t VALUES (1, 'x')");
    let result = run(&db, "SELECT * FROM t");
    assert_eq!(
        rows_of(&result),
        vec![vec!["1".to_string(), "x".to_string()]]
    );
}

#[test]
fn test_insert_with_column_list() {
    setup();
    let dir = new_temp_dir();
    let db = open_database(&dir);
    run(&db, "CREATE TABLE t(a INT, b VARCHAR(5), c INT DEFAULT 9)");
    run(&db, "INSERT INTO t(b, a) VALUES ('x', 1)");

    let result = run(&db, "SELECT a, b, c FROM t");
    assert_eq!(
        rows_of(&result),
        vec![vec!["1".to_string(), "x".to_string(), "9".to_string()]]
    );
}

#[test]
fn test_insert_width_mismatch_is_semantic() {
    setup();
    let dir = new_temp_dir();
    let db = open_database(&dir);
    run(&db, "CREATE TABLE t(a INT, b INT)");

    let e = db.run_sql("INSERT INTO t VALUES (1)", "root").unwrap_err();
    assert_eq!(e.kind, ErrorKind::Semantic);
    let e = db
        .run_sql("INSERT INTO t(a) VALUES (1, 2)", "root")
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Semantic);
}

#[test]
fn test_type_mismatch_is_semantic() {
    setup();
    let dir = new_temp_dir();
    let db = open_database(&dir);
    run(&db, "CREATE TABLE t(a INT)");

    let e = db
        .run_sql("INSERT INTO t VALUES ('word')", "root")
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::Semantic);
}

#[test]
fn test_double_and_bigint_round_trip() {
    setup();
    let dir = new_temp_dir();
    let db = open_database(&dir);
    run(
        &db,
        "CREATE TABLE m(big BIGINT, ratio DOUBLE, label CHAR(4))",
    );
    run(&db, "INSERT INTO m VALUES (8589934592, 2.5, 'ab')");

    let result = run(&db, "SELECT big, ratio, label FROM m");
    assert_eq!(
        rows_of(&result),
        vec![vec![
            "8589934592".to_string(),
            "2.5".to_string(),
            "ab".to_string()
        ]]
    );

    // numeric predicates work over both
    let result = run(&db, "SELECT label FROM m WHERE big > 100 AND ratio < 3");
    assert_eq!(rows_of(&result), vec![vec!["ab".to_string()]]);
}

#[test]
fn test_string_predicate_filters() {
    setup();
    let dir = new_temp_dir();
    let db = open_database(&dir);
    run(&db, "CREATE TABLE t(name VARCHAR(10))");
    run(&db, "INSERT INTO t VALUES ('x'),('y')");

    let result = run(&db, "SELECT name FROM t WHERE name != 'x'");
    assert_eq!(rows_of(&result), vec![vec!["y".to_string()]]);
}
