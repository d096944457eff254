mod test_utils;

use std::io::Cursor;

use small_base::cli::Cli;
use test_utils::{new_temp_dir, open_database, rows_of, run, setup};

fn drive(db: small_base::Database, script: &str) -> (i32, String) {
    let mut cli = Cli::new(db);
    let mut output = Vec::new();
    let code = cli.run(Cursor::new(script.to_string()), &mut output);
    (code, String::from_utf8(output).unwrap())
}

#[test]
fn test_sql_round_trip_through_shell() {
    setup();
    let dir = new_temp_dir();
    let script = "\
CREATE TABLE t(a INT, b VARCHAR(10));
INSERT INTO t VALUES (1,'one'),(2,'two');
SELECT b FROM t WHERE a = 2;
.exit
";
    let (code, output) = drive(open_database(&dir), script);
    assert_eq!(code, 0);
    assert!(output.contains("table t created"));
    assert!(output.contains("2 rows inserted into t"));
    assert!(output.contains("two"));
    assert!(output.contains("(1 row)"));
}

#[test]
fn test_statement_spanning_lines() {
    setup();
    let dir = new_temp_dir();
    let script = "\
CREATE TABLE t(a INT);
INSERT INTO t
VALUES (1),
       (2);
SELECT a FROM t;
";
    let (_code, output) = drive(open_database(&dir), script);
    assert!(output.contains("2 rows inserted"));
    assert!(output.contains("(2 rows)"));
}

#[test]
fn test_errors_are_single_line_diagnostics() {
    setup();
    let dir = new_temp_dir();
    let script = "SELECT nope FROM missing;\nSELEKT;\n.exit\n";
    let (code, output) = drive(open_database(&dir), script);
    assert_eq!(code, 0);
    assert!(output.contains("NotFound:"));
    assert!(output.contains("ParseError:"));
}

#[test]
fn test_login_logout_users() {
    setup();
    let dir = new_temp_dir();
    let script = ".login alice\n.users\n.logout\n.exit\n";
    let (_code, output) = drive(open_database(&dir), script);
    assert!(output.contains("now acting as alice"));
    assert!(output.contains("* alice"));
    assert!(output.contains("now acting as root"));
}

#[test]
fn test_created_tables_belong_to_login_user() {
    setup();
    let dir = new_temp_dir();
    let script = ".login alice\nCREATE TABLE mine(x INT);\n.exit\n";
    let db = open_database(&dir);
    let (_code, _output) = drive(db, script);

    let db = open_database(&dir);
    assert_eq!(db.catalog().get_table_owner("mine").unwrap(), "alice");
}

#[test]
fn test_info_reports_stats() {
    setup();
    let dir = new_temp_dir();
    let script = "CREATE TABLE t(a INT);\n.info\n.exit\n";
    let (_code, output) = drive(open_database(&dir), script);
    assert!(output.contains("pages:"));
    assert!(output.contains("hit rate:"));
}

#[test]
fn test_dump_writes_page_report() {
    setup();
    let dir = new_temp_dir();
    let dump_path = dir.path().join("pages.txt");
    let script = format!(
        "CREATE TABLE t(a INT);\nINSERT INTO t VALUES (1);\n.dump {}\n.exit\n",
        dump_path.display()
    );
    let (_code, output) = drive(open_database(&dir), &script);
    assert!(output.contains("dumped"));

    let report = std::fs::read_to_string(&dump_path).unwrap();
    assert!(report.contains("type=meta"));
    assert!(report.contains("type=catalog"));
    assert!(report.contains("type=data"));
}

/// export produces a replayable script; importing it into a fresh
/// database reproduces the rows, and failures inside an import do not
/// stop the rest of the script.
#[test]
fn test_export_import_round_trip() {
    setup();
    let dir = new_temp_dir();
    let export_path = dir.path().join("dump.sql");

    {
        let db = open_database(&dir);
        run(&db, "CREATE TABLE t(a INT PRIMARY KEY, b VARCHAR(10))");
        run(&db, "INSERT INTO t VALUES (1,'it''s'),(2,'two')");
        run(&db, "CREATE INDEX idx_a ON t(a)");
        let script = format!(".export {}\n.exit\n", export_path.display());
        let (_code, output) = drive(db, &script);
        assert!(output.contains("exported"));
    }

    let other = new_temp_dir();
    let db = open_database(&other);
    let script = format!(".import {}\n.exit\n", export_path.display());
    let (_code, output) = drive(db, &script);
    assert!(output.contains("0 failed"), "output was: {}", output);

    let db = open_database(&other);
    let result = run(&db, "SELECT b FROM t WHERE a = 1");
    assert_eq!(rows_of(&result), vec![vec!["it's".to_string()]]);

    // replaying the same script again: the CREATE statements fail, the
    // import continues and reports them
    let db = open_database(&other);
    let script = format!(".import {}\n.exit\n", export_path.display());
    let (_code, output) = drive(db, &script);
    assert!(output.contains("failed"));
    assert!(!output.contains("0 failed"));
}
