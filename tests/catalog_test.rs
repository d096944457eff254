mod test_utils;

use std::sync::Arc;

use small_base::{Catalog, Column, ColumnType, ErrorKind};
use test_utils::{new_temp_dir, open_engine, quiet_config, setup};

fn student_columns() -> Vec<Column> {
    vec![
        Column::new("id", ColumnType::Int).primary_key().not_null(),
        Column::new("name", ColumnType::Varchar(50)),
        Column::new("age", ColumnType::Int).with_default("18"),
    ]
}

#[test]
fn test_create_and_get_table() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());
    let catalog = Catalog::new(Arc::clone(&engine));

    let schema = catalog
        .create_table("students", student_columns(), "root")
        .unwrap();
    assert!(catalog.has_table("students"));
    assert_ne!(schema.first_page_id, small_base::INVALID_PAGE_ID);

    let fetched = catalog.get_table("students").unwrap();
    assert_eq!(fetched, schema);
    assert_eq!(fetched.columns[2].default_value.as_deref(), Some("18"));

    assert_eq!(
        catalog.get_table("nobody").unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[test]
fn test_duplicate_table_rejected() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());
    let catalog = Catalog::new(Arc::clone(&engine));

    catalog
        .create_table("students", student_columns(), "root")
        .unwrap();
    let e = catalog
        .create_table("students", student_columns(), "root")
        .unwrap_err();
    assert_eq!(e.kind, ErrorKind::InvalidParam);
}

/// The whole catalog must survive a close/reopen cycle through its
/// serialized form in the catalog page.
#[test]
fn test_catalog_survives_reopen() {
    setup();
    let dir = new_temp_dir();

    let students;
    let index;
    {
        let engine = open_engine(&dir, &quiet_config());
        let catalog = Catalog::new(Arc::clone(&engine));
        students = catalog
            .create_table("students", student_columns(), "alice")
            .unwrap();
        catalog
            .create_table(
                "courses",
                vec![Column::new("id", ColumnType::BigInt)],
                "bob",
            )
            .unwrap();
        index = catalog
            .create_index("idx_age", "students", &["age".to_string()], "BPLUS")
            .unwrap();
        engine.shutdown();
    }

    let engine = open_engine(&dir, &quiet_config());
    let catalog = Catalog::new(Arc::clone(&engine));
    catalog.load_from_storage().unwrap();

    assert_eq!(catalog.get_table("students").unwrap(), students);
    assert_eq!(catalog.get_all_tables().len(), 2);
    assert_eq!(catalog.get_index("idx_age").unwrap(), index);
    assert_eq!(catalog.get_table_owner("courses").unwrap(), "bob");
}

#[test]
fn test_ownership_queries() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());
    let catalog = Catalog::new(Arc::clone(&engine));

    catalog
        .create_table("a", vec![Column::new("x", ColumnType::Int)], "alice")
        .unwrap();
    catalog
        .create_table("b", vec![Column::new("x", ColumnType::Int)], "alice")
        .unwrap();
    catalog
        .create_table("c", vec![Column::new("x", ColumnType::Int)], "bob")
        .unwrap();

    assert!(catalog.is_table_owner("a", "alice"));
    assert!(!catalog.is_table_owner("a", "bob"));
    assert_eq!(catalog.get_tables_by_owner("alice"), vec!["a", "b"]);
    assert!(catalog.get_tables_by_owner("nobody").is_empty());
}

#[test]
fn test_index_requires_existing_table_and_column() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());
    let catalog = Catalog::new(Arc::clone(&engine));

    catalog
        .create_table("t", vec![Column::new("x", ColumnType::Int)], "root")
        .unwrap();

    assert_eq!(
        catalog
            .create_index("i", "missing", &["x".to_string()], "BPLUS")
            .unwrap_err()
            .kind,
        ErrorKind::NotFound
    );
    assert_eq!(
        catalog
            .create_index("i", "t", &["y".to_string()], "BPLUS")
            .unwrap_err()
            .kind,
        ErrorKind::NotFound
    );
    assert_eq!(
        catalog
            .create_index("i", "t", &["x".to_string()], "HASH")
            .unwrap_err()
            .kind,
        ErrorKind::Unsupported
    );

    catalog
        .create_index("i", "t", &["x".to_string()], "BPLUS")
        .unwrap();
    assert_eq!(
        catalog
            .create_index("i", "t", &["x".to_string()], "BPLUS")
            .unwrap_err()
            .kind,
        ErrorKind::InvalidParam
    );
    assert_eq!(catalog.get_indexes_for_table("t").len(), 1);
    assert!(catalog.get_index_on_column("t", "x").is_some());
    assert!(catalog.get_index_on_column("t", "y").is_none());
}

#[test]
fn test_update_first_page_and_index_root() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());
    let catalog = Catalog::new(Arc::clone(&engine));

    catalog
        .create_table("t", vec![Column::new("x", ColumnType::Int)], "root")
        .unwrap();
    catalog
        .create_index("i", "t", &["x".to_string()], "BPLUS")
        .unwrap();

    catalog.update_table_first_page("t", 42).unwrap();
    assert_eq!(catalog.get_table("t").unwrap().first_page_id, 42);

    catalog.update_index_root("i", 43).unwrap();
    assert_eq!(catalog.get_index("i").unwrap().root_page_id, 43);

    // both survive a reload from the page
    catalog.load_from_storage().unwrap();
    assert_eq!(catalog.get_table("t").unwrap().first_page_id, 42);
    assert_eq!(catalog.get_index("i").unwrap().root_page_id, 43);
}

#[test]
fn test_drop_table_removes_indexes() {
    setup();
    let dir = new_temp_dir();
    let engine = open_engine(&dir, &quiet_config());
    let catalog = Catalog::new(Arc::clone(&engine));

    catalog
        .create_table("t", vec![Column::new("x", ColumnType::Int)], "root")
        .unwrap();
    catalog
        .create_index("i", "t", &["x".to_string()], "BPLUS")
        .unwrap();

    let (schema, indexes) = catalog.drop_table("t").unwrap();
    assert_eq!(schema.table_name, "t");
    assert_eq!(indexes.len(), 1);
    assert!(!catalog.has_table("t"));
    assert!(catalog.get_index("i").is_err());
}
