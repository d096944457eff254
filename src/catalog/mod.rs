//! Persisted schema metadata for tables and indexes.
//!
//! The whole catalog lives in one catalog page (pointed at by the meta
//! page). Its serialization is a line-oriented text format, one record per
//! line, chosen so a hexdump of the page is readable:
//!
//! ```text
//! #TABLE <name> <first_page_id> <owner> <col>:<TYPE>:<len>:<flags>[:<hex default>] ...
//! #INDEX <name> <table> <type> <root_page_id> <col> ...
//! ```

pub mod schema;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use log::info;

use crate::error::{ErrorKind, SmallError};
use crate::index::BPlusTree;
use crate::storage::engine::StorageEngine;
use crate::storage::page_format;
use crate::types::{PageId, SmallResult, INVALID_PAGE_ID};

pub use schema::{Column, ColumnType, IndexSchema, TableSchema};

struct CatalogState {
    tables: HashMap<String, TableSchema>,
    indexes: HashMap<String, IndexSchema>,
}

/// The schema registry. All operations take the single internal lock once
/// at the public entry point; nothing below re-enters it, so the lock
/// never needs to be re-entrant.
pub struct Catalog {
    engine: Arc<StorageEngine>,
    state: Mutex<CatalogState>,
}

impl Catalog {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(CatalogState {
                tables: HashMap::new(),
                indexes: HashMap::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // tables
    // ------------------------------------------------------------------

    /// Register a table: allocate the head page of its heap, remember the
    /// schema and persist the catalog.
    pub fn create_table(
        &self,
        name: &str,
        columns: Vec<Column>,
        owner: &str,
    ) -> Result<TableSchema, SmallError> {
        validate_name(name)?;
        if columns.is_empty() {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                "a table needs at least one column",
            ));
        }
        for column in &columns {
            validate_name(&column.name)?;
            if column.ctype.size() == 0 {
                return Err(SmallError::new(
                    ErrorKind::InvalidParam,
                    &format!("column {} has zero length", column.name),
                ));
            }
        }
        {
            let unique: std::collections::HashSet<&str> =
                columns.iter().map(|c| c.name.as_str()).collect();
            if unique.len() != columns.len() {
                return Err(SmallError::new(
                    ErrorKind::InvalidParam,
                    "duplicate column name",
                ));
            }
        }

        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(name) {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("table {} already exists", name),
            ));
        }

        let (first_page_id, guard) = self.engine.create_data_page()?;
        drop(guard);

        let schema = TableSchema {
            table_name: name.to_string(),
            columns,
            first_page_id,
            owner: owner.to_string(),
        };
        state.tables.insert(name.to_string(), schema.clone());
        self.save_locked(&state)?;
        info!("created table {} (heap head {})", name, first_page_id);
        Ok(schema)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> Result<TableSchema, SmallError> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| {
                SmallError::new(ErrorKind::NotFound, &format!("table {} does not exist", name))
            })
    }

    pub fn get_all_tables(&self) -> Vec<TableSchema> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .values()
            .cloned()
            .sorted_by(|a, b| a.table_name.cmp(&b.table_name))
            .collect()
    }

    pub fn get_table_columns(&self, name: &str) -> Result<Vec<Column>, SmallError> {
        Ok(self.get_table(name)?.columns)
    }

    /// Forget a table and all indexes defined on it. Returns what was
    /// removed so the caller can free the underlying pages.
    pub fn drop_table(&self, name: &str) -> Result<(TableSchema, Vec<IndexSchema>), SmallError> {
        let mut state = self.state.lock().unwrap();
        let schema = state.tables.remove(name).ok_or_else(|| {
            SmallError::new(ErrorKind::NotFound, &format!("table {} does not exist", name))
        })?;
        let dropped_indexes: Vec<IndexSchema> = {
            let names: Vec<String> = state
                .indexes
                .values()
                .filter(|i| i.table_name == name)
                .map(|i| i.index_name.clone())
                .collect();
            names
                .iter()
                .filter_map(|n| state.indexes.remove(n))
                .collect()
        };
        self.save_locked(&state)?;
        info!("dropped table {}", name);
        Ok((schema, dropped_indexes))
    }

    /// Chain-head relocation support: point the table at a new first page.
    pub fn update_table_first_page(&self, name: &str, first_page_id: PageId) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        match state.tables.get_mut(name) {
            Some(schema) => schema.first_page_id = first_page_id,
            None => {
                return Err(SmallError::new(
                    ErrorKind::NotFound,
                    &format!("table {} does not exist", name),
                ))
            }
        }
        self.save_locked(&state)
    }

    // ------------------------------------------------------------------
    // ownership
    // ------------------------------------------------------------------

    pub fn get_table_owner(&self, name: &str) -> Result<String, SmallError> {
        Ok(self.get_table(name)?.owner)
    }

    pub fn is_table_owner(&self, name: &str, user: &str) -> bool {
        match self.get_table(name) {
            Ok(schema) => schema.owner == user,
            Err(_) => false,
        }
    }

    pub fn get_tables_by_owner(&self, owner: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .values()
            .filter(|t| t.owner == owner)
            .map(|t| t.table_name.clone())
            .sorted()
            .collect()
    }

    // ------------------------------------------------------------------
    // indexes
    // ------------------------------------------------------------------

    /// Create an empty B+ tree index and record its root page.
    pub fn create_index(
        &self,
        index_name: &str,
        table_name: &str,
        columns: &[String],
        index_type: &str,
    ) -> Result<IndexSchema, SmallError> {
        validate_name(index_name)?;
        if index_type != "BPLUS" {
            return Err(SmallError::new(
                ErrorKind::Unsupported,
                &format!("index type {} (only BPLUS exists)", index_type),
            ));
        }
        if columns.len() != 1 {
            return Err(SmallError::new(
                ErrorKind::Unsupported,
                "multi-column indexes",
            ));
        }

        let mut state = self.state.lock().unwrap();
        if state.indexes.contains_key(index_name) {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("index {} already exists", index_name),
            ));
        }
        let table = state.tables.get(table_name).ok_or_else(|| {
            SmallError::new(
                ErrorKind::NotFound,
                &format!("table {} does not exist", table_name),
            )
        })?;
        for column in columns {
            if table.column_index(column).is_none() {
                return Err(SmallError::new(
                    ErrorKind::NotFound,
                    &format!("column {} does not exist in {}", column, table_name),
                ));
            }
        }

        let tree = BPlusTree::create(&self.engine)?;
        let schema = IndexSchema {
            index_name: index_name.to_string(),
            table_name: table_name.to_string(),
            columns: columns.to_vec(),
            index_type: index_type.to_string(),
            root_page_id: tree.root(),
        };
        state.indexes.insert(index_name.to_string(), schema.clone());
        self.save_locked(&state)?;
        info!("created index {} on {} (root {})", index_name, table_name, tree.root());
        Ok(schema)
    }

    pub fn get_index(&self, index_name: &str) -> Result<IndexSchema, SmallError> {
        self.state
            .lock()
            .unwrap()
            .indexes
            .get(index_name)
            .cloned()
            .ok_or_else(|| {
                SmallError::new(
                    ErrorKind::NotFound,
                    &format!("index {} does not exist", index_name),
                )
            })
    }

    pub fn get_indexes_for_table(&self, table_name: &str) -> Vec<IndexSchema> {
        let state = self.state.lock().unwrap();
        state
            .indexes
            .values()
            .filter(|i| i.table_name == table_name)
            .cloned()
            .sorted_by(|a, b| a.index_name.cmp(&b.index_name))
            .collect()
    }

    /// Find a single-column index over `column`, if any.
    pub fn get_index_on_column(&self, table_name: &str, column: &str) -> Option<IndexSchema> {
        let state = self.state.lock().unwrap();
        state
            .indexes
            .values()
            .find(|i| i.table_name == table_name && i.columns.len() == 1 && i.columns[0] == column)
            .cloned()
    }

    /// A split or collapse moved the index root; persist the new id.
    pub fn update_index_root(&self, index_name: &str, root: PageId) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        match state.indexes.get_mut(index_name) {
            Some(schema) => schema.root_page_id = root,
            None => {
                return Err(SmallError::new(
                    ErrorKind::NotFound,
                    &format!("index {} does not exist", index_name),
                ))
            }
        }
        self.save_locked(&state)
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    /// Re-serialize the in-memory maps into the catalog page. The page
    /// image goes through the WAL before it overwrites the old one, and
    /// the meta page is only rewritten when the catalog page is first
    /// allocated.
    pub fn save_to_storage(&self) -> SmallResult {
        let state = self.state.lock().unwrap();
        self.save_locked(&state)
    }

    fn save_locked(&self, state: &CatalogState) -> SmallResult {
        let root = match self.engine.get_catalog_root()? {
            INVALID_PAGE_ID => {
                let (page_id, guard) = self.engine.create_catalog_page()?;
                drop(guard);
                self.engine.set_catalog_root(page_id)?;
                page_id
            }
            root => root,
        };

        let guard = self.engine.get_catalog_page(root)?;
        {
            let mut data = guard.write();
            page_format::initialize_page(&mut data, page_format::PageType::Catalog);
            for line in self.serialize_lines(state) {
                if page_format::append_row(&mut data, line.as_bytes()).is_none() {
                    return Err(SmallError::new(
                        ErrorKind::InvalidParam,
                        "catalog page is full",
                    ));
                }
            }
        }
        drop(guard);
        self.engine.flush_page(root)
    }

    /// Rebuild the in-memory maps from the catalog page. A database
    /// without a catalog page simply has no tables yet.
    pub fn load_from_storage(&self) -> SmallResult {
        let root = self.engine.get_catalog_root()?;
        let mut state = self.state.lock().unwrap();
        state.tables.clear();
        state.indexes.clear();
        if root == INVALID_PAGE_ID {
            return Ok(());
        }

        let guard = self.engine.get_catalog_page(root)?;
        let mut parse_error: Option<SmallError> = None;
        self.engine.for_each_record(&guard, |_, bytes| {
            if parse_error.is_some() {
                return;
            }
            let line = String::from_utf8_lossy(bytes);
            match parse_line(line.trim()) {
                Ok(Some(ParsedLine::Table(schema))) => {
                    state.tables.insert(schema.table_name.clone(), schema);
                }
                Ok(Some(ParsedLine::Index(schema))) => {
                    state.indexes.insert(schema.index_name.clone(), schema);
                }
                Ok(None) => {}
                Err(e) => parse_error = Some(e),
            }
        });
        if let Some(e) = parse_error {
            return Err(e);
        }
        info!(
            "catalog loaded: {} tables, {} indexes",
            state.tables.len(),
            state.indexes.len()
        );
        Ok(())
    }

    fn serialize_lines(&self, state: &CatalogState) -> Vec<String> {
        let mut lines = Vec::new();
        for schema in state.tables.values().sorted_by_key(|t| t.table_name.clone()) {
            let mut line = format!(
                "#TABLE {} {} {}",
                schema.table_name, schema.first_page_id, schema.owner
            );
            for column in &schema.columns {
                line.push_str(&format!(
                    " {}:{}:{}:{}",
                    column.name,
                    column.ctype.type_name(),
                    column.ctype.length(),
                    column.flags()
                ));
                if let Some(default) = &column.default_value {
                    line.push_str(&format!(":{}", hex::encode(default.as_bytes())));
                }
            }
            lines.push(line);
        }
        for schema in state.indexes.values().sorted_by_key(|i| i.index_name.clone()) {
            let mut line = format!(
                "#INDEX {} {} {} {}",
                schema.index_name, schema.table_name, schema.index_type, schema.root_page_id
            );
            for column in &schema.columns {
                line.push(' ');
                line.push_str(column);
            }
            lines.push(line);
        }
        lines
    }
}

enum ParsedLine {
    Table(TableSchema),
    Index(IndexSchema),
}

fn parse_line(line: &str) -> Result<Option<ParsedLine>, SmallError> {
    if line.is_empty() {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let tag = parts.next().unwrap_or("");
    match tag {
        "#TABLE" => {
            let table_name = next_token(&mut parts, line)?;
            let first_page_id = parse_page_id(&next_token(&mut parts, line)?)?;
            let owner = next_token(&mut parts, line)?;
            let mut columns = Vec::new();
            for coldef in parts {
                columns.push(parse_column(coldef)?);
            }
            if columns.is_empty() {
                return Err(catalog_corrupt(line));
            }
            Ok(Some(ParsedLine::Table(TableSchema {
                table_name,
                columns,
                first_page_id,
                owner,
            })))
        }
        "#INDEX" => {
            let index_name = next_token(&mut parts, line)?;
            let table_name = next_token(&mut parts, line)?;
            let index_type = next_token(&mut parts, line)?;
            let root_page_id = parse_page_id(&next_token(&mut parts, line)?)?;
            let columns: Vec<String> = parts.map(|s| s.to_string()).collect();
            if columns.is_empty() {
                return Err(catalog_corrupt(line));
            }
            Ok(Some(ParsedLine::Index(IndexSchema {
                index_name,
                table_name,
                columns,
                index_type,
                root_page_id,
            })))
        }
        _ => Err(catalog_corrupt(line)),
    }
}

fn parse_column(coldef: &str) -> Result<Column, SmallError> {
    let parts: Vec<&str> = coldef.split(':').collect();
    if parts.len() != 4 && parts.len() != 5 {
        return Err(catalog_corrupt(coldef));
    }
    let length: u16 = parts[2].parse().map_err(|_| catalog_corrupt(coldef))?;
    let flags: u8 = parts[3].parse().map_err(|_| catalog_corrupt(coldef))?;
    let ctype = ColumnType::from_parts(parts[1], length)?;

    let mut column = Column::new(parts[0], ctype);
    column.set_flags(flags);
    if parts.len() == 5 {
        let bytes = hex::decode(parts[4]).map_err(|_| catalog_corrupt(coldef))?;
        let default = String::from_utf8(bytes).map_err(|_| catalog_corrupt(coldef))?;
        column.default_value = Some(default);
    }
    Ok(column)
}

fn next_token<'a, I: Iterator<Item = &'a str>>(
    parts: &mut I,
    line: &str,
) -> Result<String, SmallError> {
    parts
        .next()
        .map(|s| s.to_string())
        .ok_or_else(|| catalog_corrupt(line))
}

fn parse_page_id(token: &str) -> Result<PageId, SmallError> {
    token
        .parse::<PageId>()
        .map_err(|_| catalog_corrupt(token))
}

fn catalog_corrupt(context: &str) -> SmallError {
    SmallError::new(
        ErrorKind::InvalidParam,
        &format!("catalog entry is not parseable: {}", context),
    )
}

fn validate_name(name: &str) -> SmallResult {
    if name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c == ':' || c == '#')
    {
        return Err(SmallError::new(
            ErrorKind::InvalidParam,
            &format!("name {:?} is not usable in the catalog", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_line() {
        let line = "#TABLE students 3 root id:INT:0:5 name:VARCHAR:50:0 age:INT:0:0";
        match parse_line(line).unwrap().unwrap() {
            ParsedLine::Table(schema) => {
                assert_eq!(schema.table_name, "students");
                assert_eq!(schema.first_page_id, 3);
                assert_eq!(schema.owner, "root");
                assert_eq!(schema.columns.len(), 3);
                assert!(schema.columns[0].primary_key);
                assert!(schema.columns[0].not_null);
                assert_eq!(schema.columns[1].ctype, ColumnType::Varchar(50));
            }
            _ => panic!("expected a table line"),
        }
    }

    #[test]
    fn test_parse_index_line() {
        let line = "#INDEX idx_age students BPLUS 7 age";
        match parse_line(line).unwrap().unwrap() {
            ParsedLine::Index(schema) => {
                assert_eq!(schema.index_name, "idx_age");
                assert_eq!(schema.root_page_id, 7);
                assert_eq!(schema.columns, vec!["age".to_string()]);
            }
            _ => panic!("expected an index line"),
        }
    }

    #[test]
    fn test_parse_column_with_default() {
        let coldef = format!("age:INT:0:4:{}", hex::encode("18"));
        let column = parse_column(&coldef).unwrap();
        assert!(column.not_null);
        assert_eq!(column.default_value.as_deref(), Some("18"));
    }

    #[test]
    fn test_garbage_line_rejected() {
        assert!(parse_line("#WHAT is this").is_err());
        assert!(parse_line("#TABLE lonely").is_err());
    }
}
