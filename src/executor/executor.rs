use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::catalog::schema::{Column, ColumnType, IndexSchema, TableSchema};
use crate::catalog::Catalog;
use crate::error::{ErrorKind, SmallError};
use crate::executor::plan::PlanNode;
use crate::executor::predicate::{Op, Predicate};
use crate::executor::row::{self, Row};
use crate::index::BPlusTree;
use crate::storage::engine::StorageEngine;
use crate::storage::page_format;
use crate::types::{PageId, Rid, SmallResult, INVALID_PAGE_ID};

/// What a statement is about to do, for the authorization hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    CreateIndex,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Operation::Select => "SELECT",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::CreateTable => "CREATE TABLE",
            Operation::DropTable => "DROP TABLE",
            Operation::CreateIndex => "CREATE INDEX",
        };
        write!(f, "{}", name)
    }
}

/// Authorization seam. Access control itself lives outside the storage
/// core; the executor only asks for a yes/no per `(user, operation,
/// table)` and treats the answer as opaque.
pub trait PermissionChecker: Send + Sync {
    fn check(&self, user: &str, operation: Operation, table: &str) -> bool;
}

/// The default checker admits everything.
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn check(&self, _user: &str, _operation: Operation, _table: &str) -> bool {
        true
    }
}

/// What a statement produces: a row set for queries, a one-line summary
/// for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Rows { columns: Vec<String>, rows: Vec<Row> },
    Summary(String),
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        match self {
            QueryResult::Rows { rows, .. } => rows.len(),
            QueryResult::Summary(_) => 0,
        }
    }
}

/// Walks plan trees against the catalog and the storage engine.
///
/// Queries run concurrently; mutation statements serialize on an
/// internal lock so heap growth and index maintenance never interleave
/// between statements. Within a statement, row writes are atomic at page
/// level through the page's writer lock.
pub struct Executor {
    engine: Arc<StorageEngine>,
    catalog: Arc<Catalog>,
    checker: Box<dyn PermissionChecker>,
    mutation_lock: std::sync::Mutex<()>,
}

/// A query plan flattened into its three ingredients.
struct QueryParts {
    table: String,
    predicate: Predicate,
    projection: Option<Vec<String>>,
}

/// An index attached for the duration of one statement. The root may move
/// while the statement runs; it is written back to the catalog once at
/// the end.
struct OpenIndex {
    schema: IndexSchema,
    tree: BPlusTree,
    column: Column,
}

impl Executor {
    pub fn new(engine: Arc<StorageEngine>, catalog: Arc<Catalog>) -> Self {
        Self::with_permission_checker(engine, catalog, Box::new(AllowAll))
    }

    pub fn with_permission_checker(
        engine: Arc<StorageEngine>,
        catalog: Arc<Catalog>,
        checker: Box<dyn PermissionChecker>,
    ) -> Self {
        Self {
            engine,
            catalog,
            checker,
            mutation_lock: std::sync::Mutex::new(()),
        }
    }

    /// Execute one plan on behalf of `user`.
    pub fn execute(&self, plan: &PlanNode, user: &str) -> Result<QueryResult, SmallError> {
        self.check_permission(plan, user)?;

        let _mutation = match plan {
            PlanNode::SeqScan { .. }
            | PlanNode::Filter { .. }
            | PlanNode::Project { .. }
            | PlanNode::ShowTables => None,
            _ => Some(self.mutation_lock.lock().unwrap()),
        };

        match plan {
            PlanNode::CreateTable { name, columns } => self.create_table(name, columns, user),
            PlanNode::DropTable { name } => self.drop_table(name),
            PlanNode::CreateIndex {
                name,
                table,
                columns,
            } => self.create_index(name, table, columns),
            PlanNode::ShowTables => self.show_tables(),
            PlanNode::Insert {
                table,
                columns,
                rows,
            } => self.insert(table, columns.as_deref(), rows),
            PlanNode::Update {
                table,
                assignments,
                predicate,
            } => self.update(table, assignments, predicate),
            PlanNode::Delete { table, predicate } => self.delete(table, predicate),
            PlanNode::SeqScan { .. } | PlanNode::Filter { .. } | PlanNode::Project { .. } => {
                self.run_query(plan)
            }
        }
    }

    fn check_permission(&self, plan: &PlanNode, user: &str) -> SmallResult {
        let operation = match plan {
            PlanNode::CreateTable { .. } => Operation::CreateTable,
            PlanNode::DropTable { .. } => Operation::DropTable,
            PlanNode::CreateIndex { .. } => Operation::CreateIndex,
            PlanNode::Insert { .. } => Operation::Insert,
            PlanNode::Update { .. } => Operation::Update,
            PlanNode::Delete { .. } => Operation::Delete,
            PlanNode::SeqScan { .. } | PlanNode::Filter { .. } | PlanNode::Project { .. } => {
                Operation::Select
            }
            // listing table names is not gated
            PlanNode::ShowTables => return Ok(()),
        };
        let table = plan.table_name().unwrap_or("");
        if !self.checker.check(user, operation, table) {
            return Err(SmallError::new(
                ErrorKind::PermissionDenied,
                &format!("user {} may not {} on {}", user, operation, table),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn create_table(
        &self,
        name: &str,
        columns: &[Column],
        owner: &str,
    ) -> Result<QueryResult, SmallError> {
        // a row must fit one page together with its slot entry
        let row_size: usize = columns.iter().map(|c| c.ctype.size()).sum();
        let payload = crate::config::PAGE_SIZE - page_format::PAGE_HEADER_SIZE;
        if row_size + page_format::SLOT_SIZE > payload {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("rows of {} bytes do not fit a page", row_size),
            ));
        }

        self.catalog.create_table(name, columns.to_vec(), owner)?;
        Ok(QueryResult::Summary(format!("table {} created", name)))
    }

    fn drop_table(&self, name: &str) -> Result<QueryResult, SmallError> {
        let (schema, indexes) = self.catalog.drop_table(name)?;

        // free the heap chain
        let mut chain = Vec::new();
        let mut page_id = schema.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let guard = self.engine.get_data_page(page_id)?;
            let next = page_format::next_page_id(&guard.read());
            drop(guard);
            chain.push(page_id);
            page_id = next;
        }
        for page_id in chain {
            self.engine.remove_page(page_id)?;
        }

        // free every index node
        for index in indexes {
            let tree = BPlusTree::attach(&self.engine, index.root_page_id);
            for page_id in tree.collect_pages()? {
                self.engine.remove_page(page_id)?;
            }
        }

        Ok(QueryResult::Summary(format!("table {} dropped", name)))
    }

    fn create_index(
        &self,
        name: &str,
        table: &str,
        columns: &[String],
    ) -> Result<QueryResult, SmallError> {
        let index = self.catalog.create_index(name, table, columns, "BPLUS")?;
        let schema = self.catalog.get_table(table)?;
        let column = schema
            .column(&index.columns[0])
            .cloned()
            .expect("column validated by the catalog");

        // populate from the existing rows
        let mut tree = BPlusTree::attach(&self.engine, index.root_page_id);
        let mut count = 0usize;
        for item in HeapScan::new(Arc::clone(&self.engine), schema.clone()) {
            let (rid, row) = item?;
            let key = index_key_for(&column, row.get(&column.name).unwrap_or(""))?;
            tree.insert_duplicate(key, rid)?;
            count += 1;
        }
        if tree.root() != index.root_page_id {
            self.catalog.update_index_root(name, tree.root())?;
        }

        Ok(QueryResult::Summary(format!(
            "index {} created on {} ({} entries)",
            name, table, count
        )))
    }

    fn show_tables(&self) -> Result<QueryResult, SmallError> {
        let rows = self
            .catalog
            .get_all_tables()
            .into_iter()
            .map(|t| {
                Row::new(vec![
                    ("table".to_string(), t.table_name),
                    ("owner".to_string(), t.owner),
                ])
            })
            .collect();
        Ok(QueryResult::Rows {
            columns: vec!["table".to_string(), "owner".to_string()],
            rows,
        })
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    fn run_query(&self, plan: &PlanNode) -> Result<QueryResult, SmallError> {
        let parts = flatten_query(plan)?;
        let schema = self.catalog.get_table(&parts.table)?;

        // unknown predicate columns fail even when no row would be read
        for term in &parts.predicate.terms {
            if schema.column(&term.column).is_none() {
                return Err(SmallError::new(
                    ErrorKind::Expression,
                    &format!("unknown column {} in predicate", term.column),
                ));
            }
        }

        let projection = match &parts.projection {
            None => schema.column_names(),
            Some(columns) if columns.len() == 1 && columns[0] == "*" => schema.column_names(),
            Some(columns) => {
                for column in columns {
                    if schema.column(column).is_none() {
                        return Err(SmallError::new(
                            ErrorKind::Semantic,
                            &format!("unknown column {} in projection", column),
                        ));
                    }
                }
                columns.clone()
            }
        };

        // serve the filter from an index when one covers it; rows then
        // come back in ascending key order
        let matched = match self.try_index_scan(&schema, &parts.predicate)? {
            Some(rows) => rows,
            None => {
                let mut rows = Vec::new();
                for item in HeapScan::new(Arc::clone(&self.engine), schema.clone()) {
                    let (rid, row) = item?;
                    if parts.predicate.matches(&row, &schema)? {
                        rows.push((rid, row));
                    }
                }
                rows
            }
        };

        let rows = matched
            .into_iter()
            .map(|(_, full)| project_row(&full, &projection))
            .collect();
        Ok(QueryResult::Rows {
            columns: projection,
            rows,
        })
    }

    /// Use a single-column B+ tree to answer an indexable conjunction.
    /// Only integer-typed columns qualify: their keys order the same way
    /// the values do. The full predicate is re-checked on every fetched
    /// row, which also screens out any hash-collision noise.
    fn try_index_scan(
        &self,
        schema: &TableSchema,
        predicate: &Predicate,
    ) -> Result<Option<Vec<(Rid, Row)>>, SmallError> {
        if predicate.is_empty() {
            return Ok(None);
        }

        for term in &predicate.terms {
            let column = match schema.column(&term.column) {
                Some(c) => c,
                None => continue,
            };
            if !matches!(column.ctype, ColumnType::Int | ColumnType::BigInt) {
                continue;
            }
            let index = match self.catalog.get_index_on_column(&schema.table_name, &column.name) {
                Some(i) => i,
                None => continue,
            };

            let bounds = key_bounds(predicate, &column.name);
            let (low, high) = match bounds {
                Some(b) => b,
                None => continue,
            };
            if low > high {
                return Ok(Some(Vec::new()));
            }

            debug!(
                "filter on {}.{} served by index {} over [{}, {}]",
                schema.table_name, column.name, index.index_name, low, high
            );
            let tree = BPlusTree::attach(&self.engine, index.root_page_id);
            let mut rows = Vec::new();
            for rid in tree.range(low, high)? {
                match self.fetch_row(schema, rid)? {
                    Some(row) => {
                        if predicate.matches(&row, schema)? {
                            rows.push((rid, row));
                        }
                    }
                    None => warn!(
                        "index {} points at missing record {}",
                        index.index_name, rid
                    ),
                }
            }
            return Ok(Some(rows));
        }
        Ok(None)
    }

    fn fetch_row(&self, schema: &TableSchema, rid: Rid) -> Result<Option<Row>, SmallError> {
        let guard = self.engine.get_data_page(rid.page_id)?;
        let record = self.engine.get_record(&guard, rid.slot);
        match record {
            Some(bytes) => Ok(Some(row::decode_row(schema, &bytes)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // INSERT
    // ------------------------------------------------------------------

    fn insert(
        &self,
        table: &str,
        columns: Option<&[String]>,
        value_rows: &[Vec<String>],
    ) -> Result<QueryResult, SmallError> {
        let schema = self.catalog.get_table(table)?;

        let target_columns: Vec<String> = match columns {
            Some(names) => {
                for name in names {
                    if schema.column(name).is_none() {
                        return Err(SmallError::new(
                            ErrorKind::Semantic,
                            &format!("unknown column {} in insert", name),
                        ));
                    }
                }
                names.to_vec()
            }
            None => schema.column_names(),
        };

        let mut indexes = self.open_indexes(&schema)?;
        let mut inserted = 0usize;

        for values in value_rows {
            if values.len() != target_columns.len() {
                return Err(SmallError::new(
                    ErrorKind::Semantic,
                    &format!(
                        "insert provides {} values for {} columns",
                        values.len(),
                        target_columns.len()
                    ),
                ));
            }

            let full_row = self.complete_row(&schema, &target_columns, values)?;
            // encoding validates every value before anything is written
            let bytes = row::encode_row(&schema, &full_row)?;

            // keys are computed up front so a bad key aborts the row
            // before the heap is touched
            let mut keys = Vec::with_capacity(indexes.len());
            for open in indexes.iter() {
                let text = full_row.get(&open.column.name).unwrap_or("");
                keys.push(index_key_for(&open.column, text)?);
            }

            for column in schema.columns.iter().filter(|c| c.requires_unique()) {
                let value = full_row.get(&column.name).unwrap_or("");
                self.check_unique(&schema, column, value, &indexes)?;
            }

            let rid = self.append_to_heap(&schema, &bytes)?;
            for (open, key) in indexes.iter_mut().zip(keys) {
                open.tree.insert_duplicate(key, rid)?;
            }
            inserted += 1;
        }

        self.close_indexes(indexes)?;
        Ok(QueryResult::Summary(format!(
            "{} row{} inserted into {}",
            inserted,
            if inserted == 1 { "" } else { "s" },
            table
        )))
    }

    /// Build the full row for an insert: listed columns take the provided
    /// values, the rest fall back to their default, and a NOT NULL column
    /// without either is a constraint violation.
    fn complete_row(
        &self,
        schema: &TableSchema,
        target_columns: &[String],
        values: &[String],
    ) -> Result<Row, SmallError> {
        let mut row_values = Vec::with_capacity(schema.columns.len());
        for column in &schema.columns {
            let provided = target_columns
                .iter()
                .position(|c| c == &column.name)
                .map(|i| values[i].clone());
            let value = match provided {
                Some(v) => v,
                None => match &column.default_value {
                    Some(default) => default.clone(),
                    None => {
                        if column.not_null {
                            return Err(SmallError::new(
                                ErrorKind::ConstraintViolation,
                                &format!("column {} is NOT NULL and has no default", column.name),
                            ));
                        }
                        zero_value(column.ctype)
                    }
                },
            };
            row_values.push((column.name.clone(), value));
        }
        Ok(Row::new(row_values))
    }

    /// Enforce PRIMARY KEY / UNIQUE: probe the column's index when it has
    /// one, scan the heap otherwise.
    fn check_unique(
        &self,
        schema: &TableSchema,
        column: &Column,
        value: &str,
        indexes: &[OpenIndex],
    ) -> SmallResult {
        let canonical = row::canonical_value(&column.name, column.ctype, value)?;
        let violation = || {
            SmallError::new(
                ErrorKind::ConstraintViolation,
                &format!(
                    "duplicate value {} for {} column {}.{}",
                    canonical,
                    if column.primary_key {
                        "primary key"
                    } else {
                        "unique"
                    },
                    schema.table_name,
                    column.name
                ),
            )
        };

        if let Some(open) = indexes.iter().find(|o| o.column.name == column.name) {
            let key = index_key_for(column, value)?;
            for rid in open.tree.range(key, key)? {
                if let Some(row) = self.fetch_row(schema, rid)? {
                    if row.get(&column.name) == Some(canonical.as_str()) {
                        return Err(violation());
                    }
                }
            }
            return Ok(());
        }

        for item in HeapScan::new(Arc::clone(&self.engine), schema.clone()) {
            let (_, row) = item?;
            if row.get(&column.name) == Some(canonical.as_str()) {
                return Err(violation());
            }
        }
        Ok(())
    }

    /// Append a record to the tail of the table's page chain, growing the
    /// chain by one page when the tail is full. The append itself is
    /// atomic at page level: either the record and its slot land on a
    /// page, or the page is untouched.
    fn append_to_heap(&self, schema: &TableSchema, bytes: &[u8]) -> Result<Rid, SmallError> {
        let mut page_id = schema.first_page_id;
        loop {
            let guard = self.engine.get_data_page(page_id)?;
            if let Some(slot) = self.engine.append_record(&guard, bytes) {
                return Ok(Rid::new(page_id, slot));
            }
            let next = page_format::next_page_id(&guard.read());
            drop(guard);

            if next != INVALID_PAGE_ID {
                page_id = next;
                continue;
            }
            let (new_page_id, new_guard) = self.engine.create_data_page()?;
            drop(new_guard);
            self.engine.link_pages(page_id, new_page_id)?;
            debug!(
                "table {} grew: page {} -> {}",
                schema.table_name, page_id, new_page_id
            );
            page_id = new_page_id;
        }
    }

    // ------------------------------------------------------------------
    // UPDATE / DELETE
    // ------------------------------------------------------------------

    fn update(
        &self,
        table: &str,
        assignments: &[(String, String)],
        predicate: &Predicate,
    ) -> Result<QueryResult, SmallError> {
        let schema = self.catalog.get_table(table)?;
        for (column, _) in assignments {
            if schema.column(column).is_none() {
                return Err(SmallError::new(
                    ErrorKind::Semantic,
                    &format!("unknown column {} in update", column),
                ));
            }
        }

        let matched = self.collect_matches(&schema, predicate)?;
        let mut indexes = self.open_indexes(&schema)?;
        let mut updated = 0usize;

        for (rid, old_row) in matched {
            let mut new_row = old_row.clone();
            for (column, value) in assignments {
                new_row.set(column, value);
            }
            let new_bytes = row::encode_row(&schema, &new_row)?;

            // the codec is fixed-width, so the in-place path is the
            // normal one; the relocation path stays for records written
            // by older layouts
            let guard = self.engine.get_data_page(rid.page_id)?;
            let new_rid = match self.engine.update_record(&guard, rid.slot, &new_bytes) {
                Ok(()) => {
                    drop(guard);
                    rid
                }
                Err(_) => {
                    self.engine.delete_record(&guard, rid.slot)?;
                    drop(guard);
                    self.append_to_heap(&schema, &new_bytes)?
                }
            };

            for open in indexes.iter_mut() {
                let old_text = old_row.get(&open.column.name).unwrap_or("");
                let new_text = new_row.get(&open.column.name).unwrap_or("");
                if old_text == new_text && new_rid == rid {
                    continue;
                }
                let old_key = index_key_for(&open.column, old_text)?;
                let new_key = index_key_for(&open.column, new_text)?;
                if let Err(e) = open.tree.delete_exact(old_key, rid) {
                    warn!(
                        "index {} had no entry for {}: {}",
                        open.schema.index_name, rid, e
                    );
                }
                open.tree.insert_duplicate(new_key, new_rid)?;
            }
            updated += 1;
        }

        self.close_indexes(indexes)?;
        Ok(QueryResult::Summary(format!(
            "{} row{} updated in {}",
            updated,
            if updated == 1 { "" } else { "s" },
            table
        )))
    }

    fn delete(&self, table: &str, predicate: &Predicate) -> Result<QueryResult, SmallError> {
        let schema = self.catalog.get_table(table)?;
        let matched = self.collect_matches(&schema, predicate)?;
        let mut indexes = self.open_indexes(&schema)?;
        let mut deleted = 0usize;

        for (rid, old_row) in matched {
            let guard = self.engine.get_data_page(rid.page_id)?;
            self.engine.delete_record(&guard, rid.slot)?;
            drop(guard);

            for open in indexes.iter_mut() {
                let text = old_row.get(&open.column.name).unwrap_or("");
                let key = index_key_for(&open.column, text)?;
                if let Err(e) = open.tree.delete_exact(key, rid) {
                    warn!(
                        "index {} had no entry for {}: {}",
                        open.schema.index_name, rid, e
                    );
                }
            }
            deleted += 1;
        }

        self.close_indexes(indexes)?;
        Ok(QueryResult::Summary(format!(
            "{} row{} deleted from {}",
            deleted,
            if deleted == 1 { "" } else { "s" },
            table
        )))
    }

    fn collect_matches(
        &self,
        schema: &TableSchema,
        predicate: &Predicate,
    ) -> Result<Vec<(Rid, Row)>, SmallError> {
        for term in &predicate.terms {
            if schema.column(&term.column).is_none() {
                return Err(SmallError::new(
                    ErrorKind::Expression,
                    &format!("unknown column {} in predicate", term.column),
                ));
            }
        }
        let mut matched = Vec::new();
        for item in HeapScan::new(Arc::clone(&self.engine), schema.clone()) {
            let (rid, row) = item?;
            if predicate.matches(&row, schema)? {
                matched.push((rid, row));
            }
        }
        Ok(matched)
    }

    // ------------------------------------------------------------------
    // index plumbing
    // ------------------------------------------------------------------

    fn open_indexes(&self, schema: &TableSchema) -> Result<Vec<OpenIndex>, SmallError> {
        self.catalog
            .get_indexes_for_table(&schema.table_name)
            .into_iter()
            .map(|index| {
                let column = schema.column(&index.columns[0]).cloned().ok_or_else(|| {
                    SmallError::new(
                        ErrorKind::InvalidParam,
                        &format!(
                            "index {} names a column {} that is gone",
                            index.index_name, index.columns[0]
                        ),
                    )
                })?;
                let tree = BPlusTree::attach(&self.engine, index.root_page_id);
                Ok(OpenIndex {
                    schema: index,
                    tree,
                    column,
                })
            })
            .collect()
    }

    /// Persist any root movements that happened during the statement.
    fn close_indexes(&self, indexes: Vec<OpenIndex>) -> SmallResult {
        for open in indexes {
            if open.tree.root() != open.schema.root_page_id {
                self.catalog
                    .update_index_root(&open.schema.index_name, open.tree.root())?;
            }
        }
        Ok(())
    }
}

/// Map a column value onto the 32-bit index key space. Integer columns
/// cast (with a range check); strings and doubles hash.
fn index_key_for(column: &Column, text: &str) -> Result<i32, SmallError> {
    use crate::index::IndexKey;
    match column.ctype {
        ColumnType::Int => {
            let v: i32 = text.trim().parse().map_err(|_| {
                SmallError::new(
                    ErrorKind::Semantic,
                    &format!("value {:?} does not fit column {}", text, column.name),
                )
            })?;
            v.to_index_key()
        }
        ColumnType::BigInt => {
            let v: i64 = text.trim().parse().map_err(|_| {
                SmallError::new(
                    ErrorKind::Semantic,
                    &format!("value {:?} does not fit column {}", text, column.name),
                )
            })?;
            v.to_index_key()
        }
        ColumnType::Double => {
            let v: f64 = text.trim().parse().map_err(|_| {
                SmallError::new(
                    ErrorKind::Semantic,
                    &format!("value {:?} does not fit column {}", text, column.name),
                )
            })?;
            v.to_index_key()
        }
        ColumnType::Varchar(_) | ColumnType::Char(_) => text.to_index_key(),
    }
}

fn zero_value(ctype: ColumnType) -> String {
    match ctype {
        ColumnType::Int | ColumnType::BigInt => "0".to_string(),
        ColumnType::Double => "0.0".to_string(),
        ColumnType::Varchar(_) | ColumnType::Char(_) => String::new(),
    }
}

fn project_row(row: &Row, columns: &[String]) -> Row {
    Row::new(
        columns
            .iter()
            .map(|c| (c.clone(), row.get(c).unwrap_or("").to_string()))
            .collect(),
    )
}

/// Collapse a `Project(Filter(SeqScan))`-shaped tree into its parts.
/// Nested filters AND together; the outermost projection wins.
fn flatten_query(plan: &PlanNode) -> Result<QueryParts, SmallError> {
    match plan {
        PlanNode::SeqScan { table } => Ok(QueryParts {
            table: table.clone(),
            predicate: Predicate::always_true(),
            projection: None,
        }),
        PlanNode::Filter { child, predicate } => {
            let mut parts = flatten_query(child)?;
            parts.predicate.terms.extend(predicate.terms.clone());
            Ok(parts)
        }
        PlanNode::Project { child, columns } => {
            let mut parts = flatten_query(child)?;
            if parts.projection.is_none() {
                parts.projection = Some(columns.clone());
            }
            Ok(parts)
        }
        other => Err(SmallError::new(
            ErrorKind::InvalidParam,
            &format!("plan node {:?} is not a query", other),
        )),
    }
}

/// Derive the closed key interval an indexable conjunction pins a column
/// into. `None` when no term bounds the column or a literal does not
/// parse.
fn key_bounds(predicate: &Predicate, column: &str) -> Option<(i32, i32)> {
    let mut low = i64::from(i32::MIN);
    let mut high = i64::from(i32::MAX);
    let mut bounded = false;

    for term in predicate.terms.iter().filter(|t| t.column == column) {
        let value: i64 = term.value.trim().parse().ok()?;
        match term.op {
            Op::Equals => {
                low = low.max(value);
                high = high.min(value);
                bounded = true;
            }
            Op::GreaterThan => {
                low = low.max(value.saturating_add(1));
                bounded = true;
            }
            Op::GreaterThanOrEq => {
                low = low.max(value);
                bounded = true;
            }
            Op::LessThan => {
                high = high.min(value.saturating_sub(1));
                bounded = true;
            }
            Op::LessThanOrEq => {
                high = high.min(value);
                bounded = true;
            }
            // a != term alone cannot drive a range scan
            Op::NotEquals => {}
        }
    }
    if !bounded {
        return None;
    }
    // a bound outside the 32-bit key space means an empty interval, not a
    // truncated one
    if low > i64::from(i32::MAX) || high < i64::from(i32::MIN) || low > high {
        return Some((1, 0));
    }
    Some((low as i32, high as i32))
}

/// Page-at-a-time scan over a table's heap chain. Each step pins one
/// page, decodes its live records and unpins before moving on, so the
/// scan never holds more than one page resident.
pub struct HeapScan {
    engine: Arc<StorageEngine>,
    schema: TableSchema,
    next_page: PageId,
    buffer: VecDeque<(Rid, Row)>,
    failed: bool,
}

impl HeapScan {
    pub fn new(engine: Arc<StorageEngine>, schema: TableSchema) -> Self {
        let next_page = schema.first_page_id;
        Self {
            engine,
            schema,
            next_page,
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    fn load_next_page(&mut self) -> Result<bool, SmallError> {
        if self.next_page == INVALID_PAGE_ID {
            return Ok(false);
        }
        let guard = self.engine.get_data_page(self.next_page)?;
        let page_id = self.next_page;

        let mut decode_error = None;
        {
            let data = guard.read();
            self.next_page = page_format::next_page_id(&data);
            page_format::for_each_row(&data, |slot, bytes| {
                if decode_error.is_some() {
                    return;
                }
                match row::decode_row(&self.schema, bytes) {
                    Ok(row) => self.buffer.push_back((Rid::new(page_id, slot), row)),
                    Err(e) => decode_error = Some(e),
                }
            });
        }
        match decode_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}

impl Iterator for HeapScan {
    type Item = Result<(Rid, Row), SmallError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            match self.load_next_page() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
