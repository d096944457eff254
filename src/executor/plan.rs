use crate::catalog::schema::Column;
use crate::executor::predicate::Predicate;

/// The plan tree handed to the executor. The front-end builds these;
/// anything its SQL subset cannot express never reaches this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    CreateTable {
        name: String,
        columns: Vec<Column>,
    },
    DropTable {
        name: String,
    },
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
    },
    ShowTables,
    Insert {
        table: String,
        /// Explicit column list; `None` means all columns in schema order.
        columns: Option<Vec<String>>,
        /// Row literals, one inner vector per row.
        rows: Vec<Vec<String>>,
    },
    SeqScan {
        table: String,
    },
    Filter {
        child: Box<PlanNode>,
        predicate: Predicate,
    },
    Project {
        child: Box<PlanNode>,
        /// `["*"]` keeps the child's full column set.
        columns: Vec<String>,
    },
    Update {
        table: String,
        assignments: Vec<(String, String)>,
        predicate: Predicate,
    },
    Delete {
        table: String,
        predicate: Predicate,
    },
}

impl PlanNode {
    /// The table this plan (or its scan leaf) names, if any.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            PlanNode::CreateTable { name, .. } => Some(name),
            PlanNode::DropTable { name } => Some(name),
            PlanNode::CreateIndex { table, .. } => Some(table),
            PlanNode::ShowTables => None,
            PlanNode::Insert { table, .. } => Some(table),
            PlanNode::SeqScan { table } => Some(table),
            PlanNode::Filter { child, .. } => child.table_name(),
            PlanNode::Project { child, .. } => child.table_name(),
            PlanNode::Update { table, .. } => Some(table),
            PlanNode::Delete { table, .. } => Some(table),
        }
    }
}
