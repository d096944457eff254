pub mod executor;
pub mod plan;
pub mod predicate;
pub mod row;

pub use executor::{AllowAll, Executor, Operation, PermissionChecker, QueryResult};
pub use plan::PlanNode;
pub use predicate::{Op, Predicate, Term};
pub use row::Row;
