use std::cmp::Ordering;
use std::fmt;

use itertools::Itertools;

use crate::catalog::schema::TableSchema;
use crate::error::{ErrorKind, SmallError};
use crate::executor::row::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEq,
    LessThanOrEq,
}

impl Op {
    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Op::Equals => ordering == Ordering::Equal,
            Op::NotEquals => ordering != Ordering::Equal,
            Op::GreaterThan => ordering == Ordering::Greater,
            Op::LessThan => ordering == Ordering::Less,
            Op::GreaterThanOrEq => ordering != Ordering::Less,
            Op::LessThanOrEq => ordering != Ordering::Greater,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Op::Equals => "=",
            Op::NotEquals => "!=",
            Op::GreaterThan => ">",
            Op::LessThan => "<",
            Op::GreaterThanOrEq => ">=",
            Op::LessThanOrEq => "<=",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One `column OP literal` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub column: String,
    pub op: Op,
    pub value: String,
}

impl Term {
    pub fn new(column: &str, op: Op, value: &str) -> Self {
        Self {
            column: column.to_string(),
            op,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op, self.value)
    }
}

/// A conjunction of terms. The empty predicate accepts every row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate {
    pub terms: Vec<Term>,
}

impl Predicate {
    pub fn always_true() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn and(terms: Vec<Term>) -> Self {
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluate against a row. Comparison is numeric when the column is
    /// numeric and both sides parse as numbers; text comparison
    /// (lexicographic for the ordering operators) otherwise. Naming a
    /// column the schema does not have is an expression error.
    pub fn matches(&self, row: &Row, schema: &TableSchema) -> Result<bool, SmallError> {
        for term in &self.terms {
            let column = schema.column(&term.column).ok_or_else(|| {
                SmallError::new(
                    ErrorKind::Expression,
                    &format!("unknown column {} in predicate", term.column),
                )
            })?;
            let actual = row.get(&term.column).ok_or_else(|| {
                SmallError::new(
                    ErrorKind::Expression,
                    &format!("row carries no value for column {}", term.column),
                )
            })?;

            let ordering = compare(actual, &term.value, column.ctype.is_numeric());
            let ordering = match ordering {
                Some(o) => o,
                None => {
                    return Err(SmallError::new(
                        ErrorKind::Expression,
                        &format!("cannot compare {:?} against {:?}", actual, term.value),
                    ))
                }
            };
            if !term.op.accepts(ordering) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "true");
        }
        write!(f, "{}", self.terms.iter().map(|t| t.to_string()).join(" AND "))
    }
}

/// Three-way comparison of two textual values. Integer comparison is
/// exact; mixed or fractional numbers fall back to floating point.
fn compare(left: &str, right: &str, numeric: bool) -> Option<Ordering> {
    if numeric {
        if let (Ok(l), Ok(r)) = (left.trim().parse::<i128>(), right.trim().parse::<i128>()) {
            return Some(l.cmp(&r));
        }
        if let (Ok(l), Ok(r)) = (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
            return l.partial_cmp(&r);
        }
        return None;
    }
    Some(left.cmp(right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::{Column, ColumnType};
    use crate::types::INVALID_PAGE_ID;

    fn schema() -> TableSchema {
        TableSchema {
            table_name: "t".to_string(),
            columns: vec![
                Column::new("age", ColumnType::Int),
                Column::new("name", ColumnType::Varchar(20)),
            ],
            first_page_id: INVALID_PAGE_ID,
            owner: "root".to_string(),
        }
    }

    fn row(age: &str, name: &str) -> Row {
        Row::new(vec![
            ("age".to_string(), age.to_string()),
            ("name".to_string(), name.to_string()),
        ])
    }

    #[test]
    fn test_numeric_comparison() {
        let schema = schema();
        let p = Predicate::and(vec![Term::new("age", Op::GreaterThanOrEq, "20")]);
        assert!(p.matches(&row("20", "Alice"), &schema).unwrap());
        assert!(p.matches(&row("21", "Bob"), &schema).unwrap());
        assert!(!p.matches(&row("9", "Carol"), &schema).unwrap());
    }

    #[test]
    fn test_string_equality() {
        let schema = schema();
        let p = Predicate::and(vec![Term::new("name", Op::Equals, "Alice")]);
        assert!(p.matches(&row("20", "Alice"), &schema).unwrap());
        assert!(!p.matches(&row("20", "Bob"), &schema).unwrap());
    }

    #[test]
    fn test_conjunction() {
        let schema = schema();
        let p = Predicate::and(vec![
            Term::new("age", Op::GreaterThan, "18"),
            Term::new("name", Op::NotEquals, "Bob"),
        ]);
        assert!(p.matches(&row("20", "Alice"), &schema).unwrap());
        assert!(!p.matches(&row("20", "Bob"), &schema).unwrap());
        assert!(!p.matches(&row("18", "Alice"), &schema).unwrap());
    }

    #[test]
    fn test_unknown_column() {
        let schema = schema();
        let p = Predicate::and(vec![Term::new("salary", Op::Equals, "1")]);
        let e = p.matches(&row("20", "Alice"), &schema).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Expression);
    }

    #[test]
    fn test_empty_predicate() {
        let schema = schema();
        assert!(Predicate::always_true()
            .matches(&row("1", "x"), &schema)
            .unwrap());
    }
}
