//! Lowers the accepted SQL subset onto executor plan trees.
//!
//! Parsing is `sqlparser`'s job; this module only maps its AST onto
//! [`PlanNode`]s. Statements the executor has no plan node for (joins,
//! grouping, procedures, ...) surface `UnsupportedFeature` here, before
//! anything touches storage.

use sqlparser::ast::{
    BinaryOperator, ColumnOption, DataType, Expr, ObjectName, ObjectType, Select, SelectItem,
    SetExpr, Statement, TableFactor, UnaryOperator, Value, Values,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Tokenizer;

use crate::catalog::schema::{Column, ColumnType};
use crate::error::{ErrorKind, SmallError};
use crate::executor::plan::PlanNode;
use crate::executor::predicate::{Op, Predicate, Term};

const DEFAULT_VARCHAR_LEN: u16 = 255;

fn parse_error(msg: &str) -> SmallError {
    SmallError::new(ErrorKind::Parse, msg)
}

fn unsupported(what: &str) -> SmallError {
    SmallError::new(ErrorKind::Unsupported, what)
}

/// Turn one SQL statement into a plan.
pub fn plan_statement(sql: &str) -> Result<PlanNode, SmallError> {
    let dialect = GenericDialect {};

    // the tokenizer is the only stage that knows source positions; run it
    // first so lexical errors carry line/column
    let mut tokenizer = Tokenizer::new(&dialect, sql);
    if let Err(e) = tokenizer.tokenize() {
        return Err(
            SmallError::new(ErrorKind::Parse, &e.message).with_location(e.line, e.col)
        );
    }

    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| parse_error(&e.to_string()))?;
    if statements.len() != 1 {
        return Err(parse_error(&format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }

    match statements.remove(0) {
        Statement::CreateTable { name, columns, .. } => plan_create_table(&name, &columns),
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            ..
        } => {
            if names.len() != 1 {
                return Err(unsupported("dropping several tables at once"));
            }
            Ok(PlanNode::DropTable {
                name: object_name(&names[0]),
            })
        }
        Statement::CreateIndex {
            name,
            table_name,
            columns,
            ..
        } => {
            let mut column_names = Vec::new();
            for ordered in &columns {
                match &ordered.expr {
                    Expr::Identifier(ident) => column_names.push(ident.value.clone()),
                    other => {
                        return Err(unsupported(&format!(
                            "index over an expression ({})",
                            other
                        )))
                    }
                }
            }
            Ok(PlanNode::CreateIndex {
                name: object_name(&name),
                table: object_name(&table_name),
                columns: column_names,
            })
        }
        Statement::ShowTables { .. } => Ok(PlanNode::ShowTables),
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => plan_insert(&table_name, &columns, &source.body),
        Statement::Query(query) => {
            if !query.order_by.is_empty() {
                return Err(unsupported("ORDER BY"));
            }
            if query.limit.is_some() || query.offset.is_some() {
                return Err(unsupported("LIMIT / OFFSET"));
            }
            match query.body.as_ref() {
                SetExpr::Select(select) => plan_select(select),
                _ => Err(unsupported("set operations")),
            }
        }
        Statement::Update {
            table,
            assignments,
            selection,
            from,
            ..
        } => {
            if from.is_some() {
                return Err(unsupported("UPDATE ... FROM"));
            }
            if !table.joins.is_empty() {
                return Err(unsupported("JOIN"));
            }
            let table = table_factor_name(&table.relation)?;
            let mut pairs = Vec::new();
            for assignment in &assignments {
                let column = assignment
                    .id
                    .iter()
                    .map(|i| i.value.clone())
                    .collect::<Vec<_>>()
                    .join(".");
                pairs.push((column, literal_text(&assignment.value)?));
            }
            Ok(PlanNode::Update {
                table,
                assignments: pairs,
                predicate: optional_predicate(&selection)?,
            })
        }
        Statement::Delete {
            table_name,
            selection,
            ..
        } => {
            let table = table_factor_name(&table_name)?;
            Ok(PlanNode::Delete {
                table,
                predicate: optional_predicate(&selection)?,
            })
        }
        _ => Err(unsupported(&format!(
            "{} statements",
            sql.split_whitespace().next().unwrap_or("such")
        ))),
    }
}

fn plan_create_table(
    name: &ObjectName,
    columns: &[sqlparser::ast::ColumnDef],
) -> Result<PlanNode, SmallError> {
    let mut out = Vec::new();
    for def in columns {
        let ctype = map_data_type(&def.data_type)?;
        let mut column = Column::new(&def.name.value, ctype);
        for option in &def.options {
            match &option.option {
                ColumnOption::Unique { is_primary: true } => {
                    column.primary_key = true;
                    column.not_null = true;
                }
                ColumnOption::Unique { is_primary: false } => column.unique = true,
                ColumnOption::NotNull => column.not_null = true,
                ColumnOption::Null => {}
                ColumnOption::Default(expr) => {
                    column.default_value = Some(literal_text(expr)?);
                }
                other => {
                    return Err(unsupported(&format!("column option {}", other)));
                }
            }
        }
        out.push(column);
    }
    Ok(PlanNode::CreateTable {
        name: object_name(name),
        columns: out,
    })
}

fn plan_insert(
    table_name: &ObjectName,
    columns: &[sqlparser::ast::Ident],
    body: &SetExpr,
) -> Result<PlanNode, SmallError> {
    let values = match body {
        SetExpr::Values(Values { rows, .. }) => rows,
        _ => return Err(unsupported("INSERT ... SELECT")),
    };

    let mut literal_rows = Vec::with_capacity(values.len());
    for row in values {
        let mut texts = Vec::with_capacity(row.len());
        for expr in row {
            texts.push(literal_text(expr)?);
        }
        literal_rows.push(texts);
    }
    if literal_rows.is_empty() {
        return Err(SmallError::new(ErrorKind::Semantic, "INSERT without rows"));
    }
    let width = literal_rows[0].len();
    if literal_rows.iter().any(|r| r.len() != width) {
        return Err(SmallError::new(
            ErrorKind::Semantic,
            "INSERT rows differ in width",
        ));
    }

    let column_names: Option<Vec<String>> = if columns.is_empty() {
        None
    } else {
        Some(columns.iter().map(|i| i.value.clone()).collect())
    };
    Ok(PlanNode::Insert {
        table: object_name(table_name),
        columns: column_names,
        rows: literal_rows,
    })
}

fn plan_select(select: &Select) -> Result<PlanNode, SmallError> {
    if select.distinct {
        return Err(unsupported("DISTINCT"));
    }
    if !select.group_by.is_empty() {
        return Err(unsupported("GROUP BY"));
    }
    if select.having.is_some() {
        return Err(unsupported("HAVING"));
    }
    if select.from.len() != 1 {
        return Err(unsupported("queries over several tables"));
    }
    if !select.from[0].joins.is_empty() {
        return Err(unsupported("JOIN"));
    }

    let table = table_factor_name(&select.from[0].relation)?;

    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => columns.push("*".to_string()),
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => columns.push(ident.value.clone()),
            other => {
                return Err(unsupported(&format!(
                    "select list item {} (only plain columns and *)",
                    other
                )))
            }
        }
    }
    if columns.is_empty() {
        return Err(parse_error("empty select list"));
    }

    let mut plan = PlanNode::SeqScan { table };
    if let Some(selection) = &select.selection {
        let predicate = Predicate::and(expr_to_terms(selection)?);
        plan = PlanNode::Filter {
            child: Box::new(plan),
            predicate,
        };
    }
    Ok(PlanNode::Project {
        child: Box::new(plan),
        columns,
    })
}

fn optional_predicate(selection: &Option<Expr>) -> Result<Predicate, SmallError> {
    match selection {
        Some(expr) => Ok(Predicate::and(expr_to_terms(expr)?)),
        None => Ok(Predicate::always_true()),
    }
}

/// Flatten a WHERE expression into the conjunction grammar the executor
/// evaluates: `col OP literal [AND ...]`, with BETWEEN sugar.
fn expr_to_terms(expr: &Expr) -> Result<Vec<Term>, SmallError> {
    match expr {
        Expr::Nested(inner) => expr_to_terms(inner),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut terms = expr_to_terms(left)?;
            terms.extend(expr_to_terms(right)?);
            Ok(terms)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = match left.as_ref() {
                Expr::Identifier(ident) => ident.value.clone(),
                other => {
                    return Err(unsupported(&format!(
                        "predicate over {} (only column OP literal)",
                        other
                    )))
                }
            };
            let op = map_operator(op)?;
            let value = literal_text(right)?;
            Ok(vec![Term::new(&column, op, &value)])
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => {
            let column = match expr.as_ref() {
                Expr::Identifier(ident) => ident.value.clone(),
                other => {
                    return Err(unsupported(&format!(
                        "BETWEEN over {} (only plain columns)",
                        other
                    )))
                }
            };
            Ok(vec![
                Term::new(&column, Op::GreaterThanOrEq, &literal_text(low)?),
                Term::new(&column, Op::LessThanOrEq, &literal_text(high)?),
            ])
        }
        other => Err(unsupported(&format!("predicate {}", other))),
    }
}

fn map_operator(op: &BinaryOperator) -> Result<Op, SmallError> {
    match op {
        BinaryOperator::Eq => Ok(Op::Equals),
        BinaryOperator::NotEq => Ok(Op::NotEquals),
        BinaryOperator::Gt => Ok(Op::GreaterThan),
        BinaryOperator::Lt => Ok(Op::LessThan),
        BinaryOperator::GtEq => Ok(Op::GreaterThanOrEq),
        BinaryOperator::LtEq => Ok(Op::LessThanOrEq),
        other => Err(unsupported(&format!("operator {}", other))),
    }
}

fn map_data_type(data_type: &DataType) -> Result<ColumnType, SmallError> {
    match data_type {
        DataType::Int(_) | DataType::Integer(_) => Ok(ColumnType::Int),
        DataType::BigInt(_) => Ok(ColumnType::BigInt),
        DataType::Double | DataType::DoublePrecision | DataType::Float(_) | DataType::Real => {
            Ok(ColumnType::Double)
        }
        DataType::Varchar(len) => Ok(ColumnType::Varchar(character_length(len))),
        DataType::Char(len) | DataType::Character(len) => {
            Ok(ColumnType::Char(character_length(len).max(1)))
        }
        other => Err(unsupported(&format!("column type {}", other))),
    }
}

fn character_length(len: &Option<sqlparser::ast::CharacterLength>) -> u16 {
    match len {
        Some(l) => l.length.min(u16::MAX as u64) as u16,
        None => DEFAULT_VARCHAR_LEN,
    }
}

fn literal_text(expr: &Expr) -> Result<String, SmallError> {
    match expr {
        Expr::Value(Value::Number(text, _)) => Ok(text.clone()),
        Expr::Value(Value::SingleQuotedString(text)) => Ok(text.clone()),
        Expr::Value(Value::DoubleQuotedString(text)) => Ok(text.clone()),
        Expr::Value(Value::Boolean(b)) => Ok(b.to_string()),
        Expr::Value(Value::Null) => Err(unsupported("NULL literals")),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(Value::Number(text, _)) => Ok(format!("-{}", text)),
            other => Err(unsupported(&format!("literal {}", other))),
        },
        other => Err(unsupported(&format!(
            "literal {} (only numbers and strings)",
            other
        ))),
    }
}

fn table_factor_name(factor: &TableFactor) -> Result<String, SmallError> {
    match factor {
        TableFactor::Table { name, .. } => Ok(object_name(name)),
        other => Err(unsupported(&format!("table source {}", other))),
    }
}

fn object_name(name: &ObjectName) -> String {
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_select_with_where() {
        let plan =
            plan_statement("SELECT name, age FROM students WHERE age >= 20;").unwrap();
        match plan {
            PlanNode::Project { child, columns } => {
                assert_eq!(columns, vec!["name".to_string(), "age".to_string()]);
                match *child {
                    PlanNode::Filter { child, predicate } => {
                        assert_eq!(predicate.terms.len(), 1);
                        assert_eq!(predicate.terms[0].column, "age");
                        assert_eq!(predicate.terms[0].op, Op::GreaterThanOrEq);
                        assert_eq!(*child, PlanNode::SeqScan {
                            table: "students".to_string()
                        });
                    }
                    other => panic!("expected a filter, got {:?}", other),
                }
            }
            other => panic!("expected a projection, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_between() {
        let plan = plan_statement("SELECT id FROM t WHERE age BETWEEN 20 AND 22").unwrap();
        match plan {
            PlanNode::Project { child, .. } => match *child {
                PlanNode::Filter { predicate, .. } => {
                    assert_eq!(predicate.terms.len(), 2);
                    assert_eq!(predicate.terms[0].op, Op::GreaterThanOrEq);
                    assert_eq!(predicate.terms[1].op, Op::LessThanOrEq);
                }
                other => panic!("expected a filter, got {:?}", other),
            },
            other => panic!("expected a projection, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_insert() {
        let plan =
            plan_statement("INSERT INTO students VALUES (1,'Alice',20),(2,'Bob',19);").unwrap();
        match plan {
            PlanNode::Insert {
                table,
                columns,
                rows,
            } => {
                assert_eq!(table, "students");
                assert!(columns.is_none());
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0], vec!["1", "Alice", "20"]);
            }
            other => panic!("expected an insert, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_create_table_flags() {
        let plan = plan_statement(
            "CREATE TABLE t(id INT PRIMARY KEY, name VARCHAR(50) NOT NULL, age INT DEFAULT 18);",
        )
        .unwrap();
        match plan {
            PlanNode::CreateTable { columns, .. } => {
                assert!(columns[0].primary_key && columns[0].not_null);
                assert_eq!(columns[1].ctype, ColumnType::Varchar(50));
                assert!(columns[1].not_null);
                assert_eq!(columns[2].default_value.as_deref(), Some("18"));
            }
            other => panic!("expected a create table, got {:?}", other),
        }
    }

    #[test]
    fn test_joins_are_unsupported() {
        let e = plan_statement("SELECT a FROM t1 JOIN t2 ON t1.id = t2.id").unwrap_err();
        assert_eq!(e.kind, ErrorKind::Unsupported);
        let e = plan_statement("SELECT a FROM t GROUP BY a").unwrap_err();
        assert_eq!(e.kind, ErrorKind::Unsupported);
    }

    #[test]
    fn test_parse_error_surfaces() {
        let e = plan_statement("SELEKT oops").unwrap_err();
        assert_eq!(e.kind, ErrorKind::Parse);
    }

    #[test]
    fn test_negative_literal() {
        let plan = plan_statement("INSERT INTO t VALUES (-5)").unwrap();
        match plan {
            PlanNode::Insert { rows, .. } => assert_eq!(rows[0][0], "-5"),
            other => panic!("expected an insert, got {:?}", other),
        }
    }
}
