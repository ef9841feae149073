//! Inliner
//!
//! Serialises closure rows and userset rules as `VALUES` tables embedded in
//! every routine that needs them, so generated routines carry their own
//! metadata instead of reading a side table.

use super::ast::SqlExpr;
use super::stmt::ValuesTable;
use crate::semantic::{ClosureRow, UsersetRule};

/// Columns of an inlined closure table. The object type is fixed per
/// routine and therefore not carried.
pub const CLOSURE_COLUMNS: [&str; 2] = ["relation", "satisfying_relation"];

/// Columns of an inlined userset-rule table.
pub const USERSET_COLUMNS: [&str; 4] = [
    "tuple_relation",
    "subject_type",
    "subject_relation",
    "subject_relation_satisfying",
];

/// Inlines closure rows under `alias`.
pub fn closure_values(alias: &str, rows: &[ClosureRow]) -> ValuesTable {
    ValuesTable::new(
        alias,
        &CLOSURE_COLUMNS,
        rows.iter()
            .map(|row| {
                vec![
                    SqlExpr::str(&row.relation),
                    SqlExpr::str(&row.satisfying_relation),
                ]
            })
            .collect(),
    )
}

/// Inlines `(relation, satisfying_relation)` pairs under `alias`; used for
/// the membership side of userset joins, where the rows come from another
/// type's closure.
pub fn member_closure_values(alias: &str, pairs: &[(String, String)]) -> ValuesTable {
    ValuesTable::new(
        alias,
        &CLOSURE_COLUMNS,
        pairs
            .iter()
            .map(|(relation, satisfying)| {
                vec![SqlExpr::str(relation), SqlExpr::str(satisfying)]
            })
            .collect(),
    )
}

/// Inlines userset rules under `alias`.
pub fn userset_values(alias: &str, rules: &[UsersetRule]) -> ValuesTable {
    ValuesTable::new(
        alias,
        &USERSET_COLUMNS,
        rules
            .iter()
            .map(|rule| {
                vec![
                    SqlExpr::str(&rule.tuple_relation),
                    SqlExpr::str(&rule.subject_type),
                    SqlExpr::str(&rule.subject_relation),
                    SqlExpr::str(&rule.subject_relation_satisfying),
                ]
            })
            .collect(),
    )
}
