//! SQL statement tree
//!
//! SELECT statements, joins, inline VALUES tables, function tables and
//! (recursive) CTEs. Statements render single-line; CTE definitions break
//! onto their own lines so generated routine bodies stay readable.

use super::ast::{sanitize_ident, SqlExpr, ToSql};

/// One projected column, optionally aliased.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn expr(expr: SqlExpr) -> Self {
        SelectItem { expr, alias: None }
    }

    pub fn aliased(expr: SqlExpr, alias: &str) -> Self {
        SelectItem {
            expr,
            alias: Some(sanitize_ident(alias)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
    CrossLateral,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub table: TableExpr,
    /// Conjoined ON conditions; must be empty for cross joins.
    pub on: Vec<SqlExpr>,
}

impl JoinClause {
    pub fn inner(table: TableExpr, on: Vec<SqlExpr>) -> Self {
        JoinClause {
            kind: JoinKind::Inner,
            table,
            on,
        }
    }

    pub fn cross_lateral(table: TableExpr) -> Self {
        JoinClause {
            kind: JoinKind::CrossLateral,
            table,
            on: Vec::new(),
        }
    }
}

impl ToSql for JoinClause {
    fn sql(&self) -> String {
        let keyword = match self.kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Cross => "CROSS JOIN",
            JoinKind::CrossLateral => "CROSS JOIN LATERAL",
        };
        let mut out = format!("{keyword} {}", self.table.sql());
        if !self.on.is_empty() {
            let on = SqlExpr::and(self.on.clone());
            out.push_str(&format!(" ON {}", on.sql()));
        }
        out
    }
}

/// Anything that can stand in FROM or JOIN position.
#[derive(Debug, Clone, PartialEq)]
pub enum TableExpr {
    Table {
        name: String,
        alias: String,
    },
    Values(ValuesTable),
    Function(FunctionTable),
    Subquery {
        query: Box<Query>,
        alias: String,
        columns: Vec<String>,
    },
}

impl TableExpr {
    pub fn table(name: &str, alias: &str) -> Self {
        TableExpr::Table {
            name: sanitize_ident(name),
            alias: sanitize_ident(alias),
        }
    }

    pub fn subquery(query: Query, alias: &str, columns: &[&str]) -> Self {
        TableExpr::Subquery {
            query: Box::new(query),
            alias: sanitize_ident(alias),
            columns: columns.iter().map(|c| sanitize_ident(c)).collect(),
        }
    }
}

impl ToSql for TableExpr {
    fn sql(&self) -> String {
        match self {
            TableExpr::Table { name, alias } => format!("{name} AS {alias}"),
            TableExpr::Values(values) => values.sql(),
            TableExpr::Function(function) => function.sql(),
            TableExpr::Subquery {
                query,
                alias,
                columns,
            } => {
                format!("({}) AS {alias}({})", query.sql(), columns.join(", "))
            }
        }
    }
}

/// An inline `VALUES` table. An empty row set renders one all-NULL row so
/// the table keeps its schema; joins simply never match it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuesTable {
    pub alias: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlExpr>>,
}

impl ValuesTable {
    pub fn new(alias: &str, columns: &[&str], rows: Vec<Vec<SqlExpr>>) -> Self {
        ValuesTable {
            alias: sanitize_ident(alias),
            columns: columns.iter().map(|c| sanitize_ident(c)).collect(),
            rows,
        }
    }
}

impl ToSql for ValuesTable {
    fn sql(&self) -> String {
        let rows = if self.rows.is_empty() {
            vec![vec![SqlExpr::Null; self.columns.len()]]
        } else {
            self.rows.clone()
        };
        let rows = rows
            .iter()
            .map(|row| {
                let row = row.iter().map(|v| v.sql()).collect::<Vec<_>>().join(", ");
                format!("({row})")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "(VALUES {rows}) AS {}({})",
            self.alias,
            self.columns.join(", ")
        )
    }
}

/// A sibling routine called as a table source.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionTable {
    pub name: String,
    pub args: Vec<SqlExpr>,
    pub alias: String,
    pub columns: Vec<String>,
}

impl FunctionTable {
    pub fn new(name: &str, args: Vec<SqlExpr>, alias: &str, columns: &[&str]) -> Self {
        FunctionTable {
            name: sanitize_ident(name),
            args,
            alias: sanitize_ident(alias),
            columns: columns.iter().map(|c| sanitize_ident(c)).collect(),
        }
    }
}

impl ToSql for FunctionTable {
    fn sql(&self) -> String {
        let args = self.args.iter().map(|a| a.sql()).collect::<Vec<_>>().join(", ");
        format!(
            "{}({args}) AS {}({})",
            self.name,
            self.alias,
            self.columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub distinct: bool,
    pub columns: Vec<SelectItem>,
    pub from: Option<TableExpr>,
    pub joins: Vec<JoinClause>,
    pub where_: Vec<SqlExpr>,
}

impl SelectStmt {
    pub fn new() -> Self {
        SelectStmt {
            distinct: false,
            columns: Vec::new(),
            from: None,
            joins: Vec::new(),
            where_: Vec::new(),
        }
    }

    pub fn column(mut self, item: SelectItem) -> Self {
        self.columns.push(item);
        self
    }

    pub fn from(mut self, table: TableExpr) -> Self {
        self.from = Some(table);
        self
    }

    pub fn join(mut self, join: JoinClause) -> Self {
        self.joins.push(join);
        self
    }

    pub fn where_(mut self, predicate: SqlExpr) -> Self {
        self.where_.push(predicate);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

impl Default for SelectStmt {
    fn default() -> Self {
        Self::new()
    }
}

impl ToSql for SelectStmt {
    fn sql(&self) -> String {
        let mut out = String::from("SELECT ");
        if self.distinct {
            out.push_str("DISTINCT ");
        }
        let columns = self
            .columns
            .iter()
            .map(|item| match &item.alias {
                Some(alias) => format!("{} AS {alias}", item.expr.sql()),
                None => item.expr.sql(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&columns);
        if let Some(from) = &self.from {
            out.push_str(&format!(" FROM {}", from.sql()));
        }
        for join in &self.joins {
            out.push(' ');
            out.push_str(&join.sql());
        }
        if !self.where_.is_empty() {
            out.push_str(&format!(" WHERE {}", SqlExpr::and(self.where_.clone()).sql()));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    UnionAll,
    Intersect,
}

impl SetOp {
    fn keyword(self) -> &'static str {
        match self {
            SetOp::Union => "UNION",
            SetOp::UnionAll => "UNION ALL",
            SetOp::Intersect => "INTERSECT",
        }
    }
}

/// A SELECT or a set-operation tree over SELECTs.
#[derive(Debug, Clone, PartialEq)]
pub enum SetExpr {
    Select(SelectStmt),
    Op {
        op: SetOp,
        operands: Vec<SetExpr>,
    },
}

impl SetExpr {
    /// Unions the operands, collapsing a single operand away.
    pub fn union(mut operands: Vec<SetExpr>) -> SetExpr {
        if operands.len() == 1 {
            operands.remove(0)
        } else {
            SetExpr::Op {
                op: SetOp::Union,
                operands,
            }
        }
    }

    pub fn intersect(mut operands: Vec<SetExpr>) -> SetExpr {
        if operands.len() == 1 {
            operands.remove(0)
        } else {
            SetExpr::Op {
                op: SetOp::Intersect,
                operands,
            }
        }
    }
}

impl From<SelectStmt> for SetExpr {
    fn from(stmt: SelectStmt) -> Self {
        SetExpr::Select(stmt)
    }
}

impl ToSql for SetExpr {
    fn sql(&self) -> String {
        match self {
            SetExpr::Select(stmt) => stmt.sql(),
            SetExpr::Op { op, operands } => operands
                .iter()
                .map(|operand| match operand {
                    SetExpr::Select(stmt) => stmt.sql(),
                    nested => format!("({})", nested.sql()),
                })
                .collect::<Vec<_>>()
                .join(&format!(" {} ", op.keyword())),
        }
    }
}

/// One common table expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CteDef {
    pub name: String,
    pub columns: Vec<String>,
    pub body: SetExpr,
}

impl CteDef {
    pub fn new(name: &str, columns: &[&str], body: SetExpr) -> Self {
        CteDef {
            name: sanitize_ident(name),
            columns: columns.iter().map(|c| sanitize_ident(c)).collect(),
            body,
        }
    }
}

/// A full query: optional (recursive) WITH clause, a set-expression body,
/// ordering and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub recursive: bool,
    pub ctes: Vec<CteDef>,
    pub body: SetExpr,
    pub order_by: Vec<SqlExpr>,
    pub limit: Option<SqlExpr>,
}

impl Query {
    pub fn new(body: SetExpr) -> Self {
        Query {
            recursive: false,
            ctes: Vec::new(),
            body,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn with(mut self, cte: CteDef) -> Self {
        self.ctes.push(cte);
        self
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn order_by(mut self, expr: SqlExpr) -> Self {
        self.order_by.push(expr);
        self
    }

    pub fn limit(mut self, limit: SqlExpr) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl From<SelectStmt> for Query {
    fn from(stmt: SelectStmt) -> Self {
        Query::new(stmt.into())
    }
}

impl From<SetExpr> for Query {
    fn from(body: SetExpr) -> Self {
        Query::new(body)
    }
}

impl ToSql for Query {
    fn sql(&self) -> String {
        let mut out = String::new();
        if !self.ctes.is_empty() {
            out.push_str("WITH ");
            if self.recursive {
                out.push_str("RECURSIVE ");
            }
            let ctes = self
                .ctes
                .iter()
                .map(|cte| {
                    format!(
                        "{}({}) AS (\n{}\n)",
                        cte.name,
                        cte.columns.join(", "),
                        cte.body.sql()
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&ctes);
            out.push('\n');
        }
        out.push_str(&self.body.sql());
        if !self.order_by.is_empty() {
            let order = self
                .order_by
                .iter()
                .map(|e| e.sql())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(limit) = &self.limit {
            out.push_str(&format!(" LIMIT {}", limit.sql()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    fn tuples(alias: &str) -> TableExpr {
        TableExpr::table("melange_tuples", alias)
    }

    #[test]
    fn test_select_rendering() {
        let stmt = SelectStmt::new()
            .distinct()
            .column(SelectItem::expr(SqlExpr::col("t", "object_id")))
            .from(tuples("t"))
            .where_(SqlExpr::eq(SqlExpr::col("t", "object_type"), SqlExpr::str("doc")))
            .where_(SqlExpr::eq(SqlExpr::col("t", "relation"), SqlExpr::str("owner")));
        assert_snapshot!(stmt.sql(), @"SELECT DISTINCT t.object_id FROM melange_tuples AS t WHERE t.object_type = 'doc' AND t.relation = 'owner'");
    }

    #[test]
    fn test_values_table_empty_renders_null_row() {
        let values = ValuesTable::new("c", &["relation", "satisfying_relation"], Vec::new());
        assert_eq!(
            values.sql(),
            "(VALUES (NULL, NULL)) AS c(relation, satisfying_relation)"
        );
    }

    #[test]
    fn test_function_table_join() {
        let stmt = SelectStmt::new()
            .column(SelectItem::expr(SqlExpr::col("f", "object_id")))
            .from(TableExpr::Function(FunctionTable::new(
                "list_objects_doc_editor",
                vec![SqlExpr::param("p_subject_type"), SqlExpr::param("p_subject_id")],
                "f",
                &["object_id"],
            )));
        assert_snapshot!(stmt.sql(), @"SELECT f.object_id FROM list_objects_doc_editor(p_subject_type, p_subject_id) AS f(object_id)");
    }

    #[test]
    fn test_recursive_cte() {
        let base = SelectStmt::new()
            .column(SelectItem::expr(SqlExpr::col("t", "object_id")))
            .column(SelectItem::expr(SqlExpr::Int(0)))
            .from(tuples("t"));
        let step = SelectStmt::new()
            .column(SelectItem::expr(SqlExpr::col("l", "object_id")))
            .column(SelectItem::expr(SqlExpr::Raw("a.depth + 1".to_string())))
            .from(TableExpr::table("accessible", "a"))
            .join(JoinClause::inner(
                tuples("l"),
                vec![SqlExpr::eq(SqlExpr::col("l", "subject_id"), SqlExpr::col("a", "object_id"))],
            ))
            .where_(SqlExpr::Lt(
                Box::new(SqlExpr::col("a", "depth")),
                Box::new(SqlExpr::Int(25)),
            ));
        let query = Query::new(
            SelectStmt::new()
                .distinct()
                .column(SelectItem::expr(SqlExpr::col("a", "object_id")))
                .from(TableExpr::table("accessible", "a"))
                .into(),
        )
        .recursive()
        .with(CteDef::new(
            "accessible",
            &["object_id", "depth"],
            SetExpr::union(vec![base.into(), step.into()]),
        ));

        assert_snapshot!(query.sql(), @r###"
        WITH RECURSIVE accessible(object_id, depth) AS (
        SELECT t.object_id, 0 FROM melange_tuples AS t UNION SELECT l.object_id, a.depth + 1 FROM accessible AS a INNER JOIN melange_tuples AS l ON l.subject_id = a.object_id WHERE a.depth < 25
        )
        SELECT DISTINCT a.object_id FROM accessible AS a
        "###);
    }

    #[test]
    fn test_intersect_groups_union() {
        let part = |relation: &str| {
            SetExpr::from(
                SelectStmt::new()
                    .column(SelectItem::expr(SqlExpr::col("t", "object_id")))
                    .from(tuples("t"))
                    .where_(SqlExpr::eq(SqlExpr::col("t", "relation"), SqlExpr::str(relation))),
            )
        };
        let set = SetExpr::union(vec![
            SetExpr::intersect(vec![part("viewer"), part("paid")]),
            part("owner"),
        ]);
        assert_snapshot!(set.sql(), @"(SELECT t.object_id FROM melange_tuples AS t WHERE t.relation = 'viewer' INTERSECT SELECT t.object_id FROM melange_tuples AS t WHERE t.relation = 'paid') UNION SELECT t.object_id FROM melange_tuples AS t WHERE t.relation = 'owner'");
    }
}
