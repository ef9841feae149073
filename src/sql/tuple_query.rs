//! Fluent builder for queries over the tuple view.
//!
//! Every query a template writes against `melange_tuples` goes through this
//! builder; it owns the view name, the alias discipline and the userset
//! string convention, and freezes into a [SelectStmt] on build.

use super::ast::{ObjectRef, SqlExpr, SubjectRef, ToSql};
use super::stmt::{JoinClause, Query, SelectItem, SelectStmt, TableExpr, ValuesTable};

/// The external view generated routines read from. The application owns it
/// and may derive it from any tables.
pub const TUPLE_VIEW: &str = "melange_tuples";

#[derive(Debug, Clone, PartialEq)]
pub struct TupleQuery {
    alias: String,
    columns: Vec<SelectItem>,
    predicates: Vec<SqlExpr>,
    joins: Vec<JoinClause>,
    distinct: bool,
}

impl TupleQuery {
    /// Starts a scan of the tuple view under `alias`.
    pub fn scan(alias: &str) -> Self {
        TupleQuery {
            alias: alias.to_string(),
            columns: Vec::new(),
            predicates: Vec::new(),
            joins: Vec::new(),
            distinct: false,
        }
    }

    fn col(&self, column: &str) -> SqlExpr {
        SqlExpr::col(&self.alias, column)
    }

    pub fn object_type(mut self, object_type: &str) -> Self {
        self.predicates
            .push(SqlExpr::eq(self.col("object_type"), SqlExpr::str(object_type)));
        self
    }

    /// Restricts the tuple relation to the given set.
    pub fn relations(mut self, relations: &[String]) -> Self {
        self.predicates
            .push(SqlExpr::in_strings(self.col("relation"), relations));
        self
    }

    /// Matches a concrete subject: type, plain id, optional wildcard arm.
    pub fn where_subject(mut self, subject: &SubjectRef, wildcard_gate: Option<SqlExpr>) -> Self {
        self.predicates.push(SqlExpr::eq(
            self.col("subject_type"),
            subject.subject_type.clone(),
        ));
        self.predicates
            .push(SqlExpr::NoUserset(Box::new(self.col("subject_id"))));
        self.predicates.push(SqlExpr::SubjectIdMatch {
            column: Box::new(self.col("subject_id")),
            value: Box::new(subject.subject_id.clone()),
            wildcard_gate: wildcard_gate.map(Box::new),
        });
        self
    }

    pub fn where_object(mut self, object: &ObjectRef) -> Self {
        self.predicates
            .push(SqlExpr::eq(self.col("object_type"), object.object_type.clone()));
        self.predicates
            .push(SqlExpr::eq(self.col("object_id"), object.object_id.clone()));
        self
    }

    pub fn where_object_id(mut self, object_id: SqlExpr) -> Self {
        self.predicates
            .push(SqlExpr::eq(self.col("object_id"), object_id));
        self
    }

    /// The subject carries a `#relation` marker.
    pub fn where_has_userset(mut self) -> Self {
        self.predicates
            .push(SqlExpr::HasUserset(Box::new(self.col("subject_id"))));
        self
    }

    /// The subject is a plain id.
    pub fn where_no_userset(mut self) -> Self {
        self.predicates
            .push(SqlExpr::NoUserset(Box::new(self.col("subject_id"))));
        self
    }

    /// The subject's userset relation is one of the given set.
    pub fn where_userset_relation(mut self, relations: &[String]) -> Self {
        self.predicates.push(SqlExpr::in_strings(
            SqlExpr::UsersetRelation(Box::new(self.col("subject_id"))),
            relations,
        ));
        self
    }

    pub fn where_(mut self, predicate: SqlExpr) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Joins another scan of the tuple view.
    pub fn join_tuples(mut self, alias: &str, on: Vec<SqlExpr>) -> Self {
        self.joins
            .push(JoinClause::inner(TableExpr::table(TUPLE_VIEW, alias), on));
        self
    }

    /// Joins an inline values table.
    pub fn join_values(mut self, values: ValuesTable, on: Vec<SqlExpr>) -> Self {
        self.joins
            .push(JoinClause::inner(TableExpr::Values(values), on));
        self
    }

    pub fn join(mut self, join: JoinClause) -> Self {
        self.joins.push(join);
        self
    }

    pub fn select_col(mut self, column: &str) -> Self {
        self.columns.push(SelectItem::expr(self.col(column)));
        self
    }

    pub fn select_expr(mut self, expr: SqlExpr) -> Self {
        self.columns.push(SelectItem::expr(expr));
        self
    }

    pub fn select_aliased(mut self, expr: SqlExpr, alias: &str) -> Self {
        self.columns.push(SelectItem::aliased(expr, alias));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Freezes the builder into a statement.
    pub fn build(self) -> SelectStmt {
        let mut columns = self.columns;
        if columns.is_empty() {
            columns.push(SelectItem::expr(SqlExpr::Int(1)));
        }
        SelectStmt {
            distinct: self.distinct,
            columns,
            from: Some(TableExpr::table(TUPLE_VIEW, &self.alias)),
            joins: self.joins,
            where_: self.predicates,
        }
    }

    pub fn sql(self) -> String {
        self.build().sql()
    }

    pub fn exists(self) -> SqlExpr {
        SqlExpr::Exists(Box::new(Query::from(self.build())))
    }

    pub fn not_exists(self) -> SqlExpr {
        SqlExpr::NotExists(Box::new(Query::from(self.build())))
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn test_direct_scan() {
        let sql = TupleQuery::scan("t")
            .select_col("object_id")
            .distinct()
            .object_type("doc")
            .relations(&["viewer".to_string(), "editor".to_string()])
            .where_subject(&SubjectRef::params(), None)
            .sql();
        assert_snapshot!(sql, @"SELECT DISTINCT t.object_id FROM melange_tuples AS t WHERE t.object_type = 'doc' AND t.relation IN ('viewer', 'editor') AND t.subject_type = p_subject_type AND position('#' in t.subject_id) = 0 AND t.subject_id = p_subject_id");
    }

    #[test]
    fn test_exists_with_wildcard_arm() {
        let predicate = TupleQuery::scan("t")
            .object_type("doc")
            .relations(&["owner".to_string()])
            .where_object_id(SqlExpr::param("p_object_id"))
            .where_subject(&SubjectRef::params(), Some(SqlExpr::param("p_allow_wildcard")))
            .exists();
        assert_snapshot!(predicate.sql(), @"EXISTS (SELECT 1 FROM melange_tuples AS t WHERE t.object_type = 'doc' AND t.relation = 'owner' AND t.object_id = p_object_id AND t.subject_type = p_subject_type AND position('#' in t.subject_id) = 0 AND (t.subject_id = p_subject_id OR (p_allow_wildcard AND t.subject_id = '*')))");
    }

    #[test]
    fn test_userset_scan() {
        let sql = TupleQuery::scan("t")
            .select_expr(SqlExpr::UsersetObjectId(Box::new(SqlExpr::col(
                "t",
                "subject_id",
            ))))
            .object_type("doc")
            .relations(&["viewer".to_string()])
            .where_has_userset()
            .where_userset_relation(&["member".to_string()])
            .sql();
        assert_snapshot!(sql, @"SELECT split_part(t.subject_id, '#', 1) FROM melange_tuples AS t WHERE t.object_type = 'doc' AND t.relation = 'viewer' AND position('#' in t.subject_id) > 0 AND split_part(t.subject_id, '#', 2) = 'member'");
    }

    #[test]
    fn test_builder_output_is_parseable_sql() {
        use sqlparser::dialect::PostgreSqlDialect;
        use sqlparser::parser::Parser;

        let sql = TupleQuery::scan("t")
            .select_col("object_id")
            .distinct()
            .object_type("doc")
            .relations(&["viewer".to_string(), "editor".to_string()])
            .where_subject(&SubjectRef::params(), Some(SqlExpr::param("p_allow_wildcard")))
            .sql();
        Parser::parse_sql(&PostgreSqlDialect {}, &sql).unwrap();

        let sql = TupleQuery::scan("t")
            .select_expr(SqlExpr::UsersetObjectId(Box::new(SqlExpr::col(
                "t",
                "subject_id",
            ))))
            .object_type("doc")
            .where_has_userset()
            .where_userset_relation(&["member".to_string()])
            .sql();
        Parser::parse_sql(&PostgreSqlDialect {}, &sql).unwrap();
    }

    #[test]
    fn test_join_tuples() {
        let sql = TupleQuery::scan("t")
            .object_type("doc")
            .join_tuples(
                "m",
                vec![SqlExpr::eq(
                    SqlExpr::col("m", "object_id"),
                    SqlExpr::UsersetObjectId(Box::new(SqlExpr::col("t", "subject_id"))),
                )],
            )
            .sql();
        assert_snapshot!(sql, @"SELECT 1 FROM melange_tuples AS t INNER JOIN melange_tuples AS m ON m.object_id = split_part(t.subject_id, '#', 1) WHERE t.object_type = 'doc'");
    }
}
