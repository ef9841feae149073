//! Top-level dispatchers.
//!
//! Two list dispatchers and three check entry points route `(type,
//! relation)` pairs to their specialised routines. Unknown pairs return an
//! empty result (or 0), never an error: models evolve independently of
//! clients.

use super::ast::SqlExpr;
use super::dialect::DialectHandler;
use super::names;
use super::plpgsql::{Param, PlStatement, PlpgsqlFunction, SqlFunction};
use super::stmt::{FunctionTable, Query, SelectItem, SelectStmt, TableExpr};

/// The `(object_type, relation)` pairs routines were generated for, in
/// emission order.
pub(super) fn check_dispatcher(pairs: &[(String, String)]) -> PlpgsqlFunction {
    let mut function = PlpgsqlFunction::new(names::CHECK_DISPATCH, "INT")
        .param(Param::new("p_subject_type", "TEXT"))
        .param(Param::new("p_subject_id", "TEXT"))
        .param(Param::new("p_relation", "TEXT"))
        .param(Param::new("p_object_type", "TEXT"))
        .param(Param::new("p_object_id", "TEXT"))
        .param(Param::new("p_visited", "TEXT[]"))
        .param(Param::new("p_allow_wildcard", "BOOLEAN"))
        .comment("routes check calls to the specialised routines");

    for (object_type, relation) in pairs {
        function = function.statement(PlStatement::If {
            condition: pair_condition(object_type, relation),
            then: vec![PlStatement::Return(SqlExpr::func(
                &names::check_routine(object_type, relation),
                vec![
                    SqlExpr::param("p_subject_type"),
                    SqlExpr::param("p_subject_id"),
                    SqlExpr::param("p_object_id"),
                    SqlExpr::param("p_visited"),
                    SqlExpr::param("p_allow_wildcard"),
                ],
            ))],
            otherwise: vec![],
        });
    }

    // unknown pair: deny without error
    function.statement(PlStatement::Return(SqlExpr::Int(0)))
}

/// `check_permission`, `check_permission_no_wildcard` and
/// `check_permission_internal`, as thin single-expression routines over the
/// dispatcher.
pub(super) fn check_entry_points() -> Vec<SqlFunction> {
    let dispatch = |visited: SqlExpr, allow: SqlExpr| {
        SqlExpr::func(
            names::CHECK_DISPATCH,
            vec![
                SqlExpr::param("p_subject_type"),
                SqlExpr::param("p_subject_id"),
                SqlExpr::param("p_relation"),
                SqlExpr::param("p_object_type"),
                SqlExpr::param("p_object_id"),
                visited,
                allow,
            ],
        )
    };
    let base_params = |function: SqlFunction| {
        function
            .param(Param::new("p_subject_type", "TEXT"))
            .param(Param::new("p_subject_id", "TEXT"))
            .param(Param::new("p_relation", "TEXT"))
            .param(Param::new("p_object_type", "TEXT"))
            .param(Param::new("p_object_id", "TEXT"))
    };

    vec![
        base_params(SqlFunction::new(
            names::CHECK,
            "INT",
            dispatch(SqlExpr::EmptyTextArray, SqlExpr::Bool(true)),
        )),
        base_params(SqlFunction::new(
            names::CHECK_NO_WILDCARD,
            "INT",
            dispatch(SqlExpr::EmptyTextArray, SqlExpr::Bool(false)),
        )),
        base_params(SqlFunction::new(
            names::CHECK_INTERNAL,
            "INT",
            dispatch(SqlExpr::param("p_visited"), SqlExpr::Bool(true)),
        ))
        .param(Param::new("p_visited", "TEXT[]")),
    ]
}

pub(super) fn list_objects_dispatcher(pairs: &[(String, String)]) -> PlpgsqlFunction {
    let mut function = PlpgsqlFunction::new(
        names::LIST_OBJECTS_DISPATCH,
        "TABLE(object_id TEXT, next_cursor TEXT)",
    )
    .param(Param::new("p_subject_type", "TEXT"))
    .param(Param::new("p_subject_id", "TEXT"))
    .param(Param::new("p_relation", "TEXT"))
    .param(Param::new("p_object_type", "TEXT"))
    .param(Param::with_default("p_limit", "INT", "100"))
    .param(Param::with_default("p_after", "TEXT", "NULL"))
    .comment("routes list-objects calls; pagination is keyed on object_id");

    for (object_type, relation) in pairs {
        let page = paginated(
            &names::list_objects_routine(object_type, relation),
            vec![
                SqlExpr::param("p_subject_type"),
                SqlExpr::param("p_subject_id"),
            ],
            "object_id",
        );
        function = function.statement(PlStatement::If {
            condition: pair_condition(object_type, relation),
            then: vec![
                PlStatement::ReturnQuery(page),
                PlStatement::Raw("RETURN;".to_string()),
            ],
            otherwise: vec![],
        });
    }
    // unknown pair: empty result
    function.statement(PlStatement::Raw("RETURN;".to_string()))
}

pub(super) fn list_subjects_dispatcher(pairs: &[(String, String)]) -> PlpgsqlFunction {
    let mut function = PlpgsqlFunction::new(
        names::LIST_SUBJECTS_DISPATCH,
        "TABLE(subject_id TEXT, next_cursor TEXT)",
    )
    .param(Param::new("p_object_type", "TEXT"))
    .param(Param::new("p_object_id", "TEXT"))
    .param(Param::new("p_relation", "TEXT"))
    .param(Param::new("p_subject_type", "TEXT"))
    .param(Param::with_default("p_limit", "INT", "100"))
    .param(Param::with_default("p_after", "TEXT", "NULL"))
    .comment("routes list-subjects calls; pagination is keyed on subject_id");

    for (object_type, relation) in pairs {
        let page = paginated(
            &names::list_subjects_routine(object_type, relation),
            vec![
                SqlExpr::param("p_object_id"),
                SqlExpr::param("p_subject_type"),
            ],
            "subject_id",
        );
        function = function.statement(PlStatement::If {
            condition: pair_condition(object_type, relation),
            then: vec![
                PlStatement::ReturnQuery(page),
                PlStatement::Raw("RETURN;".to_string()),
            ],
            otherwise: vec![],
        });
    }
    // unknown pair: empty result
    function.statement(PlStatement::Raw("RETURN;".to_string()))
}

fn pair_condition(object_type: &str, relation: &str) -> SqlExpr {
    SqlExpr::and(vec![
        SqlExpr::eq(SqlExpr::param("p_object_type"), SqlExpr::str(object_type)),
        SqlExpr::eq(SqlExpr::param("p_relation"), SqlExpr::str(relation)),
    ])
}

/// Keyset pagination over a specialised routine: rows after the cursor,
/// ordered, limited; every row carries itself as the next cursor.
fn paginated(routine: &str, args: Vec<SqlExpr>, column: &str) -> Query {
    let id = SqlExpr::col("f", column);
    Query::from(
        SelectStmt::new()
            .column(SelectItem::expr(id.clone()))
            .column(SelectItem::expr(id.clone()))
            .from(TableExpr::Function(FunctionTable::new(
                routine,
                args,
                "f",
                &[column],
            )))
            .where_(SqlExpr::or(vec![
                SqlExpr::IsNull(Box::new(SqlExpr::param("p_after"))),
                SqlExpr::Gt(Box::new(id.clone()), Box::new(SqlExpr::param("p_after"))),
            ])),
    )
    .order_by(id)
    .limit(SqlExpr::param("p_limit"))
}

/// Renders every dispatcher in migration order.
pub(super) fn generate_all(
    pairs: &[(String, String)],
    dialect: &dyn DialectHandler,
) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let dispatcher = check_dispatcher(pairs);
    out.push((dispatcher.name().to_string(), dispatcher.sql(dialect)));
    for entry in check_entry_points() {
        out.push((entry.name().to_string(), entry.sql(dialect)));
    }
    let objects = list_objects_dispatcher(pairs);
    out.push((objects.name().to_string(), objects.sql(dialect)));
    let subjects = list_subjects_dispatcher(pairs);
    out.push((subjects.name().to_string(), subjects.sql(dialect)));
    out
}

#[cfg(test)]
mod tests {
    use super::super::dialect::Dialect;
    use super::*;

    fn pairs() -> Vec<(String, String)> {
        vec![
            ("doc".to_string(), "owner".to_string()),
            ("doc".to_string(), "viewer".to_string()),
        ]
    }

    #[test]
    fn test_check_dispatcher_branches_and_default() {
        let sql = check_dispatcher(&pairs()).sql(Dialect::Postgres.handler().as_ref());
        assert!(sql.contains("IF p_object_type = 'doc' AND p_relation = 'owner' THEN"));
        assert!(sql.contains(
            "RETURN check_permission_doc_owner(p_subject_type, p_subject_id, p_object_id, p_visited, p_allow_wildcard);"
        ));
        assert!(sql.contains("IF p_object_type = 'doc' AND p_relation = 'viewer' THEN"));
        // unknown pairs fall through to deny
        assert!(sql.contains("    RETURN 0;\n"));
    }

    #[test]
    fn test_entry_points_share_the_dispatcher() {
        let dialect = Dialect::Postgres.handler();
        let rendered: Vec<String> = check_entry_points()
            .iter()
            .map(|f| f.sql(dialect.as_ref()))
            .collect();
        assert!(rendered[0].contains("CREATE OR REPLACE FUNCTION check_permission("));
        assert!(rendered[0].contains("ARRAY[]::TEXT[], TRUE"));
        assert!(rendered[1].contains("CREATE OR REPLACE FUNCTION check_permission_no_wildcard("));
        assert!(rendered[1].contains("ARRAY[]::TEXT[], FALSE"));
        assert!(rendered[2].contains("CREATE OR REPLACE FUNCTION check_permission_internal("));
        assert!(rendered[2].contains("p_visited, TRUE"));
    }

    #[test]
    fn test_list_dispatcher_paginates() {
        let sql = list_objects_dispatcher(&pairs()).sql(Dialect::Postgres.handler().as_ref());
        assert!(sql.contains("RETURNS TABLE(object_id TEXT, next_cursor TEXT)"));
        assert!(sql.contains("FROM list_objects_doc_owner(p_subject_type, p_subject_id) AS f(object_id)"));
        assert!(sql.contains("p_after IS NULL OR f.object_id > p_after"));
        assert!(sql.contains("ORDER BY f.object_id LIMIT p_limit"));
    }

    #[test]
    fn test_subjects_dispatcher_passes_filter_through() {
        let sql = list_subjects_dispatcher(&pairs()).sql(Dialect::Postgres.handler().as_ref());
        assert!(sql.contains("FROM list_subjects_doc_owner(p_object_id, p_subject_type) AS f(subject_id)"));
    }
}
