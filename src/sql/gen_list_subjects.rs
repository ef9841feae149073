//! List-subjects templates.
//!
//! One `list_subjects_<type>_<relation>` routine per pair, returning every
//! subject of the requested type holding the relation on one object. The
//! subject-type parameter may carry a userset filter (`group#member`); the
//! routine then normalises results to the filter form and expands through
//! the inlined userset rules. Wildcard rows surface as the literal `*`;
//! when one exists, concrete rows are re-checked with the wildcard
//! suppressed so they are never materialised from it.

use super::ast::{CheckRoutine, Expect, SqlExpr, SubjectRef};
use super::gen_common::{
    excluded_predicate, exclusion_predicates, parent_data_for, Ctx, ObjectScope,
};
use super::inline::{member_closure_values, userset_values};
use super::names;
use super::plpgsql::{Param, PlStatement, PlpgsqlFunction};
use super::router::Template;
use super::stmt::{
    CteDef, FunctionTable, JoinClause, JoinKind, Query, SelectItem, SelectStmt, SetExpr, TableExpr,
};
use super::tuple_query::{TupleQuery, TUPLE_VIEW};

pub(super) fn generate(ctx: &Ctx, template: Template) -> PlpgsqlFunction {
    let name = names::list_subjects_routine(ctx.object_type(), ctx.relation());
    let comment = format!(
        "{}#{} list_subjects ({} template)",
        ctx.object_type(),
        ctx.relation(),
        template
    );
    let function = PlpgsqlFunction::new(&name, "TABLE(subject_id TEXT)")
        .param(Param::new("p_object_id", "TEXT"))
        .param(Param::new("p_subject_type", "TEXT"))
        .comment(&comment);

    if template == Template::DepthExceeded {
        return function.statement(PlStatement::raise_too_complex());
    }

    // Userset filter branch: `p_subject_type = 'group#member'`.
    let function = function.statement(PlStatement::If {
        condition: SqlExpr::HasUserset(Box::new(SqlExpr::param("p_subject_type"))),
        then: vec![
            PlStatement::ReturnQuery(userset_filter_query(ctx)),
            PlStatement::Raw("RETURN;".to_string()),
        ],
        otherwise: vec![],
    });

    match template {
        Template::Recursive => recursive(ctx, function),
        Template::SelfReferentialUserset => self_referential_userset(ctx, function),
        Template::Intersection => {
            let mut blocks = concrete_blocks(ctx, ObjectScope::Param, false);
            blocks.extend(group_sets(ctx));
            let query = assemble(ctx, blocks, ObjectScope::Param, needs_pool(ctx, false, false));
            function.statement(PlStatement::ReturnQuery(query))
        }
        _ => {
            let blocks = concrete_blocks(ctx, ObjectScope::Param, false);
            let query = assemble(ctx, blocks, ObjectScope::Param, needs_pool(ctx, false, false));
            function.statement(PlStatement::ReturnQuery(query))
        }
    }
}

/// Results for a `type#relation` filter, normalised to the filter form.
fn userset_filter_query(ctx: &Ctx) -> Query {
    let filter_type = SqlExpr::UsersetObjectId(Box::new(SqlExpr::param("p_subject_type")));
    let filter_relation = SqlExpr::UsersetRelation(Box::new(SqlExpr::param("p_subject_type")));

    let normalised = SqlExpr::Concat(vec![
        SqlExpr::UsersetObjectId(Box::new(SqlExpr::col("t", "subject_id"))),
        SqlExpr::str("#"),
        filter_relation.clone(),
    ]);

    let mut blocks = vec![SetExpr::Select(
        TupleQuery::scan("t")
            .select_expr(normalised)
            .object_type(ctx.object_type())
            .where_object_id(SqlExpr::param("p_object_id"))
            .where_has_userset()
            .join_values(
                userset_values("ur", &ctx.analysis.userset_rules),
                vec![
                    SqlExpr::eq(
                        SqlExpr::col("t", "relation"),
                        SqlExpr::col("ur", "tuple_relation"),
                    ),
                    SqlExpr::eq(
                        SqlExpr::col("t", "subject_type"),
                        SqlExpr::col("ur", "subject_type"),
                    ),
                    SqlExpr::eq(
                        SqlExpr::UsersetRelation(Box::new(SqlExpr::col("t", "subject_id"))),
                        SqlExpr::col("ur", "subject_relation_satisfying"),
                    ),
                ],
            )
            .where_(SqlExpr::eq(SqlExpr::col("ur", "subject_type"), filter_type))
            .where_(SqlExpr::eq(
                SqlExpr::col("ur", "subject_relation"),
                filter_relation,
            ))
            .build(),
    )];

    // delegated satisfying relations resolve the filter themselves
    for relation in ctx
        .analysis
        .complex_relations
        .iter()
        .chain(&ctx.analysis.intersection_relations)
    {
        blocks.push(delegate_block(ctx, relation, ObjectScope::Param));
    }

    distinct_wrap(SetExpr::union(blocks), Vec::new())
}

/// `SELECT DISTINCT r.subject_id FROM (...) AS r(subject_id) WHERE ...`
fn distinct_wrap(set: SetExpr, predicates: Vec<SqlExpr>) -> Query {
    let mut outer = SelectStmt::new()
        .distinct()
        .column(SelectItem::expr(SqlExpr::col("r", "subject_id")))
        .from(TableExpr::subquery(Query::new(set), "r", &["subject_id"]));
    for predicate in predicates {
        outer = outer.where_(predicate);
    }
    Query::from(outer)
}

/// Whether any expansion arm must fall back to the candidate pool: a
/// parent edge with no anchor routine, a same-type edge outside its CTE,
/// or a self-referential pattern outside its CTE.
fn needs_pool(ctx: &Ctx, ttu_handled: bool, patterns_handled: bool) -> bool {
    let parent_arm = ctx.analysis.parents.iter().any(|parent| {
        parent.allowed_linking_types.iter().any(|linking_type| {
            let self_arm = parent.self_referential && linking_type == ctx.object_type();
            if self_arm {
                !ttu_handled
            } else {
                !ctx.has_pair(linking_type, &parent.target)
            }
        })
    });
    let pattern_arm = !patterns_handled
        && ctx
            .analysis
            .userset_patterns
            .iter()
            .any(|p| p.is_self_referential(ctx.object_type(), ctx.relation()));
    parent_arm || pattern_arm
}

/// Grant blocks over concrete subjects, scoped to one object or to a CTE of
/// objects.
fn concrete_blocks(ctx: &Ctx, scope: ObjectScope, patterns_handled: bool) -> Vec<SetExpr> {
    let analysis = ctx.analysis;
    let mut blocks = Vec::new();

    if !analysis.direct_subject_types.is_empty() || !analysis.wildcard_subject_types.is_empty() {
        let mut scan = TupleQuery::scan("t")
            .select_col("subject_id")
            .distinct()
            .object_type(ctx.object_type())
            .where_(scope.predicate(SqlExpr::col("t", "object_id")))
            .relations(&analysis.direct_relations)
            .where_(SqlExpr::eq(
                SqlExpr::col("t", "subject_type"),
                SqlExpr::param("p_subject_type"),
            ))
            .where_no_userset();
        if analysis.wildcard_subject_types.is_empty() {
            scan = scan.where_(SqlExpr::ne(SqlExpr::col("t", "subject_id"), SqlExpr::str("*")));
        }
        blocks.push(SetExpr::Select(scan.build()));
    }

    for relation in analysis
        .complex_relations
        .iter()
        .chain(&analysis.intersection_relations)
    {
        blocks.push(delegate_block(ctx, relation, scope));
    }

    for pattern in &analysis.userset_patterns {
        if pattern.is_self_referential(ctx.object_type(), ctx.relation()) {
            if !patterns_handled {
                blocks.extend(pool_pattern_blocks(ctx, pattern, scope));
            }
            continue;
        }
        if pattern.is_complex {
            blocks.extend(lateral_pattern_blocks(ctx, pattern, scope));
        } else {
            blocks.push(member_join_block(ctx, pattern, scope));
        }
    }

    blocks
}

/// A delegated satisfying relation's own list routine.
fn delegate_block(ctx: &Ctx, relation: &str, scope: ObjectScope) -> SetExpr {
    let routine = names::list_subjects_routine(ctx.object_type(), relation);
    match scope {
        ObjectScope::Param => SetExpr::Select(
            SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::col("f", "subject_id")))
                .from(TableExpr::Function(FunctionTable::new(
                    &routine,
                    vec![SqlExpr::param("p_object_id"), SqlExpr::param("p_subject_type")],
                    "f",
                    &["subject_id"],
                ))),
        ),
        ObjectScope::Cte(cte) => SetExpr::Select(
            SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::col("f", "subject_id")))
                .from(TableExpr::table(cte, "scope"))
                .join(JoinClause::cross_lateral(TableExpr::Function(
                    FunctionTable::new(
                        &routine,
                        vec![
                            SqlExpr::col("scope", "object_id"),
                            SqlExpr::param("p_subject_type"),
                        ],
                        "f",
                        &["subject_id"],
                    ),
                ))),
        ),
    }
}

/// Simple userset pattern: expand members through the inlined closure.
fn member_join_block(
    ctx: &Ctx,
    pattern: &crate::semantic::UsersetPattern,
    scope: ObjectScope,
) -> SetExpr {
    let userset_object = SqlExpr::UsersetObjectId(Box::new(SqlExpr::col("t", "subject_id")));
    let mut member_on = vec![
        SqlExpr::eq(
            SqlExpr::col("m", "object_type"),
            SqlExpr::str(&pattern.subject_type),
        ),
        SqlExpr::eq(SqlExpr::col("m", "object_id"), userset_object),
        SqlExpr::eq(
            SqlExpr::col("m", "relation"),
            SqlExpr::col("c", "satisfying_relation"),
        ),
        SqlExpr::eq(
            SqlExpr::col("m", "subject_type"),
            SqlExpr::param("p_subject_type"),
        ),
        SqlExpr::NoUserset(Box::new(SqlExpr::col("m", "subject_id"))),
    ];
    if !pattern.has_wildcard {
        member_on.push(SqlExpr::ne(SqlExpr::col("m", "subject_id"), SqlExpr::str("*")));
    }

    SetExpr::Select(
        TupleQuery::scan("t")
            .select_expr(SqlExpr::col("m", "subject_id"))
            .distinct()
            .object_type(ctx.object_type())
            .where_(scope.predicate(SqlExpr::col("t", "object_id")))
            .relations(&pattern.source_relations)
            .where_(SqlExpr::eq(
                SqlExpr::col("t", "subject_type"),
                SqlExpr::str(&pattern.subject_type),
            ))
            .where_has_userset()
            .where_userset_relation(&pattern.satisfying_relations)
            .join_values(
                member_closure_values("c", &pattern.member_closure),
                vec![SqlExpr::eq(
                    SqlExpr::col("c", "relation"),
                    SqlExpr::UsersetRelation(Box::new(SqlExpr::col("t", "subject_id"))),
                )],
            )
            .join_tuples("m", member_on)
            .build(),
    )
}

/// Complex userset pattern: one lateral block per satisfying sub-relation,
/// calling its list routine for every userset tuple found.
fn lateral_pattern_blocks(
    ctx: &Ctx,
    pattern: &crate::semantic::UsersetPattern,
    scope: ObjectScope,
) -> Vec<SetExpr> {
    let mut blocks = Vec::new();
    for satisfying in &pattern.satisfying_relations {
        if !ctx.has_pair(&pattern.subject_type, satisfying) {
            continue;
        }
        blocks.push(SetExpr::Select(
            TupleQuery::scan("t")
                .select_expr(SqlExpr::col("f", "subject_id"))
                .object_type(ctx.object_type())
                .where_(scope.predicate(SqlExpr::col("t", "object_id")))
                .relations(&pattern.source_relations)
                .where_(SqlExpr::eq(
                    SqlExpr::col("t", "subject_type"),
                    SqlExpr::str(&pattern.subject_type),
                ))
                .where_has_userset()
                .where_userset_relation(std::slice::from_ref(satisfying))
                .join(JoinClause::cross_lateral(TableExpr::Function(
                    FunctionTable::new(
                        &names::list_subjects_routine(&pattern.subject_type, satisfying),
                        vec![
                            SqlExpr::UsersetObjectId(Box::new(SqlExpr::col("t", "subject_id"))),
                            SqlExpr::param("p_subject_type"),
                        ],
                        "f",
                        &["subject_id"],
                    ),
                )))
                .build(),
        ));
    }
    blocks
}

/// Self-referential pattern outside its CTE: candidates from the pool are
/// re-checked per userset tuple through the dispatcher, whose visited array
/// bounds the recursion.
fn pool_pattern_blocks(
    ctx: &Ctx,
    pattern: &crate::semantic::UsersetPattern,
    scope: ObjectScope,
) -> Vec<SetExpr> {
    let mut blocks = Vec::new();
    for satisfying in &pattern.satisfying_relations {
        let probe = TupleQuery::scan("t")
            .object_type(ctx.object_type())
            .where_(scope.predicate(SqlExpr::col("t", "object_id")))
            .relations(&pattern.source_relations)
            .where_(SqlExpr::eq(
                SqlExpr::col("t", "subject_type"),
                SqlExpr::str(&pattern.subject_type),
            ))
            .where_has_userset()
            .where_userset_relation(std::slice::from_ref(satisfying))
            .where_(SqlExpr::CheckPermission {
                routine: CheckRoutine::Internal {
                    visited: Box::new(SqlExpr::EmptyTextArray),
                },
                subject_type: Box::new(SqlExpr::param("p_subject_type")),
                subject_id: Box::new(SqlExpr::col("p", "subject_id")),
                relation: Box::new(SqlExpr::str(satisfying)),
                object_type: Box::new(SqlExpr::str(&pattern.subject_type)),
                object_id: Box::new(SqlExpr::UsersetObjectId(Box::new(SqlExpr::col(
                    "t",
                    "subject_id",
                )))),
                expect: Expect::Allow,
            });
        blocks.push(SetExpr::Select(
            SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::col("p", "subject_id")))
                .from(TableExpr::table("subject_pool", "p"))
                .where_(SqlExpr::Exists(Box::new(Query::from(probe.build())))),
        ));
    }
    blocks
}

/// Tuple-to-userset expansion blocks. Anchored edges call the target's list
/// routine laterally; unanchored edges cross the candidate pool with the
/// recursive check.
fn ttu_blocks(ctx: &Ctx, scope: ObjectScope, pool: bool, ttu_handled: bool) -> Vec<SetExpr> {
    let mut blocks = Vec::new();
    for parent in &ctx.analysis.parents {
        for linking_type in &parent.allowed_linking_types {
            let self_arm = parent.self_referential && linking_type == ctx.object_type();
            if self_arm && ttu_handled {
                // covered by the ancestors CTE
                continue;
            }
            if !pool && !self_arm && ctx.has_pair(linking_type, &parent.target) {
                blocks.push(SetExpr::Select(
                    TupleQuery::scan("l")
                        .select_expr(SqlExpr::col("f", "subject_id"))
                        .object_type(ctx.object_type())
                        .where_(scope.predicate(SqlExpr::col("l", "object_id")))
                        .relations(std::slice::from_ref(&parent.linking))
                        .where_(SqlExpr::eq(
                            SqlExpr::col("l", "subject_type"),
                            SqlExpr::str(linking_type),
                        ))
                        .where_no_userset()
                        .join(JoinClause::cross_lateral(TableExpr::Function(
                            FunctionTable::new(
                                &names::list_subjects_routine(linking_type, &parent.target),
                                vec![
                                    SqlExpr::col("l", "subject_id"),
                                    SqlExpr::param("p_subject_type"),
                                ],
                                "f",
                                &["subject_id"],
                            ),
                        )))
                        .build(),
                ));
            } else {
                // subject_pool is in scope whenever this arm is generated
                let subject = SubjectRef {
                    subject_type: SqlExpr::param("p_subject_type"),
                    subject_id: SqlExpr::col("p", "subject_id"),
                };
                let mut scan = TupleQuery::scan("l")
                    .object_type(ctx.object_type())
                    .where_(scope.predicate(SqlExpr::col("l", "object_id")))
                    .relations(std::slice::from_ref(&parent.linking))
                    .where_(SqlExpr::eq(
                        SqlExpr::col("l", "subject_type"),
                        SqlExpr::str(linking_type),
                    ))
                    .where_no_userset();
                scan = scan.where_(SqlExpr::CheckPermission {
                    routine: CheckRoutine::Internal {
                        visited: Box::new(SqlExpr::EmptyTextArray),
                    },
                    subject_type: Box::new(subject.subject_type.clone()),
                    subject_id: Box::new(subject.subject_id.clone()),
                    relation: Box::new(SqlExpr::str(&parent.target)),
                    object_type: Box::new(SqlExpr::col("l", "subject_type")),
                    object_id: Box::new(SqlExpr::col("l", "subject_id")),
                    expect: Expect::Allow,
                });
                blocks.push(SetExpr::Select(
                    SelectStmt::new()
                        .column(SelectItem::expr(SqlExpr::col("p", "subject_id")))
                        .from(TableExpr::table("subject_pool", "p"))
                        .where_(SqlExpr::Exists(Box::new(Query::from(scan.build())))),
                ));
            }
        }
    }
    blocks
}

/// The candidate pool: every concrete subject of the requested type.
fn subject_pool_cte() -> CteDef {
    CteDef::new(
        "subject_pool",
        &["subject_id"],
        SetExpr::Select(
            TupleQuery::scan("s")
                .select_col("subject_id")
                .distinct()
                .where_(SqlExpr::eq(
                    SqlExpr::col("s", "subject_type"),
                    SqlExpr::param("p_subject_type"),
                ))
                .where_no_userset()
                .where_(SqlExpr::ne(SqlExpr::col("s", "subject_id"), SqlExpr::str("*")))
                .build(),
        ),
    )
}

/// Assembles the concrete branch: base blocks + expansion blocks, the
/// DISTINCT wrapper with exclusions, and the wildcard re-check.
fn assemble(ctx: &Ctx, blocks: Vec<SetExpr>, scope: ObjectScope, pool: bool) -> Query {
    let mut ctes = Vec::new();
    let mut operands = blocks;
    if operands.is_empty() {
        operands.push(SetExpr::Select(
            SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::Null))
                .where_(SqlExpr::Bool(false)),
        ));
    }

    if pool {
        ctes.push(subject_pool_cte());
    }
    if ctx.analysis.features.has_parent {
        ctes.push(CteDef::new(
            "base_results",
            &["subject_id"],
            SetExpr::union(operands),
        ));
        let mut expansion = vec![SetExpr::Select(
            SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::col("b", "subject_id")))
                .from(TableExpr::table("base_results", "b")),
        )];
        expansion.extend(ttu_blocks(ctx, scope, pool, false));
        operands = expansion;
    }

    let exclusions = exclusion_predicates(
        ctx,
        &SubjectRef {
            subject_type: SqlExpr::param("p_subject_type"),
            subject_id: SqlExpr::col("r", "subject_id"),
        },
        SqlExpr::param("p_object_id"),
        SqlExpr::EmptyTextArray,
    );
    let wrapped = distinct_wrap(SetExpr::union(operands), exclusions);

    let mut query = wrapped;
    for cte in ctes.into_iter().rev() {
        query.ctes.insert(0, cte);
    }

    if ctx.analysis.features.has_wildcard {
        query = wildcard_recheck(ctx, query)
    }
    query
}

/// Concrete rows are never materialised from a wildcard: when a `*` row is
/// present, every other row must pass the wildcard-suppressed check.
fn wildcard_recheck(ctx: &Ctx, inner: Query) -> Query {
    let mut ctes = inner.ctes;
    let recursive = inner.recursive;
    ctes.push(CteDef::new("results", &["subject_id"], inner.body));
    ctes.push(CteDef::new(
        "has_wild",
        &["flag"],
        SetExpr::Select(
            SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::func(
                    "coalesce",
                    vec![
                        SqlExpr::func(
                            "bool_or",
                            vec![SqlExpr::eq(
                                SqlExpr::col("x", "subject_id"),
                                SqlExpr::str("*"),
                            )],
                        ),
                        SqlExpr::Bool(false),
                    ],
                )))
                .from(TableExpr::table("results", "x")),
        ),
    ));

    let outer = SelectStmt::new()
        .distinct()
        .column(SelectItem::expr(SqlExpr::col("r", "subject_id")))
        .from(TableExpr::table("results", "r"))
        .join(JoinClause {
            kind: JoinKind::Cross,
            table: TableExpr::table("has_wild", "w"),
            on: vec![],
        })
        .where_(SqlExpr::or(vec![
            SqlExpr::not(SqlExpr::col("w", "flag")),
            SqlExpr::eq(SqlExpr::col("r", "subject_id"), SqlExpr::str("*")),
            SqlExpr::CheckPermission {
                routine: CheckRoutine::NoWildcard,
                subject_type: Box::new(SqlExpr::param("p_subject_type")),
                subject_id: Box::new(SqlExpr::col("r", "subject_id")),
                relation: Box::new(SqlExpr::str(ctx.relation())),
                object_type: Box::new(SqlExpr::str(ctx.object_type())),
                object_id: Box::new(SqlExpr::param("p_object_id")),
                expect: Expect::Allow,
            },
        ]));

    let mut query = Query::from(outer);
    query.ctes = ctes;
    query.recursive = recursive;
    query
}

/// Intersection groups over subject candidates.
fn group_sets(ctx: &Ctx) -> Vec<SetExpr> {
    let mut sets = Vec::new();
    for group in &ctx.analysis.groups {
        let mut parts = Vec::new();
        for part in &group.relations {
            parts.push(part_candidates(ctx, part));
        }
        for parent in &group.parent_relations {
            let data = parent_data_for(ctx, &parent.target, &parent.linking);
            let mut blocks = Vec::new();
            for linking_type in &data.allowed_linking_types {
                if ctx.has_pair(linking_type, &data.target) {
                    blocks.push(SetExpr::Select(
                        TupleQuery::scan("l")
                            .select_expr(SqlExpr::col("f", "subject_id"))
                            .object_type(ctx.object_type())
                            .where_object_id(SqlExpr::param("p_object_id"))
                            .relations(std::slice::from_ref(&data.linking))
                            .where_(SqlExpr::eq(
                                SqlExpr::col("l", "subject_type"),
                                SqlExpr::str(linking_type),
                            ))
                            .where_no_userset()
                            .join(JoinClause::cross_lateral(TableExpr::Function(
                                FunctionTable::new(
                                    &names::list_subjects_routine(linking_type, &data.target),
                                    vec![
                                        SqlExpr::col("l", "subject_id"),
                                        SqlExpr::param("p_subject_type"),
                                    ],
                                    "f",
                                    &["subject_id"],
                                ),
                            )))
                            .build(),
                    ));
                }
            }
            if blocks.is_empty() {
                blocks.push(SetExpr::Select(
                    SelectStmt::new()
                        .column(SelectItem::expr(SqlExpr::Null))
                        .where_(SqlExpr::Bool(false)),
                ));
            }
            parts.push(SetExpr::union(blocks));
        }

        let mut set = SetExpr::intersect(parts);
        if !group.exclusions.is_empty() {
            let mut outer = SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::col("gx", "subject_id")))
                .from(TableExpr::subquery(Query::new(set), "gx", &["subject_id"]));
            for excluded in group.exclusions.values().flatten() {
                outer = outer.where_(excluded_predicate(
                    ctx,
                    excluded,
                    &SubjectRef {
                        subject_type: SqlExpr::param("p_subject_type"),
                        subject_id: SqlExpr::col("gx", "subject_id"),
                    },
                    SqlExpr::param("p_object_id"),
                    SqlExpr::EmptyTextArray,
                ));
            }
            set = outer.into();
        }
        sets.push(set);
    }
    sets
}

/// Candidate subjects for one intersection part.
fn part_candidates(ctx: &Ctx, part: &str) -> SetExpr {
    let scan = |relations: &[String], wildcard_types: &[String]| {
        let mut query = TupleQuery::scan("t")
            .select_col("subject_id")
            .object_type(ctx.object_type())
            .where_object_id(SqlExpr::param("p_object_id"))
            .relations(relations)
            .where_(SqlExpr::eq(
                SqlExpr::col("t", "subject_type"),
                SqlExpr::param("p_subject_type"),
            ))
            .where_no_userset();
        if wildcard_types.is_empty() {
            query = query.where_(SqlExpr::ne(SqlExpr::col("t", "subject_id"), SqlExpr::str("*")));
        }
        SetExpr::Select(query.build())
    };

    if part == ctx.relation() {
        return scan(
            std::slice::from_ref(&ctx.analysis.relation),
            &ctx.analysis.own_wildcard_types,
        );
    }
    match ctx.analysis.referenced.get(part) {
        Some(reference) if !reference.needs_full_check => {
            scan(&reference.direct_relations, &reference.wildcard_subject_types)
        }
        _ => delegate_block(ctx, part, ObjectScope::Param),
    }
}

/// Same-type parent chains: walk ancestors upward, evaluate the base blocks
/// on every ancestor, re-check when exclusions could break the chain.
fn recursive(ctx: &Ctx, function: PlpgsqlFunction) -> PlpgsqlFunction {
    let linkings: Vec<String> = ctx
        .analysis
        .parents
        .iter()
        .filter(|p| p.self_referential)
        .map(|p| p.linking.clone())
        .collect();

    let link_join = |from_alias: &str| {
        vec![
            SqlExpr::eq(
                SqlExpr::col("l", "object_type"),
                SqlExpr::str(ctx.object_type()),
            ),
            SqlExpr::eq(
                SqlExpr::col("l", "object_id"),
                SqlExpr::col(from_alias, "object_id"),
            ),
            SqlExpr::in_strings(SqlExpr::col("l", "relation"), &linkings),
            SqlExpr::eq(
                SqlExpr::col("l", "subject_type"),
                SqlExpr::str(ctx.object_type()),
            ),
            SqlExpr::NoUserset(Box::new(SqlExpr::col("l", "subject_id"))),
        ]
    };

    let base = SelectStmt::new()
        .column(SelectItem::expr(SqlExpr::param("p_object_id")))
        .column(SelectItem::expr(SqlExpr::Int(0)));
    let step = SelectStmt::new()
        .column(SelectItem::expr(SqlExpr::col("l", "subject_id")))
        .column(SelectItem::expr(SqlExpr::Raw("a.depth + 1".to_string())))
        .from(TableExpr::table("ancestors", "a"))
        .join(JoinClause::inner(
            TableExpr::table(TUPLE_VIEW, "l"),
            link_join("a"),
        ))
        .where_(SqlExpr::Lt(
            Box::new(SqlExpr::col("a", "depth")),
            Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
        ));

    let scope = ObjectScope::Cte("ancestors");
    let pool = needs_pool(ctx, true, false);
    let mut blocks = concrete_blocks(ctx, scope, false);
    blocks.extend(ttu_blocks(ctx, scope, pool, true));
    // grants on any ancestor flow down the chain; re-check each subject at
    // the root when exclusions could have broken an intermediate link
    let mut predicates = Vec::new();
    if ctx.analysis.features.has_exclusion {
        predicates.push(SqlExpr::CheckPermission {
            routine: CheckRoutine::Internal {
                visited: Box::new(SqlExpr::EmptyTextArray),
            },
            subject_type: Box::new(SqlExpr::param("p_subject_type")),
            subject_id: Box::new(SqlExpr::col("r", "subject_id")),
            relation: Box::new(SqlExpr::str(ctx.relation())),
            object_type: Box::new(SqlExpr::str(ctx.object_type())),
            object_id: Box::new(SqlExpr::param("p_object_id")),
            expect: Expect::Allow,
        });
    }

    let mut query = distinct_wrap(SetExpr::union(blocks), predicates);
    if pool {
        query.ctes.insert(0, subject_pool_cte());
    }
    query.ctes.insert(
        0,
        CteDef::new(
            "ancestors",
            &["object_id", "depth"],
            SetExpr::union(vec![base.into(), step.into()]),
        ),
    );
    let query = query.recursive();

    // static probe over the linking graph, as in list_objects
    let probe_scan = |with_chain: bool| {
        let mut scan = TupleQuery::scan("l")
            .select_col("object_id")
            .object_type(ctx.object_type())
            .relations(&linkings)
            .where_(SqlExpr::eq(
                SqlExpr::col("l", "subject_type"),
                SqlExpr::str(ctx.object_type()),
            ))
            .where_no_userset();
        if with_chain {
            scan = scan.join(JoinClause::inner(
                TableExpr::table("link_chain", "c"),
                vec![SqlExpr::eq(
                    SqlExpr::col("l", "subject_id"),
                    SqlExpr::col("c", "object_id"),
                )],
            ));
        }
        scan
    };
    let probe = Query::new(
        SelectStmt::new()
            .column(SelectItem::expr(SqlExpr::func(
                "coalesce",
                vec![
                    SqlExpr::func("max", vec![SqlExpr::col("c", "depth")]),
                    SqlExpr::Int(0),
                ],
            )))
            .from(TableExpr::table("link_chain", "c"))
            .into(),
    )
    .recursive()
    .with(CteDef::new(
        "link_chain",
        &["object_id", "depth"],
        SetExpr::union(vec![
            probe_scan(false).select_expr(SqlExpr::Int(1)).build().into(),
            probe_scan(true)
                .select_expr(SqlExpr::Raw("c.depth + 1".to_string()))
                .where_(SqlExpr::Lt(
                    Box::new(SqlExpr::col("c", "depth")),
                    Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
                ))
                .build()
                .into(),
        ]),
    ));

    function
        .declare("v_depth", "INT", Some(SqlExpr::Int(0)))
        .statement(PlStatement::Assign {
            name: "v_depth".to_string(),
            value: SqlExpr::Subquery(Box::new(probe)),
        })
        .statement(PlStatement::If {
            condition: SqlExpr::Ge(
                Box::new(SqlExpr::param("v_depth")),
                Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
            ),
            then: vec![PlStatement::raise_too_complex()],
            otherwise: vec![],
        })
        .statement(PlStatement::ReturnQuery(query))
}

/// Self-referential userset: walk member groups downward, then collect
/// concrete members on every reached group.
fn self_referential_userset(ctx: &Ctx, function: PlpgsqlFunction) -> PlpgsqlFunction {
    let self_patterns: Vec<_> = ctx
        .analysis
        .userset_patterns
        .iter()
        .filter(|p| p.is_self_referential(ctx.object_type(), ctx.relation()))
        .collect();

    let base = SelectStmt::new()
        .column(SelectItem::expr(SqlExpr::param("p_object_id")))
        .column(SelectItem::expr(SqlExpr::Int(0)));

    let mut operands: Vec<SetExpr> = vec![base.into()];
    for pattern in &self_patterns {
        operands.push(
            TupleQuery::scan("t")
                .select_expr(SqlExpr::UsersetObjectId(Box::new(SqlExpr::col(
                    "t",
                    "subject_id",
                ))))
                .select_expr(SqlExpr::Raw("g.depth + 1".to_string()))
                .object_type(ctx.object_type())
                .relations(&pattern.source_relations)
                .where_(SqlExpr::eq(
                    SqlExpr::col("t", "subject_type"),
                    SqlExpr::str(ctx.object_type()),
                ))
                .where_has_userset()
                .where_userset_relation(&pattern.satisfying_relations)
                .join(JoinClause::inner(
                    TableExpr::table("member_groups", "g"),
                    vec![SqlExpr::eq(
                        SqlExpr::col("t", "object_id"),
                        SqlExpr::col("g", "object_id"),
                    )],
                ))
                .where_(SqlExpr::Lt(
                    Box::new(SqlExpr::col("g", "depth")),
                    Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
                ))
                .build()
                .into(),
        );
    }

    let scope = ObjectScope::Cte("member_groups");
    let pool = needs_pool(ctx, false, true);
    let mut blocks = concrete_blocks(ctx, scope, true);
    blocks.extend(ttu_blocks(ctx, scope, pool, false));

    let exclusions = exclusion_predicates(
        ctx,
        &SubjectRef {
            subject_type: SqlExpr::param("p_subject_type"),
            subject_id: SqlExpr::col("r", "subject_id"),
        },
        SqlExpr::param("p_object_id"),
        SqlExpr::EmptyTextArray,
    );

    let mut query = distinct_wrap(SetExpr::union(blocks), exclusions);
    if pool {
        query.ctes.insert(0, subject_pool_cte());
    }
    query.ctes.insert(
        0,
        CteDef::new(
            "member_groups",
            &["object_id", "depth"],
            SetExpr::union(operands),
        ),
    );
    let mut query = query.recursive();

    if ctx.analysis.features.has_wildcard {
        query = wildcard_recheck(ctx, query);
    }

    function.statement(PlStatement::ReturnQuery(query))
}
