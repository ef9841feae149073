//! List-objects templates.
//!
//! One `list_objects_<type>_<relation>` routine per pair, returning every
//! object the subject holds the relation on. Shapes that recurse do so with
//! a depth-guarded CTE; everything else is a union of grant blocks wrapped
//! in a DISTINCT projection that also applies exclusions.

use super::ast::{CheckRoutine, Expect, SqlExpr, SubjectRef};
use super::gen_common::{
    anchor_join_select, excluded_predicate, exclusion_predicates, function_table_select,
    granted_scan, parent_data_for, userset_delegated_scan, userset_member_join, Ctx,
};
use super::names;
use super::plpgsql::{Param, PlStatement, PlpgsqlFunction};
use super::router::Template;
use super::stmt::{CteDef, Query, SelectItem, SelectStmt, SetExpr, TableExpr};
use super::tuple_query::TupleQuery;

pub(super) fn generate(ctx: &Ctx, template: Template) -> PlpgsqlFunction {
    let name = names::list_objects_routine(ctx.object_type(), ctx.relation());
    let comment = format!(
        "{}#{} list_objects ({} template)",
        ctx.object_type(),
        ctx.relation(),
        template
    );
    let function = PlpgsqlFunction::new(&name, "TABLE(object_id TEXT)")
        .param(Param::new("p_subject_type", "TEXT"))
        .param(Param::new("p_subject_id", "TEXT"))
        .comment(&comment);

    match template {
        Template::DepthExceeded => function.statement(PlStatement::raise_too_complex()),
        Template::Recursive => recursive(ctx, function),
        Template::SelfReferentialUserset => self_referential_userset(ctx, function),
        Template::Intersection => {
            let mut blocks = base_blocks(ctx, false, false);
            blocks.extend(group_sets(ctx));
            function.statement(PlStatement::ReturnQuery(wrap_distinct(ctx, blocks, template)))
        }
        // direct, exclusion, userset and composed share the union shape;
        // they differ only in which blocks exist and whether exclusions
        // apply, both of which fall out of the analysis
        _ => {
            let blocks = base_blocks(ctx, false, false);
            function.statement(PlStatement::ReturnQuery(wrap_distinct(ctx, blocks, template)))
        }
    }
}

/// Wraps the union of blocks in `SELECT DISTINCT r.object_id`, appending
/// relation-level exclusions and, for composed shapes, the re-check filter.
fn wrap_distinct(ctx: &Ctx, blocks: Vec<SetExpr>, template: Template) -> Query {
    let blocks = non_empty(blocks);
    let mut outer = SelectStmt::new()
        .distinct()
        .column(SelectItem::expr(SqlExpr::col("r", "object_id")))
        .from(TableExpr::subquery(
            Query::new(SetExpr::union(blocks)),
            "r",
            &["object_id"],
        ));
    for predicate in exclusion_predicates(
        ctx,
        &SubjectRef::params(),
        SqlExpr::col("r", "object_id"),
        SqlExpr::EmptyTextArray,
    ) {
        outer = outer.where_(predicate);
    }
    if template == Template::Composed {
        outer = outer.where_(SqlExpr::CheckPermission {
            routine: CheckRoutine::Internal {
                visited: Box::new(SqlExpr::EmptyTextArray),
            },
            subject_type: Box::new(SqlExpr::param("p_subject_type")),
            subject_id: Box::new(SqlExpr::param("p_subject_id")),
            relation: Box::new(SqlExpr::str(ctx.relation())),
            object_type: Box::new(SqlExpr::str(ctx.object_type())),
            object_id: Box::new(SqlExpr::col("r", "object_id")),
            expect: Expect::Allow,
        });
    }
    Query::from(outer)
}

/// A union with no operands yields no rows.
fn non_empty(blocks: Vec<SetExpr>) -> Vec<SetExpr> {
    if blocks.is_empty() {
        vec![SetExpr::Select(
            SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::Null))
                .where_(SqlExpr::Bool(false)),
        )]
    } else {
        blocks
    }
}

/// Every non-recursive grant block, projecting object ids. The flags name
/// which recursion a surrounding CTE already handles: its arm is then
/// omitted here.
fn base_blocks(ctx: &Ctx, ttu_handled: bool, patterns_handled: bool) -> Vec<SetExpr> {
    let analysis = ctx.analysis;
    let subject = SubjectRef::params();
    let mut blocks = Vec::new();

    if !analysis.direct_subject_types.is_empty() || !analysis.wildcard_subject_types.is_empty() {
        blocks.push(SetExpr::Select(
            granted_scan(
                "t",
                ctx.object_type(),
                None,
                &analysis.direct_relations,
                &subject,
                &analysis.wildcard_subject_types,
                None,
            )
            .select_col("object_id")
            .distinct()
            .build(),
        ));
    }

    if analysis.features.has_userset {
        blocks.push(self_candidate_block(ctx));
    }

    for relation in analysis
        .complex_relations
        .iter()
        .chain(&analysis.intersection_relations)
    {
        blocks.push(SetExpr::Select(function_table_select(
            &names::list_objects_routine(ctx.object_type(), relation),
            vec![
                SqlExpr::param("p_subject_type"),
                SqlExpr::param("p_subject_id"),
            ],
            "object_id",
        )));
    }

    for pattern in &analysis.userset_patterns {
        let self_referential = pattern.is_self_referential(ctx.object_type(), ctx.relation());
        if self_referential && patterns_handled {
            // expanded by the recursive member CTE instead
            continue;
        }
        // a self-referential pattern outside its CTE delegates per tuple;
        // the visited array bounds the recursion
        let query = if pattern.is_complex || self_referential {
            userset_delegated_scan(ctx, pattern, None, &subject, SqlExpr::EmptyTextArray)
        } else {
            userset_member_join(ctx, pattern, None, &subject, None)
        };
        blocks.push(SetExpr::Select(query.select_col("object_id").distinct().build()));
    }

    for parent in &analysis.parents {
        for linking_type in &parent.allowed_linking_types {
            if ttu_handled && parent.self_referential && linking_type == ctx.object_type() {
                continue;
            }
            blocks.push(ttu_block(ctx, parent, linking_type));
        }
    }

    blocks
}

/// One tuple-to-userset block for one linking type: an anchor join when the
/// target routine exists, otherwise a per-tuple recursive check.
fn ttu_block(
    ctx: &Ctx,
    parent: &crate::semantic::ParentRelationData,
    linking_type: &str,
) -> SetExpr {
    // a routine must not anchor on itself; the per-tuple check recurses
    // through the dispatcher instead
    let self_anchor = linking_type == ctx.object_type() && parent.target == ctx.relation();
    if !self_anchor && ctx.has_pair(linking_type, &parent.target) {
        return SetExpr::Select(anchor_join_select(ctx, parent, linking_type));
    }
    SetExpr::Select(
        TupleQuery::scan("l")
            .select_col("object_id")
            .object_type(ctx.object_type())
            .relations(std::slice::from_ref(&parent.linking))
            .where_(SqlExpr::eq(
                SqlExpr::col("l", "subject_type"),
                SqlExpr::str(linking_type),
            ))
            .where_no_userset()
            .where_(SqlExpr::CheckPermission {
                routine: CheckRoutine::Internal {
                    visited: Box::new(SqlExpr::EmptyTextArray),
                },
                subject_type: Box::new(SqlExpr::param("p_subject_type")),
                subject_id: Box::new(SqlExpr::param("p_subject_id")),
                relation: Box::new(SqlExpr::str(&parent.target)),
                object_type: Box::new(SqlExpr::str(linking_type)),
                object_id: Box::new(SqlExpr::col("l", "subject_id")),
                expect: Expect::Allow,
            })
            .build(),
    )
}

/// The subject is a userset over this type: its own object qualifies.
fn self_candidate_block(ctx: &Ctx) -> SetExpr {
    let subject_id = SqlExpr::param("p_subject_id");
    SetExpr::Select(
        SelectStmt::new()
            .column(SelectItem::expr(SqlExpr::UsersetObjectId(Box::new(
                subject_id.clone(),
            ))))
            .where_(SqlExpr::eq(
                SqlExpr::param("p_subject_type"),
                SqlExpr::str(ctx.object_type()),
            ))
            .where_(SqlExpr::HasUserset(Box::new(subject_id.clone())))
            .where_(SqlExpr::in_strings(
                SqlExpr::UsersetRelation(Box::new(subject_id)),
                &ctx.analysis.satisfying_relations,
            )),
    )
}

/// Intersection groups: INTERSECT the per-part candidate sets, apply the
/// group's scoped exclusions, union the groups.
fn group_sets(ctx: &Ctx) -> Vec<SetExpr> {
    let subject = SubjectRef::params();
    let mut sets = Vec::new();
    for group in &ctx.analysis.groups {
        let mut parts = Vec::new();
        for part in &group.relations {
            parts.push(part_candidates(ctx, part));
        }
        for parent in &group.parent_relations {
            let data = parent_data_for(ctx, &parent.target, &parent.linking);
            let blocks: Vec<SetExpr> = data
                .allowed_linking_types
                .iter()
                .map(|linking_type| ttu_block(ctx, &data, linking_type))
                .collect();
            parts.push(SetExpr::union(non_empty(blocks)));
        }

        let mut set = SetExpr::intersect(parts);
        if !group.exclusions.is_empty() {
            let mut outer = SelectStmt::new()
                .column(SelectItem::expr(SqlExpr::col("gx", "object_id")))
                .from(TableExpr::subquery(Query::new(set), "gx", &["object_id"]));
            for excluded in group.exclusions.values().flatten() {
                outer = outer.where_(excluded_predicate(
                    ctx,
                    excluded,
                    &subject,
                    SqlExpr::col("gx", "object_id"),
                    SqlExpr::EmptyTextArray,
                ));
            }
            set = outer.into();
        }
        sets.push(set);
    }
    sets
}

/// Candidate objects for one intersection part.
fn part_candidates(ctx: &Ctx, part: &str) -> SetExpr {
    let subject = SubjectRef::params();
    if part == ctx.relation() {
        return SetExpr::Select(
            granted_scan(
                "t",
                ctx.object_type(),
                None,
                std::slice::from_ref(&ctx.analysis.relation),
                &subject,
                &ctx.analysis.own_wildcard_types,
                None,
            )
            .select_col("object_id")
            .build(),
        );
    }
    match ctx.analysis.referenced.get(part) {
        Some(reference) if !reference.needs_full_check => SetExpr::Select(
            granted_scan(
                "t",
                ctx.object_type(),
                None,
                &reference.direct_relations,
                &subject,
                &reference.wildcard_subject_types,
                None,
            )
            .select_col("object_id")
            .build(),
        ),
        _ => SetExpr::Select(function_table_select(
            &names::list_objects_routine(ctx.object_type(), part),
            vec![
                SqlExpr::param("p_subject_type"),
                SqlExpr::param("p_subject_id"),
            ],
            "object_id",
        )),
    }
}

/// Same-type parent chains: accessibility CTE over the linking relations,
/// seeded by the non-recursive blocks, stepped through linking tuples.
fn recursive(ctx: &Ctx, function: PlpgsqlFunction) -> PlpgsqlFunction {
    let linkings: Vec<String> = ctx
        .analysis
        .parents
        .iter()
        .filter(|p| p.self_referential)
        .map(|p| p.linking.clone())
        .collect();

    let link_scan = |alias: &str| {
        TupleQuery::scan(alias)
            .object_type(ctx.object_type())
            .relations(&linkings)
            .where_(SqlExpr::eq(
                SqlExpr::col(alias, "subject_type"),
                SqlExpr::str(ctx.object_type()),
            ))
            .where_no_userset()
    };

    // static probe: the longest linking chain bounds reachable depth
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
            link_scan("l")
                .select_col("object_id")
                .select_expr(SqlExpr::Int(1))
                .build()
                .into(),
            link_scan("l")
                .select_col("object_id")
                .select_expr(SqlExpr::Raw("c.depth + 1".to_string()))
                .join(super::stmt::JoinClause::inner(
                    TableExpr::table("link_chain", "c"),
                    vec![SqlExpr::eq(
                        SqlExpr::col("l", "subject_id"),
                        SqlExpr::col("c", "object_id"),
                    )],
                ))
                .where_(SqlExpr::Lt(
                    Box::new(SqlExpr::col("c", "depth")),
                    Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
                ))
                .build()
                .into(),
        ]),
    ));

    let base = Query::new(SetExpr::union(non_empty(base_blocks(ctx, true, false))));
    let base_wrapped = SelectStmt::new()
        .column(SelectItem::expr(SqlExpr::col("base", "object_id")))
        .column(SelectItem::expr(SqlExpr::Int(0)))
        .from(TableExpr::subquery(base, "base", &["object_id"]));

    let step = link_scan("l")
        .select_col("object_id")
        .select_expr(SqlExpr::Raw("a.depth + 1".to_string()))
        .join(super::stmt::JoinClause::inner(
            TableExpr::table("accessible", "a"),
            vec![SqlExpr::eq(
                SqlExpr::col("l", "subject_id"),
                SqlExpr::col("a", "object_id"),
            )],
        ))
        .where_(SqlExpr::Lt(
            Box::new(SqlExpr::col("a", "depth")),
            Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
        ))
        .build();

    let mut outer = SelectStmt::new()
        .distinct()
        .column(SelectItem::expr(SqlExpr::col("a", "object_id")))
        .from(TableExpr::table("accessible", "a"));
    for predicate in exclusion_predicates(
        ctx,
        &SubjectRef::params(),
        SqlExpr::col("a", "object_id"),
        SqlExpr::EmptyTextArray,
    ) {
        outer = outer.where_(predicate);
    }

    let main = Query::from(outer).recursive().with(CteDef::new(
        "accessible",
        &["object_id", "depth"],
        SetExpr::union(vec![base_wrapped.into(), step.into()]),
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
        .statement(PlStatement::ReturnQuery(main))
}

/// Userset pattern pointing back at this `(type, relation)`: walk the
/// userset links up to the ceiling.
fn self_referential_userset(ctx: &Ctx, function: PlpgsqlFunction) -> PlpgsqlFunction {
    let self_patterns: Vec<_> = ctx
        .analysis
        .userset_patterns
        .iter()
        .filter(|p| p.is_self_referential(ctx.object_type(), ctx.relation()))
        .collect();

    let base = Query::new(SetExpr::union(non_empty(base_blocks(ctx, false, true))));
    let base_wrapped = SelectStmt::new()
        .column(SelectItem::expr(SqlExpr::col("base", "object_id")))
        .column(SelectItem::expr(SqlExpr::Int(0)))
        .from(TableExpr::subquery(base, "base", &["object_id"]));

    let mut operands: Vec<SetExpr> = vec![base_wrapped.into()];
    for pattern in &self_patterns {
        operands.push(
            TupleQuery::scan("t")
                .select_col("object_id")
                .select_expr(SqlExpr::Raw("e.depth + 1".to_string()))
                .object_type(ctx.object_type())
                .relations(&pattern.source_relations)
                .where_(SqlExpr::eq(
                    SqlExpr::col("t", "subject_type"),
                    SqlExpr::str(ctx.object_type()),
                ))
                .where_has_userset()
                .where_userset_relation(&pattern.satisfying_relations)
                .join(super::stmt::JoinClause::inner(
                    TableExpr::table("member_expansion", "e"),
                    vec![SqlExpr::eq(
                        SqlExpr::UsersetObjectId(Box::new(SqlExpr::col("t", "subject_id"))),
                        SqlExpr::col("e", "object_id"),
                    )],
                ))
                .where_(SqlExpr::Lt(
                    Box::new(SqlExpr::col("e", "depth")),
                    Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
                ))
                .build()
                .into(),
        );
    }

    let mut outer = SelectStmt::new()
        .distinct()
        .column(SelectItem::expr(SqlExpr::col("e", "object_id")))
        .from(TableExpr::table("member_expansion", "e"));
    for predicate in exclusion_predicates(
        ctx,
        &SubjectRef::params(),
        SqlExpr::col("e", "object_id"),
        SqlExpr::EmptyTextArray,
    ) {
        outer = outer.where_(predicate);
    }

    let main = Query::from(outer).recursive().with(CteDef::new(
        "member_expansion",
        &["object_id", "depth"],
        SetExpr::union(operands),
    ));

    function.statement(PlStatement::ReturnQuery(main))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::super::dialect::Dialect;
    use super::super::router::{select_template, Operation};
    use super::*;
    use crate::model::schema::{
        IntersectionGroup, ObjectType, ParentRelationCheck, RelationDefinition, Schema,
    };
    use crate::model::SubjectTypeRef;
    use crate::semantic::{analyses_of_schema, RelationAnalysis};

    fn analyses(types: Vec<ObjectType>) -> Vec<RelationAnalysis> {
        analyses_of_schema(&Schema { types }).unwrap()
    }

    fn pair_set(all: &[RelationAnalysis]) -> BTreeSet<(String, String)> {
        all.iter()
            .map(|a| (a.object_type.clone(), a.relation.clone()))
            .collect()
    }

    fn render(all: &[RelationAnalysis], object_type: &str, relation: &str) -> String {
        let analysis = all
            .iter()
            .find(|a| a.object_type == object_type && a.relation == relation)
            .unwrap();
        let pairs = pair_set(all);
        let ctx = Ctx::new(analysis, 25, &pairs);
        let template = select_template(Operation::ListObjects, analysis, 25);
        generate(&ctx, template).sql(Dialect::Postgres.handler().as_ref())
    }

    #[test]
    fn test_direct_list_objects() {
        let all = analyses(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![RelationDefinition {
                subject_types: vec![SubjectTypeRef::plain("user")],
                ..RelationDefinition::named("owner")
            }],
        }]);
        let sql = render(&all, "doc", "owner");

        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION list_objects_doc_owner("));
        assert!(sql.contains(") RETURNS TABLE(object_id TEXT)"));
        assert!(sql.contains("SELECT DISTINCT r.object_id"));
        assert!(sql.contains("t.object_type = 'doc'"));
        assert!(sql.contains("t.relation = 'owner'"));
        assert!(!sql.contains("WITH RECURSIVE"));
    }

    #[test]
    fn test_recursive_list_objects_guards_depth() {
        let all = analyses(vec![ObjectType {
            name: "folder".to_string(),
            relations: vec![
                RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("folder")],
                    ..RelationDefinition::named("parent")
                },
                RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    parent_relations: vec![ParentRelationCheck::new("can_read", "parent")],
                    ..RelationDefinition::named("can_read")
                },
            ],
        }]);
        let sql = render(&all, "folder", "can_read");

        assert!(sql.contains("WITH RECURSIVE accessible(object_id, depth)"));
        assert!(sql.contains("a.depth < 25"));
        assert!(sql.contains("WITH RECURSIVE link_chain(object_id, depth)"));
        assert!(sql.contains("IF v_depth >= 25 THEN"));
        assert!(sql.contains("RAISE EXCEPTION 'resolution too complex' USING ERRCODE = 'M2002';"));
        // the step follows self-referential linking tuples
        assert!(sql.contains("l.relation = 'parent'"));
        assert!(sql.contains("l.subject_id = a.object_id"));
    }

    #[test]
    fn test_composed_uses_anchor_routine() {
        let all = analyses(vec![
            ObjectType {
                name: "repo".to_string(),
                relations: vec![
                    RelationDefinition {
                        subject_types: vec![SubjectTypeRef::plain("org")],
                        ..RelationDefinition::named("org")
                    },
                    RelationDefinition {
                        parent_relations: vec![ParentRelationCheck::new("viewer", "org")],
                        ..RelationDefinition::named("viewer")
                    },
                ],
            },
            ObjectType {
                name: "org".to_string(),
                relations: vec![RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("viewer")
                }],
            },
        ]);
        let sql = render(&all, "repo", "viewer");

        assert!(sql.contains("FROM list_objects_org_viewer(p_subject_type, p_subject_id) AS anchor(object_id)"));
        assert!(sql.contains("l.subject_id = anchor.object_id"));
        // composed re-checks through the dispatcher
        assert!(sql.contains(
            "check_permission_internal(p_subject_type, p_subject_id, 'viewer', 'repo', r.object_id, ARRAY[]::TEXT[]) = 1"
        ));
    }

    #[test]
    fn test_intersection_groups_intersect() {
        let all = analyses(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![
                RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("viewer")
                },
                RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("paid")
                },
                RelationDefinition {
                    intersection_groups: vec![IntersectionGroup {
                        relations: vec!["viewer".to_string(), "paid".to_string()],
                        ..Default::default()
                    }],
                    ..RelationDefinition::named("can_download")
                },
            ],
        }]);
        let sql = render(&all, "doc", "can_download");

        assert!(sql.contains("INTERSECT"));
        assert!(sql.contains("t.relation = 'viewer'"));
        assert!(sql.contains("t.relation = 'paid'"));
    }

    #[test]
    fn test_self_referential_userset_expansion() {
        let all = analyses(vec![ObjectType {
            name: "group".to_string(),
            relations: vec![RelationDefinition {
                subject_types: vec![
                    SubjectTypeRef::plain("user"),
                    SubjectTypeRef::userset("group", "member"),
                ],
                ..RelationDefinition::named("member")
            }],
        }]);
        let sql = render(&all, "group", "member");

        assert!(sql.contains("WITH RECURSIVE member_expansion(object_id, depth)"));
        assert!(sql.contains("e.depth < 25"));
        assert!(sql.contains("split_part(t.subject_id, '#', 1) = e.object_id"));
    }
}
