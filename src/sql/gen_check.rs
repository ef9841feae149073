//! Check templates.
//!
//! One `check_permission_<type>_<relation>` routine per pair, returning
//! 1/0. Recursion goes through `check_permission_internal` with a visited
//! array, so every shape except intersections and exclusions collapses into
//! the general grant-predicate form.

use super::ast::{Expect, SqlExpr, SubjectRef};
use super::gen_common::{
    self, delegated_check, exclusion_predicates, granted_scan, group_predicate,
    self_candidate_predicate, ttu_exists, userset_delegated_scan, userset_member_join, Ctx,
};
use super::names;
use super::plpgsql::{Param, PlStatement, PlpgsqlFunction};
use super::router::Template;

const ALLOW_PARAM: &str = "p_allow_wildcard";

pub(super) fn generate(ctx: &Ctx, template: Template) -> PlpgsqlFunction {
    let name = names::check_routine(ctx.object_type(), ctx.relation());
    let comment = format!(
        "{}#{} check ({} template)",
        ctx.object_type(),
        ctx.relation(),
        template
    );

    let function = PlpgsqlFunction::new(&name, "INT")
        .param(Param::new("p_subject_type", "TEXT"))
        .param(Param::new("p_subject_id", "TEXT"))
        .param(Param::new("p_object_id", "TEXT"))
        .param(Param::with_default("p_visited", "TEXT[]", "ARRAY[]::TEXT[]"))
        .param(Param::with_default(ALLOW_PARAM, "BOOLEAN", "TRUE"))
        .comment(&comment);

    if template == Template::DepthExceeded {
        return function.statement(PlStatement::raise_too_complex());
    }

    let function = function
        .declare("v_key", "TEXT", Some(ctx.visited_key_default()))
        .statement(PlStatement::If {
            condition: SqlExpr::AnyOf {
                needle: Box::new(SqlExpr::param("v_key")),
                array: Box::new(SqlExpr::param("p_visited")),
            },
            then: vec![PlStatement::Return(SqlExpr::Int(0))],
            otherwise: vec![],
        })
        .statement(PlStatement::If {
            condition: SqlExpr::Ge(
                Box::new(SqlExpr::func(
                    "coalesce",
                    vec![
                        SqlExpr::func(
                            "array_length",
                            vec![SqlExpr::param("p_visited"), SqlExpr::Int(1)],
                        ),
                        SqlExpr::Int(0),
                    ],
                )),
                Box::new(SqlExpr::Int(ctx.depth_ceiling as i64)),
            ),
            then: vec![PlStatement::raise_too_complex()],
            otherwise: vec![],
        });

    let mut grant = SqlExpr::or(grant_arms(ctx));
    let exclusions = exclusion_predicates(
        ctx,
        &SubjectRef::params(),
        SqlExpr::param("p_object_id"),
        ctx.visited_push(),
    );
    if !exclusions.is_empty() {
        let mut all = vec![grant];
        all.extend(exclusions);
        grant = SqlExpr::and(all);
    }

    function
        .statement(PlStatement::If {
            condition: grant,
            then: vec![PlStatement::Return(SqlExpr::Int(1))],
            otherwise: vec![],
        })
        .statement(PlStatement::Return(SqlExpr::Int(0)))
}

/// Every way this relation can be granted on `p_object_id`, as OR-arms.
fn grant_arms(ctx: &Ctx) -> Vec<SqlExpr> {
    let analysis = ctx.analysis;
    let subject = SubjectRef::params();
    let object_id = SqlExpr::param("p_object_id");
    let visited = ctx.visited_push();
    let mut arms = Vec::new();

    if !analysis.direct_subject_types.is_empty() || !analysis.wildcard_subject_types.is_empty() {
        arms.push(
            granted_scan(
                "t",
                ctx.object_type(),
                Some(object_id.clone()),
                &analysis.direct_relations,
                &subject,
                &analysis.wildcard_subject_types,
                Some(ALLOW_PARAM),
            )
            .exists(),
        );
    }

    if analysis.features.has_userset {
        arms.push(self_candidate_predicate(ctx, object_id.clone()));
        arms.push(gen_common::userset_subject_arm(ctx));
    }

    for relation in analysis
        .complex_relations
        .iter()
        .chain(&analysis.intersection_relations)
    {
        arms.push(delegated_check(
            ctx.object_type(),
            relation,
            &subject,
            object_id.clone(),
            visited.clone(),
            Expect::Allow,
        ));
    }

    for pattern in &analysis.userset_patterns {
        let arm = if pattern.is_complex {
            userset_delegated_scan(ctx, pattern, Some(object_id.clone()), &subject, visited.clone())
                .exists()
        } else {
            userset_member_join(ctx, pattern, Some(object_id.clone()), &subject, Some(ALLOW_PARAM))
                .exists()
        };
        arms.push(arm);
    }

    for parent in &analysis.parents {
        arms.push(ttu_exists(
            ctx,
            parent,
            &subject,
            object_id.clone(),
            visited.clone(),
        ));
    }

    for group in &analysis.groups {
        arms.push(group_predicate(
            ctx,
            group,
            &subject,
            object_id.clone(),
            visited.clone(),
            Some(ALLOW_PARAM),
        ));
    }

    if arms.is_empty() {
        // nothing can ever grant this relation
        arms.push(SqlExpr::Bool(false));
    }
    arms
}
