//! Blocks shared between the check and list templates.
//!
//! Each builder produces one grant (or denial) block from the analysis; the
//! templates differ mostly in what they project and how they combine the
//! blocks, so the block logic lives here once.

use std::collections::BTreeSet;

use super::ast::{CheckRoutine, Expect, SqlExpr, SubjectRef};
use super::inline::{member_closure_values, userset_values};
use super::names;
use super::stmt::{
    FunctionTable, JoinClause, Query, SelectItem, SelectStmt, TableExpr,
};
use super::tuple_query::TupleQuery;
use crate::model::schema::IntersectionGroup;
use crate::semantic::{ParentRelationData, RelationAnalysis, UsersetPattern};

/// How list blocks scope the tuple scan's object column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ObjectScope {
    /// A single object: `= p_object_id`.
    Param,
    /// Every object collected by the named CTE.
    Cte(&'static str),
}

impl ObjectScope {
    /// The predicate tying `column` to this scope.
    pub fn predicate(&self, column: SqlExpr) -> SqlExpr {
        match self {
            ObjectScope::Param => SqlExpr::eq(column, SqlExpr::param("p_object_id")),
            ObjectScope::Cte(name) => SqlExpr::InSubquery {
                expr: Box::new(column),
                query: Box::new(Query::from(
                    SelectStmt::new()
                        .column(SelectItem::expr(SqlExpr::col("scope", "object_id")))
                        .from(TableExpr::table(name, "scope")),
                )),
            },
        }
    }
}

/// Template-side view of one relation plus the compile options it needs.
pub(super) struct Ctx<'a> {
    pub analysis: &'a RelationAnalysis,
    pub depth_ceiling: usize,
    /// Every `(type, relation)` pair a routine is generated for; anchor
    /// joins may only name routines that will exist.
    pub pairs: &'a BTreeSet<(String, String)>,
}

impl<'a> Ctx<'a> {
    pub fn new(
        analysis: &'a RelationAnalysis,
        depth_ceiling: usize,
        pairs: &'a BTreeSet<(String, String)>,
    ) -> Self {
        Ctx {
            analysis,
            depth_ceiling,
            pairs,
        }
    }

    pub fn has_pair(&self, object_type: &str, relation: &str) -> bool {
        self.pairs
            .contains(&(object_type.to_string(), relation.to_string()))
    }

    pub fn object_type(&self) -> &str {
        &self.analysis.object_type
    }

    pub fn relation(&self) -> &str {
        &self.analysis.relation
    }

    /// `'type:' || p_object_id || '#relation'`, the recursion-tracking key.
    pub fn visited_key_default(&self) -> SqlExpr {
        SqlExpr::Concat(vec![
            SqlExpr::str(&format!("{}:", self.object_type())),
            SqlExpr::param("p_object_id"),
            SqlExpr::str(&format!("#{}", self.relation())),
        ])
    }

    /// `p_visited || v_key`
    pub fn visited_push(&self) -> SqlExpr {
        SqlExpr::Concat(vec![SqlExpr::param("p_visited"), SqlExpr::param("v_key")])
    }
}

/// The wildcard arm of a subject match: `None` when no type admits `*`.
/// `allow_param` adds the run-time suppression gate used by check routines.
pub(super) fn wildcard_gate(
    alias: &str,
    wildcard_types: &[String],
    allow_param: Option<&str>,
) -> Option<SqlExpr> {
    if wildcard_types.is_empty() {
        return None;
    }
    let types = SqlExpr::in_strings(SqlExpr::col(alias, "subject_type"), wildcard_types);
    Some(match allow_param {
        Some(param) => SqlExpr::and(vec![SqlExpr::param(param), types]),
        None => types,
    })
}

/// A scan of the tuple view for tuples granting any of `relations` to the
/// subject, on one object.
pub(super) fn granted_scan(
    alias: &str,
    object_type: &str,
    object_id: Option<SqlExpr>,
    relations: &[String],
    subject: &SubjectRef,
    wildcard_types: &[String],
    allow_param: Option<&str>,
) -> TupleQuery {
    let gate = wildcard_gate(alias, wildcard_types, allow_param);
    let mut query = TupleQuery::scan(alias)
        .object_type(object_type)
        .relations(relations);
    if let Some(object_id) = object_id {
        query = query.where_object_id(object_id);
    }
    query.where_subject(subject, gate)
}

/// A recursive-check call against a sibling relation on the same object.
pub(super) fn delegated_check(
    object_type: &str,
    relation: &str,
    subject: &SubjectRef,
    object_id: SqlExpr,
    visited: SqlExpr,
    expect: Expect,
) -> SqlExpr {
    SqlExpr::CheckPermission {
        routine: CheckRoutine::Internal {
            visited: Box::new(visited),
        },
        subject_type: Box::new(subject.subject_type.clone()),
        subject_id: Box::new(subject.subject_id.clone()),
        relation: Box::new(SqlExpr::str(relation)),
        object_type: Box::new(SqlExpr::str(object_type)),
        object_id: Box::new(object_id),
        expect,
    }
}

/// Tuple-to-userset existence: a linking tuple whose parent object grants
/// the target relation to the subject.
pub(super) fn ttu_exists(
    ctx: &Ctx,
    parent: &ParentRelationData,
    subject: &SubjectRef,
    object_id: SqlExpr,
    visited: SqlExpr,
) -> SqlExpr {
    TupleQuery::scan("l")
        .object_type(ctx.object_type())
        .relations(std::slice::from_ref(&parent.linking))
        .where_object_id(object_id)
        .where_no_userset()
        .where_(SqlExpr::in_strings(
            SqlExpr::col("l", "subject_type"),
            &parent.allowed_linking_types,
        ))
        .where_(SqlExpr::CheckPermission {
            routine: CheckRoutine::Internal {
                visited: Box::new(visited),
            },
            subject_type: Box::new(subject.subject_type.clone()),
            subject_id: Box::new(subject.subject_id.clone()),
            relation: Box::new(SqlExpr::str(&parent.target)),
            object_type: Box::new(SqlExpr::col("l", "subject_type")),
            object_id: Box::new(SqlExpr::col("l", "subject_id")),
            expect: Expect::Allow,
        })
        .exists()
}

/// The subject itself is a userset over this object: `doc:1#editor` holds
/// `viewer` on `doc:1` whenever `editor` satisfies `viewer`.
pub(super) fn self_candidate_predicate(ctx: &Ctx, object_id: SqlExpr) -> SqlExpr {
    let subject_id = SqlExpr::param("p_subject_id");
    SqlExpr::and(vec![
        SqlExpr::eq(
            SqlExpr::param("p_subject_type"),
            SqlExpr::str(ctx.object_type()),
        ),
        SqlExpr::HasUserset(Box::new(subject_id.clone())),
        SqlExpr::eq(SqlExpr::UsersetObjectId(Box::new(subject_id.clone())), object_id),
        SqlExpr::in_strings(
            SqlExpr::UsersetRelation(Box::new(subject_id)),
            &ctx.analysis.satisfying_relations,
        ),
    ])
}

/// The querying subject is itself a userset string (`g#member`): a tuple
/// whose userset subject names the same object and a sub-relation that
/// satisfies the queried one grants directly. Routed by the inlined rules.
pub(super) fn userset_subject_arm(ctx: &Ctx) -> SqlExpr {
    let tuple_subject = SqlExpr::col("t", "subject_id");
    let param_subject = SqlExpr::param("p_subject_id");
    SqlExpr::and(vec![
        SqlExpr::HasUserset(Box::new(param_subject.clone())),
        TupleQuery::scan("t")
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
                        SqlExpr::UsersetRelation(Box::new(tuple_subject.clone())),
                        SqlExpr::col("ur", "subject_relation_satisfying"),
                    ),
                ],
            )
            .where_(SqlExpr::eq(
                SqlExpr::col("ur", "subject_type"),
                SqlExpr::param("p_subject_type"),
            ))
            .where_(SqlExpr::eq(
                SqlExpr::col("ur", "subject_relation"),
                SqlExpr::UsersetRelation(Box::new(param_subject.clone())),
            ))
            .where_(SqlExpr::eq(
                SqlExpr::UsersetObjectId(Box::new(tuple_subject)),
                SqlExpr::UsersetObjectId(Box::new(param_subject)),
            ))
            .exists(),
    ])
}

/// Base scan of a userset pattern: tuples on the object whose subject is a
/// userset accepted by the pattern. Shared by check and both list shapes.
fn userset_tuple_scan(
    ctx: &Ctx,
    pattern: &UsersetPattern,
    object_id: Option<SqlExpr>,
) -> TupleQuery {
    let mut query = TupleQuery::scan("t")
        .object_type(ctx.object_type())
        .relations(&pattern.source_relations);
    if let Some(object_id) = object_id {
        query = query.where_object_id(object_id);
    }
    query
        .where_(SqlExpr::eq(
            SqlExpr::col("t", "subject_type"),
            SqlExpr::str(&pattern.subject_type),
        ))
        .where_has_userset()
        .where_userset_relation(&pattern.satisfying_relations)
}

/// Membership join for a simple pattern: the tuple's sub-relation expands
/// through the inlined closure into a direct membership scan.
pub(super) fn userset_member_join(
    ctx: &Ctx,
    pattern: &UsersetPattern,
    object_id: Option<SqlExpr>,
    subject: &SubjectRef,
    allow_param: Option<&str>,
) -> TupleQuery {
    let userset_object = SqlExpr::UsersetObjectId(Box::new(SqlExpr::col("t", "subject_id")));
    let gate = if pattern.has_wildcard {
        Some(
            allow_param
                .map(SqlExpr::param)
                .unwrap_or(SqlExpr::Bool(true)),
        )
    } else {
        None
    };
    let member_on = vec![
        SqlExpr::eq(
            SqlExpr::col("m", "object_type"),
            SqlExpr::str(&pattern.subject_type),
        ),
        SqlExpr::eq(SqlExpr::col("m", "object_id"), userset_object),
        SqlExpr::eq(
            SqlExpr::col("m", "relation"),
            SqlExpr::col("c", "satisfying_relation"),
        ),
        SqlExpr::eq(SqlExpr::col("m", "subject_type"), subject.subject_type.clone()),
        SqlExpr::NoUserset(Box::new(SqlExpr::col("m", "subject_id"))),
        SqlExpr::SubjectIdMatch {
            column: Box::new(SqlExpr::col("m", "subject_id")),
            value: Box::new(subject.subject_id.clone()),
            wildcard_gate: gate.map(Box::new),
        },
    ];

    userset_tuple_scan(ctx, pattern, object_id)
        .join_values(
            member_closure_values("c", &pattern.member_closure),
            vec![SqlExpr::eq(
                SqlExpr::col("c", "relation"),
                SqlExpr::UsersetRelation(Box::new(SqlExpr::col("t", "subject_id"))),
            )],
        )
        .join_tuples("m", member_on)
}

/// Complex pattern: membership delegates to the recursive check, routed by
/// the inlined userset rules.
pub(super) fn userset_delegated_scan(
    ctx: &Ctx,
    pattern: &UsersetPattern,
    object_id: Option<SqlExpr>,
    subject: &SubjectRef,
    visited: SqlExpr,
) -> TupleQuery {
    let rules: Vec<_> = ctx
        .analysis
        .userset_rules
        .iter()
        .filter(|rule| {
            rule.subject_type == pattern.subject_type
                && rule.subject_relation == pattern.subject_relation
        })
        .cloned()
        .collect();

    let mut query = TupleQuery::scan("t")
        .object_type(ctx.object_type())
        .where_has_userset();
    if let Some(object_id) = object_id {
        query = query.where_object_id(object_id);
    }
    query
        .join_values(
            userset_values("ur", &rules),
            vec![
                SqlExpr::eq(SqlExpr::col("t", "relation"), SqlExpr::col("ur", "tuple_relation")),
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
        .where_(SqlExpr::CheckPermission {
            routine: CheckRoutine::Internal {
                visited: Box::new(visited),
            },
            subject_type: Box::new(subject.subject_type.clone()),
            subject_id: Box::new(subject.subject_id.clone()),
            relation: Box::new(SqlExpr::col("ur", "subject_relation_satisfying")),
            object_type: Box::new(SqlExpr::col("ur", "subject_type")),
            object_id: Box::new(SqlExpr::UsersetObjectId(Box::new(SqlExpr::col(
                "t",
                "subject_id",
            )))),
            expect: Expect::Allow,
        })
}

/// One intersection part as a predicate over a fixed object.
pub(super) fn part_predicate(
    ctx: &Ctx,
    part: &str,
    subject: &SubjectRef,
    object_id: SqlExpr,
    visited: SqlExpr,
    allow_param: Option<&str>,
) -> SqlExpr {
    if part == ctx.relation() {
        // `this` inside the intersection: a direct tuple is required
        return granted_scan(
            "t",
            ctx.object_type(),
            Some(object_id),
            std::slice::from_ref(&ctx.analysis.relation),
            subject,
            &ctx.analysis.own_wildcard_types,
            allow_param,
        )
        .exists();
    }
    match ctx.analysis.referenced.get(part) {
        Some(reference) if !reference.needs_full_check => granted_scan(
            "t",
            ctx.object_type(),
            Some(object_id),
            &reference.direct_relations,
            subject,
            &reference.wildcard_subject_types,
            allow_param,
        )
        .exists(),
        _ => delegated_check(
            ctx.object_type(),
            part,
            subject,
            object_id,
            visited,
            Expect::Allow,
        ),
    }
}

/// One relation named in an exclusion, negated.
pub(super) fn excluded_predicate(
    ctx: &Ctx,
    excluded: &str,
    subject: &SubjectRef,
    object_id: SqlExpr,
    visited: SqlExpr,
) -> SqlExpr {
    match ctx.analysis.referenced.get(excluded) {
        Some(reference) if !reference.needs_full_check => granted_scan(
            "x",
            ctx.object_type(),
            Some(object_id),
            &reference.direct_relations,
            subject,
            // denials always honour the wildcard; there is no suppression arm
            &reference.wildcard_subject_types,
            None,
        )
        .not_exists(),
        _ => delegated_check(
            ctx.object_type(),
            excluded,
            subject,
            object_id,
            visited,
            Expect::Deny,
        ),
    }
}

/// The conjunction one intersection group demands over a fixed object.
pub(super) fn group_predicate(
    ctx: &Ctx,
    group: &IntersectionGroup,
    subject: &SubjectRef,
    object_id: SqlExpr,
    visited: SqlExpr,
    allow_param: Option<&str>,
) -> SqlExpr {
    let mut terms = Vec::new();
    for part in &group.relations {
        terms.push(part_predicate(
            ctx,
            part,
            subject,
            object_id.clone(),
            visited.clone(),
            allow_param,
        ));
    }
    for parent in &group.parent_relations {
        let parent = parent_data_for(ctx, &parent.target, &parent.linking);
        terms.push(ttu_exists(
            ctx,
            &parent,
            subject,
            object_id.clone(),
            visited.clone(),
        ));
    }
    for excluded in group.exclusions.values().flatten() {
        terms.push(excluded_predicate(
            ctx,
            excluded,
            subject,
            object_id.clone(),
            visited.clone(),
        ));
    }
    SqlExpr::and(terms)
}

/// Relation-level exclusion predicates: simple scans, delegated denials,
/// denied parent edges and denied groups.
pub(super) fn exclusion_predicates(
    ctx: &Ctx,
    subject: &SubjectRef,
    object_id: SqlExpr,
    visited: SqlExpr,
) -> Vec<SqlExpr> {
    let mut predicates = Vec::new();
    for excluded in &ctx.analysis.excluded_relations {
        predicates.push(excluded_predicate(
            ctx,
            excluded,
            subject,
            object_id.clone(),
            visited.clone(),
        ));
    }
    for excluded in &ctx.analysis.complex_excluded_relations {
        predicates.push(excluded_predicate(
            ctx,
            excluded,
            subject,
            object_id.clone(),
            visited.clone(),
        ));
    }
    for parent in &ctx.analysis.excluded_parents {
        predicates.push(SqlExpr::not(ttu_exists(
            ctx,
            parent,
            subject,
            object_id.clone(),
            visited.clone(),
        )));
    }
    for group in &ctx.analysis.excluded_groups {
        predicates.push(SqlExpr::not(group_predicate(
            ctx,
            group,
            subject,
            object_id.clone(),
            visited.clone(),
            None,
        )));
    }
    predicates
}

/// Looks up the analysed parent data for a `(target, linking)` pair named
/// anywhere in the relation.
pub(super) fn parent_data_for(ctx: &Ctx, target: &str, linking: &str) -> ParentRelationData {
    ctx.analysis
        .parents
        .iter()
        .chain(&ctx.analysis.excluded_parents)
        .chain(&ctx.analysis.referenced_parents)
        .find(|p| p.target == target && p.linking == linking)
        .cloned()
        .unwrap_or_else(|| ParentRelationData {
            target: target.to_string(),
            linking: linking.to_string(),
            allowed_linking_types: Vec::new(),
            self_referential: false,
            cross_type: false,
        })
}

/// A sibling list routine called as a table.
pub(super) fn function_table_select(
    routine: &str,
    args: Vec<SqlExpr>,
    column: &str,
) -> SelectStmt {
    SelectStmt::new()
        .column(SelectItem::expr(SqlExpr::col("f", column)))
        .from(TableExpr::Function(FunctionTable::new(
            routine,
            args,
            "f",
            &[column],
        )))
}

/// Anchor join: the target relation's list-objects routine drives a join
/// through the linking tuples back to this type's objects.
pub(super) fn anchor_join_select(
    ctx: &Ctx,
    parent: &ParentRelationData,
    linking_type: &str,
) -> SelectStmt {
    SelectStmt::new()
        .column(SelectItem::expr(SqlExpr::col("l", "object_id")))
        .from(TableExpr::Function(FunctionTable::new(
            &names::list_objects_routine(linking_type, &parent.target),
            vec![
                SqlExpr::param("p_subject_type"),
                SqlExpr::param("p_subject_id"),
            ],
            "anchor",
            &["object_id"],
        )))
        .join(JoinClause::inner(
            TableExpr::table(super::tuple_query::TUPLE_VIEW, "l"),
            vec![
                SqlExpr::eq(
                    SqlExpr::col("l", "object_type"),
                    SqlExpr::str(ctx.object_type()),
                ),
                SqlExpr::eq(SqlExpr::col("l", "relation"), SqlExpr::str(&parent.linking)),
                SqlExpr::eq(
                    SqlExpr::col("l", "subject_type"),
                    SqlExpr::str(linking_type),
                ),
                SqlExpr::NoUserset(Box::new(SqlExpr::col("l", "subject_id"))),
                SqlExpr::eq(
                    SqlExpr::col("l", "subject_id"),
                    SqlExpr::col("anchor", "object_id"),
                ),
            ],
        ))
}
