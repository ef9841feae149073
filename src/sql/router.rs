//! Template router.
//!
//! A pure function from a relation's feature flags to one of a bounded
//! catalogue of routine shapes. The catalogue is a closed set, not an
//! extension point.

use serde::Serialize;

use crate::semantic::RelationAnalysis;

/// The three generated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Check,
    ListObjects,
    ListSubjects,
}

/// Routine shapes the emitters know how to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Template {
    Direct,
    Exclusion,
    Userset,
    Recursive,
    Intersection,
    SelfReferentialUserset,
    Composed,
    DepthExceeded,
}

/// Selects the template for one `(operation, relation)`. First match wins.
pub fn select_template(
    operation: Operation,
    analysis: &RelationAnalysis,
    depth_ceiling: usize,
) -> Template {
    if analysis.max_userset_depth > depth_ceiling {
        return Template::DepthExceeded;
    }
    if analysis.features.has_intersection {
        return Template::Intersection;
    }

    // Check routines recurse through the dispatcher rather than through
    // CTEs, so every remaining shape collapses into two.
    if operation == Operation::Check {
        if analysis.features.has_exclusion {
            return Template::Exclusion;
        }
        return Template::Direct;
    }

    if analysis
        .userset_patterns
        .iter()
        .any(|p| p.is_self_referential(&analysis.object_type, &analysis.relation))
    {
        return Template::SelfReferentialUserset;
    }
    if analysis.features.has_self_referential {
        return Template::Recursive;
    }
    if is_pure_anchor(analysis) {
        return Template::Composed;
    }
    if analysis.features.has_exclusion {
        return Template::Exclusion;
    }
    if analysis.features.has_userset {
        return Template::Userset;
    }
    Template::Direct
}

/// A relation whose only grant paths are cross-type tuple-to-userset edges;
/// its list routines reduce to joining the anchor relations' routines.
fn is_pure_anchor(analysis: &RelationAnalysis) -> bool {
    analysis.features.has_parent
        && !analysis.features.has_self_referential
        && !analysis.features.has_exclusion
        && analysis.direct_subject_types.is_empty()
        && analysis.wildcard_subject_types.is_empty()
        && analysis.userset_patterns.is_empty()
        && analysis.complex_relations.is_empty()
        && analysis.intersection_relations.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{ObjectType, ParentRelationCheck, RelationDefinition, Schema};
    use crate::model::SubjectTypeRef;
    use crate::semantic::{analyses_of_schema, RelationAnalysis};

    fn analyses(types: Vec<ObjectType>) -> Vec<RelationAnalysis> {
        analyses_of_schema(&Schema { types }).unwrap()
    }

    fn find<'a>(all: &'a [RelationAnalysis], relation: &str) -> &'a RelationAnalysis {
        all.iter().find(|a| a.relation == relation).unwrap()
    }

    #[test]
    fn test_selection_catalogue() {
        let all = analyses(vec![
            ObjectType {
                name: "folder".to_string(),
                relations: vec![
                    RelationDefinition {
                        subject_types: vec![SubjectTypeRef::plain("folder")],
                        ..RelationDefinition::named("parent")
                    },
                    RelationDefinition {
                        subject_types: vec![SubjectTypeRef::plain("user")],
                        ..RelationDefinition::named("blocked")
                    },
                    RelationDefinition {
                        subject_types: vec![SubjectTypeRef::plain("user")],
                        parent_relations: vec![ParentRelationCheck::new("can_read", "parent")],
                        ..RelationDefinition::named("can_read")
                    },
                    RelationDefinition {
                        subject_types: vec![SubjectTypeRef::plain("user")],
                        exclusions: vec!["blocked".to_string()],
                        ..RelationDefinition::named("viewer")
                    },
                ],
            },
            ObjectType {
                name: "doc".to_string(),
                relations: vec![
                    RelationDefinition {
                        subject_types: vec![SubjectTypeRef::plain("folder")],
                        ..RelationDefinition::named("folder")
                    },
                    RelationDefinition {
                        parent_relations: vec![ParentRelationCheck::new("can_read", "folder")],
                        ..RelationDefinition::named("can_read")
                    },
                ],
            },
        ]);

        let folder_read = find(&all, "can_read");
        assert_eq!(
            select_template(Operation::ListObjects, folder_read, 25),
            Template::Recursive
        );
        assert_eq!(
            select_template(Operation::Check, folder_read, 25),
            Template::Direct
        );

        let viewer = find(&all, "viewer");
        assert_eq!(
            select_template(Operation::ListObjects, viewer, 25),
            Template::Exclusion
        );
        assert_eq!(
            select_template(Operation::Check, viewer, 25),
            Template::Exclusion
        );

        let doc_read = all
            .iter()
            .find(|a| a.object_type == "doc" && a.relation == "can_read")
            .unwrap();
        assert_eq!(
            select_template(Operation::ListObjects, doc_read, 25),
            Template::Composed
        );
    }

    #[test]
    fn test_self_referential_userset_selection() {
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
        let member = find(&all, "member");
        assert_eq!(
            select_template(Operation::ListSubjects, member, 25),
            Template::SelfReferentialUserset
        );
        assert_eq!(select_template(Operation::Check, member, 25), Template::Direct);
    }

    #[test]
    fn test_depth_exceeded_wins() {
        let all = analyses(vec![
            ObjectType {
                name: "doc".to_string(),
                relations: vec![RelationDefinition {
                    subject_types: vec![SubjectTypeRef::userset("group", "member")],
                    ..RelationDefinition::named("viewer")
                }],
            },
            ObjectType {
                name: "group".to_string(),
                relations: vec![RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("member")
                }],
            },
        ]);
        let viewer = all
            .iter()
            .find(|a| a.object_type == "doc" && a.relation == "viewer")
            .unwrap();
        assert_eq!(viewer.max_userset_depth, 1);
        assert_eq!(
            select_template(Operation::ListObjects, viewer, 0),
            Template::DepthExceeded
        );
        assert_eq!(
            select_template(Operation::ListObjects, viewer, 1),
            Template::Userset
        );
    }
}
