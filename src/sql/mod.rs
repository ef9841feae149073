//! Backend for translating relation analyses into stored routines.

mod ast;
mod dialect;
mod dispatch;
mod gen_check;
mod gen_common;
mod gen_list_objects;
mod gen_list_subjects;
mod inline;
mod names;
mod plpgsql;
mod router;
mod stmt;
mod tuple_query;

pub use dialect::Dialect;
pub use router::{Operation, Template};
pub use tuple_query::TUPLE_VIEW;

use std::collections::BTreeSet;

use anyhow::Result;
use serde::Serialize;

use crate::semantic::RelationAnalysis;
use crate::utils::toposort;
use crate::{Options, MELANGE_VERSION};

use self::gen_common::Ctx;

/// One emitted routine.
#[derive(Debug, Clone, Serialize)]
pub struct Routine {
    pub name: String,
    pub sql: String,
    pub kind: RoutineKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RoutineKind {
    Specialised {
        operation: Operation,
        object_type: String,
        relation: String,
        template: Template,
    },
    Dispatcher,
}

/// The full compiled output: every routine in migration order plus the
/// manifest fields the migration driver records.
#[derive(Debug, Clone, Serialize)]
pub struct Migration {
    pub routines: Vec<Routine>,
    pub schema_checksum: String,
    pub codegen_version: String,
    signature: Option<String>,
}

impl Migration {
    /// Concatenated migration script, dispatchers last.
    pub fn script(&self) -> String {
        let mut out = String::new();
        if let Some(signature) = &self.signature {
            out.push_str(&format!("-- {signature}\n\n"));
        }
        for routine in &self.routines {
            out.push_str(&routine.sql);
            out.push('\n');
        }
        out
    }

    /// What the migration driver records next to the checksum.
    pub fn function_names(&self) -> Vec<&str> {
        self.routines.iter().map(|r| r.name.as_str()).collect()
    }

    /// The specialised routine for one `(operation, type, relation)`, if
    /// the pair exists in the model.
    pub fn routine_for(
        &self,
        operation: Operation,
        object_type: &str,
        relation: &str,
    ) -> Option<&Routine> {
        self.routines.iter().find(|routine| match &routine.kind {
            RoutineKind::Specialised {
                operation: op,
                object_type: t,
                relation: r,
                ..
            } => *op == operation && t == object_type && r == relation,
            RoutineKind::Dispatcher => false,
        })
    }
}

/// Translate relation analyses into the migration.
pub fn compile(
    analyses: &[RelationAnalysis],
    schema_checksum: String,
    options: &Options,
) -> Result<Migration> {
    let dialect = options.dialect.handler();
    let pairs: BTreeSet<(String, String)> = analyses
        .iter()
        .map(|a| (a.object_type.clone(), a.relation.clone()))
        .collect();

    let mut routines = Vec::new();
    for operation in [Operation::Check, Operation::ListObjects, Operation::ListSubjects] {
        for analysis in ordered(analyses, operation) {
            let template = router::select_template(operation, analysis, options.depth_ceiling);
            let ctx = Ctx::new(analysis, options.depth_ceiling, &pairs);
            let function = match operation {
                Operation::Check => gen_check::generate(&ctx, template),
                Operation::ListObjects => gen_list_objects::generate(&ctx, template),
                Operation::ListSubjects => gen_list_subjects::generate(&ctx, template),
            };
            routines.push(Routine {
                name: function.name().to_string(),
                sql: function.sql(dialect.as_ref()),
                kind: RoutineKind::Specialised {
                    operation,
                    object_type: analysis.object_type.clone(),
                    relation: analysis.relation.clone(),
                    template,
                },
            });
        }
    }

    let ordered_pairs: Vec<(String, String)> = analyses
        .iter()
        .map(|a| (a.object_type.clone(), a.relation.clone()))
        .collect();
    for (name, sql) in dispatch::generate_all(&ordered_pairs, dialect.as_ref()) {
        routines.push(Routine {
            name,
            sql,
            kind: RoutineKind::Dispatcher,
        });
    }

    log::debug!(
        "emitted {} routines for {} relations",
        routines.len(),
        analyses.len()
    );

    Ok(Migration {
        routines,
        schema_checksum,
        codegen_version: MELANGE_VERSION.to_string(),
        signature: options.signature_comment.then(|| {
            format!(
                "generated by melange-compiler {} target:{}",
                *MELANGE_VERSION, options.dialect
            )
        }),
    })
}

/// Emission order for one operation: callees before callers where the
/// routines reference each other as tables, model order otherwise.
fn ordered(analyses: &[RelationAnalysis], operation: Operation) -> Vec<&RelationAnalysis> {
    if operation == Operation::Check {
        // checks recurse through the dispatcher; creation order is free
        return analyses.iter().collect();
    }

    let pairs: BTreeSet<(String, String)> = analyses
        .iter()
        .map(|a| (a.object_type.clone(), a.relation.clone()))
        .collect();
    let dependencies: Vec<((String, String), Vec<(String, String)>)> = analyses
        .iter()
        .map(|analysis| {
            let node = (analysis.object_type.clone(), analysis.relation.clone());
            let mut deps = Vec::new();
            for relation in analysis
                .complex_relations
                .iter()
                .chain(&analysis.intersection_relations)
            {
                deps.push((analysis.object_type.clone(), relation.clone()));
            }
            for part in analysis.groups.iter().flat_map(|g| &g.relations) {
                if analysis
                    .referenced
                    .get(part)
                    .map(|r| r.needs_full_check)
                    .unwrap_or(false)
                {
                    deps.push((analysis.object_type.clone(), part.clone()));
                }
            }
            for parent in &analysis.parents {
                for linking_type in &parent.allowed_linking_types {
                    if parent.self_referential && linking_type == &analysis.object_type {
                        continue;
                    }
                    deps.push((linking_type.clone(), parent.target.clone()));
                }
            }
            for pattern in analysis.userset_patterns.iter().filter(|p| p.is_complex) {
                for satisfying in &pattern.satisfying_relations {
                    deps.push((pattern.subject_type.clone(), satisfying.clone()));
                }
            }
            deps.retain(|d| pairs.contains(d) && *d != node);
            (node, deps)
        })
        .collect();

    match toposort(&dependencies) {
        Some(order) => {
            let index = |pair: &(String, String)| {
                analyses
                    .iter()
                    .position(|a| a.object_type == pair.0 && a.relation == pair.1)
                    .unwrap()
            };
            order.into_iter().map(|pair| &analyses[index(pair)]).collect()
        }
        // userset graphs may legitimately cycle across types; the database
        // resolves routine references lazily, so model order still applies
        None => analyses.iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{ObjectType, RelationDefinition, Schema};
    use crate::model::SubjectTypeRef;
    use crate::semantic::analyses_of_schema;

    fn compile_types(types: Vec<ObjectType>) -> Migration {
        let analyses = analyses_of_schema(&Schema { types }).unwrap();
        compile(&analyses, "deadbeef".to_string(), &Options::default()).unwrap()
    }

    #[test]
    fn test_empty_model_emits_only_dispatchers() {
        let migration = compile_types(vec![]);
        let names: Vec<_> = migration.function_names();
        assert_eq!(
            names,
            vec![
                "check_permission_dispatch",
                "check_permission",
                "check_permission_no_wildcard",
                "check_permission_internal",
                "list_accessible_objects",
                "list_accessible_subjects",
            ]
        );
        // no branches: every call falls through to the empty default
        let dispatcher = &migration.routines[0];
        assert!(!dispatcher.sql.contains("IF p_object_type"));
    }

    #[test]
    fn test_round_trip_dispatch() {
        let migration = compile_types(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![
                RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("owner")
                },
                RelationDefinition {
                    implied_by: vec!["owner".to_string()],
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("viewer")
                },
            ],
        }]);

        // every pair present in the model resolves to a specialised routine
        for operation in [Operation::Check, Operation::ListObjects, Operation::ListSubjects] {
            for relation in ["owner", "viewer"] {
                let routine = migration.routine_for(operation, "doc", relation).unwrap();
                assert!(routine.sql.contains(&routine.name));
            }
        }
        assert!(migration.routine_for(Operation::Check, "doc", "editor").is_none());

        // and the dispatchers carry a branch for each
        let script = migration.script();
        assert!(script.contains("IF p_object_type = 'doc' AND p_relation = 'owner' THEN"));
        assert!(script.contains("IF p_object_type = 'doc' AND p_relation = 'viewer' THEN"));
    }

    #[test]
    fn test_callees_emitted_before_callers() {
        let migration = compile_types(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![
                // viewer folds editor's exclusion-guarded grants through a
                // routine call, so editor's list routine must exist first
                RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("blocked")
                },
                RelationDefinition {
                    implied_by: vec!["editor".to_string()],
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    ..RelationDefinition::named("viewer")
                },
                RelationDefinition {
                    subject_types: vec![SubjectTypeRef::plain("user")],
                    exclusions: vec!["blocked".to_string()],
                    ..RelationDefinition::named("editor")
                },
            ],
        }]);

        let names = migration.function_names();
        let editor = names
            .iter()
            .position(|n| *n == "list_objects_doc_editor")
            .unwrap();
        let viewer = names
            .iter()
            .position(|n| *n == "list_objects_doc_viewer")
            .unwrap();
        assert!(editor < viewer);
    }

    #[test]
    fn test_script_carries_signature() {
        let migration = compile_types(vec![]);
        assert!(migration
            .script()
            .starts_with("-- generated by melange-compiler"));

        let analyses = analyses_of_schema(&Schema { types: vec![] }).unwrap();
        let plain = compile(
            &analyses,
            "deadbeef".to_string(),
            &Options::default().no_signature(),
        )
        .unwrap();
        assert!(plain.script().starts_with("CREATE OR REPLACE FUNCTION"));
    }
}
