//! Closure builder
//!
//! Computes the reflexive-transitive `satisfied-by` set over implied-by
//! edges, per object type (edges never cross types), and the userset
//! dispatch rules derived from subject refs that carry a sub-relation.
//!
//! Graphs are held as maps from relation name to ancestor lists and walked
//! breadth-first with a per-traversal visited set, so arbitrary implied-by
//! graphs are supported without ownership cycles.

use std::collections::{BTreeMap, HashSet, VecDeque};

use anyhow::Result;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Reason};
use crate::model::schema::{ObjectType, Schema};

/// One flattened satisfied-by edge.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ClosureRow {
    pub object_type: String,
    pub relation: String,
    pub satisfying_relation: String,
    /// Traversal path from the relation to the satisfying relation. Debug
    /// output only; never rendered into SQL.
    pub via: Vec<String>,
}

/// One precomputed userset dispatch row: a tuple whose relation equals
/// `tuple_relation` and whose subject has the form
/// `subject_type:<id>#subject_relation_satisfying` can satisfy `relation`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct UsersetRule {
    pub object_type: String,
    pub relation: String,
    pub tuple_relation: String,
    pub subject_type: String,
    pub subject_relation: String,
    pub subject_relation_satisfying: String,
}

/// Closure output for the whole schema.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Closure {
    rows: BTreeMap<(String, String), Vec<ClosureRow>>,
    userset_rules: BTreeMap<(String, String), Vec<UsersetRule>>,
}

impl Closure {
    /// Satisfying relations of `(object_type, relation)` in BFS order,
    /// starting with the relation itself. Falls back to the reflexive set
    /// for pairs outside the model.
    pub fn satisfying(&self, object_type: &str, relation: &str) -> Vec<String> {
        match self.rows_for(object_type, relation) {
            rows if rows.is_empty() => vec![relation.to_string()],
            rows => rows.iter().map(|r| r.satisfying_relation.clone()).collect(),
        }
    }

    pub fn rows_for(&self, object_type: &str, relation: &str) -> &[ClosureRow] {
        self.rows
            .get(&(object_type.to_string(), relation.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn userset_rules_for(&self, object_type: &str, relation: &str) -> &[UsersetRule] {
        self.userset_rules
            .get(&(object_type.to_string(), relation.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Builds the closure for every relation in the schema.
///
/// Fails with a cyclic-schema error when the implied-by graph of any type
/// contains a cycle through the relation under construction; self-loops are
/// cycles.
pub fn build_closure(schema: &Schema) -> Result<Closure, Error> {
    let mut closure = Closure::default();

    for object_type in &schema.types {
        // Inbound edges: relation -> relations that imply it.
        let implied_by: BTreeMap<&str, Vec<&str>> = object_type
            .relations
            .iter()
            .map(|r| {
                let mut ancestors: Vec<&str> =
                    r.implied_by.iter().map(String::as_str).sorted().collect();
                ancestors.dedup();
                (r.name.as_str(), ancestors)
            })
            .collect();

        for relation in &object_type.relations {
            let rows = walk(object_type, &implied_by, &relation.name)?;
            closure
                .rows
                .insert((object_type.name.clone(), relation.name.clone()), rows);
        }
    }

    // Userset rules cross-product object-side closure with subject-side
    // closure; both sides must exist before this pass runs.
    for object_type in &schema.types {
        for relation in &object_type.relations {
            let mut rules = Vec::new();
            for satisfying in closure.satisfying(&object_type.name, &relation.name) {
                let Some(definition) = schema.relation(&object_type.name, &satisfying) else {
                    continue;
                };
                for subject_ref in &definition.subject_types {
                    let Some(subject_relation) = &subject_ref.sub_relation else {
                        continue;
                    };
                    for satisfying_sub in
                        closure.satisfying(&subject_ref.subject_type, subject_relation)
                    {
                        rules.push(UsersetRule {
                            object_type: object_type.name.clone(),
                            relation: relation.name.clone(),
                            tuple_relation: satisfying.clone(),
                            subject_type: subject_ref.subject_type.clone(),
                            subject_relation: subject_relation.clone(),
                            subject_relation_satisfying: satisfying_sub,
                        });
                    }
                }
            }
            rules.dedup();
            closure
                .userset_rules
                .insert((object_type.name.clone(), relation.name.clone()), rules);
        }
    }

    Ok(closure)
}

/// Breadth-first walk over inbound implied-by edges from `root`, recording
/// the traversal path of every ancestor. Ties are broken lexically by the
/// pre-sorted adjacency lists.
fn walk(
    object_type: &ObjectType,
    implied_by: &BTreeMap<&str, Vec<&str>>,
    root: &str,
) -> Result<Vec<ClosureRow>, Error> {
    let mut rows = vec![ClosureRow {
        object_type: object_type.name.clone(),
        relation: root.to_string(),
        satisfying_relation: root.to_string(),
        via: Vec::new(),
    }];

    let mut visited: HashSet<&str> = HashSet::from([root]);
    let mut queue: VecDeque<(&str, Vec<String>)> = VecDeque::from([(root, Vec::new())]);

    while let Some((current, path)) = queue.pop_front() {
        for &ancestor in implied_by.get(current).into_iter().flatten() {
            let mut via = path.clone();
            via.push(ancestor.to_string());

            if ancestor == root {
                let mut cycle = vec![root.to_string()];
                cycle.extend(via);
                return Err(Error::new(
                    ErrorKind::CyclicSchema,
                    Reason::Cycle {
                        object_type: object_type.name.clone(),
                        path: cycle,
                    },
                ));
            }
            if !visited.insert(ancestor) {
                continue;
            }

            rows.push(ClosureRow {
                object_type: object_type.name.clone(),
                relation: root.to_string(),
                satisfying_relation: ancestor.to_string(),
                via: via.clone(),
            });
            queue.push_back((ancestor, via));
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{ObjectType, RelationDefinition};
    use crate::model::SubjectTypeRef;

    fn relation(name: &str, implied_by: &[&str]) -> RelationDefinition {
        RelationDefinition {
            implied_by: implied_by.iter().map(ToString::to_string).collect(),
            ..RelationDefinition::named(name)
        }
    }

    fn schema(types: Vec<ObjectType>) -> Schema {
        Schema { types }
    }

    #[test]
    fn reflexive_and_transitive() {
        // owner implies editor implies viewer
        let schema = schema(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![
                relation("owner", &[]),
                relation("editor", &["owner"]),
                relation("viewer", &["editor"]),
            ],
        }]);
        let closure = build_closure(&schema).unwrap();

        assert_eq!(closure.satisfying("doc", "owner"), vec!["owner"]);
        assert_eq!(closure.satisfying("doc", "editor"), vec!["editor", "owner"]);
        assert_eq!(
            closure.satisfying("doc", "viewer"),
            vec!["viewer", "editor", "owner"]
        );

        // the transitive row records its path
        let rows = closure.rows_for("doc", "viewer");
        let owner_row = rows.iter().find(|r| r.satisfying_relation == "owner").unwrap();
        assert_eq!(owner_row.via, vec!["editor", "owner"]);
    }

    #[test]
    fn closure_sets_are_closed() {
        // if A satisfies B and B satisfies C then A satisfies C, for every
        // relation in a diamond-shaped hierarchy
        let schema = schema(vec![ObjectType {
            name: "repo".to_string(),
            relations: vec![
                relation("admin", &[]),
                relation("maintainer", &["admin"]),
                relation("triager", &["admin"]),
                relation("reader", &["maintainer", "triager"]),
            ],
        }]);
        let closure = build_closure(&schema).unwrap();

        for r in ["admin", "maintainer", "triager", "reader"] {
            for s in closure.satisfying("repo", r) {
                for deeper in closure.satisfying("repo", &s) {
                    assert!(
                        closure.satisfying("repo", r).contains(&deeper),
                        "{deeper} satisfies {s} satisfies {r} but is missing from closure({r})"
                    );
                }
            }
        }
    }

    #[test]
    fn bfs_order_breaks_ties_lexically() {
        let schema = schema(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![
                relation("b", &[]),
                relation("a", &[]),
                relation("viewer", &["b", "a"]),
            ],
        }]);
        let closure = build_closure(&schema).unwrap();
        assert_eq!(closure.satisfying("doc", "viewer"), vec!["viewer", "a", "b"]);
    }

    #[test]
    fn closure_is_idempotent() {
        let schema = schema(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![
                relation("owner", &[]),
                relation("editor", &["owner"]),
                relation("viewer", &["editor"]),
            ],
        }]);
        let closure = build_closure(&schema).unwrap();

        // Re-run over a schema whose implied-by lists are replaced by the
        // closure's satisfying sets; the satisfying sets must not grow.
        let widened = Schema {
            types: vec![ObjectType {
                name: "doc".to_string(),
                relations: schema.types[0]
                    .relations
                    .iter()
                    .map(|r| {
                        let mut ancestors = closure.satisfying("doc", &r.name);
                        ancestors.retain(|s| s != &r.name);
                        RelationDefinition {
                            implied_by: ancestors,
                            ..RelationDefinition::named(&r.name)
                        }
                    })
                    .collect(),
            }],
        };
        let again = build_closure(&widened).unwrap();

        for r in ["owner", "editor", "viewer"] {
            let mut a = closure.satisfying("doc", r);
            let mut b = again.satisfying("doc", r);
            a.sort();
            b.sort();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let schema = schema(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![relation("viewer", &["viewer"])],
        }]);
        let err = build_closure(&schema).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CyclicSchema);
    }

    #[test]
    fn mutual_implication_is_a_cycle() {
        let schema = schema(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![relation("a", &["b"]), relation("b", &["a"])],
        }]);
        let err = build_closure(&schema).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CyclicSchema);
        assert!(err.to_string().contains("doc"));
    }

    #[test]
    fn disconnected_components_are_fine() {
        let schema = schema(vec![ObjectType {
            name: "doc".to_string(),
            relations: vec![
                relation("viewer", &[]),
                relation("archivist", &[]),
            ],
        }]);
        assert!(build_closure(&schema).is_ok());
    }

    #[test]
    fn userset_rules_cross_product_both_closures() {
        // doc.viewer: [group#member]; group.member implied by group.admin;
        // doc.viewer implied by doc.editor (editor has no usersets itself,
        // so only viewer's own ref contributes).
        let schema = schema(vec![
            ObjectType {
                name: "doc".to_string(),
                relations: vec![
                    relation("editor", &[]),
                    RelationDefinition {
                        implied_by: vec!["editor".to_string()],
                        subject_types: vec![SubjectTypeRef::userset("group", "member")],
                        ..RelationDefinition::named("viewer")
                    },
                ],
            },
            ObjectType {
                name: "group".to_string(),
                relations: vec![relation("admin", &[]), relation("member", &["admin"])],
            },
        ]);
        let closure = build_closure(&schema).unwrap();

        let rules = closure.userset_rules_for("doc", "viewer");
        let keys: Vec<_> = rules
            .iter()
            .map(|r| {
                (
                    r.tuple_relation.as_str(),
                    r.subject_relation.as_str(),
                    r.subject_relation_satisfying.as_str(),
                )
            })
            .collect();
        // subject-side closure of member is {member, admin}
        assert_eq!(
            keys,
            vec![("viewer", "member", "member"), ("viewer", "member", "admin")]
        );

        // editor carries no sub-relation refs, so its rules are empty
        assert!(closure.userset_rules_for("doc", "editor").is_empty());
    }
}
