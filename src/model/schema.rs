//! Flattened model
//!
//! Output of the normaliser: every relation's rule tree collapsed into one
//! [RelationDefinition] record whose optional fields are set or empty.
//! Templates dispatch on the presence of fields, not on a class hierarchy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::SubjectTypeRef;

/// The whole normalised model.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub types: Vec<ObjectType>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ObjectType {
    pub name: String,
    pub relations: Vec<RelationDefinition>,
}

/// One relation with every rule shape folded in.
///
/// Interpretation: a subject satisfies the relation when any of the direct
/// subject-type refs, implied-by relations, parent-relation checks or
/// intersection groups grant it, and none of the exclusions deny it.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,

    /// Subject types a direct tuple may name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_types: Vec<SubjectTypeRef>,

    /// Relations on the same object whose possession implies this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implied_by: Vec<String>,

    /// Tuple-to-userset edges: `target from linking`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_relations: Vec<ParentRelationCheck>,

    /// Relations whose possession denies this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<String>,

    /// Denying tuple-to-userset edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_parent_relations: Vec<ParentRelationCheck>,

    /// OR-of-ANDs after union distribution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intersection_groups: Vec<IntersectionGroup>,

    /// Denying intersection groups (a difference whose subtrahend is an
    /// intersection).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_intersection_groups: Vec<IntersectionGroup>,
}

/// `target from linking`: evaluate `target` on the object a `linking` tuple
/// points at.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct ParentRelationCheck {
    pub target: String,
    pub linking: String,
}

impl ParentRelationCheck {
    pub fn new(target: &str, linking: &str) -> Self {
        ParentRelationCheck {
            target: target.to_string(),
            linking: linking.to_string(),
        }
    }
}

/// One AND-term of a relation's OR-of-ANDs form.
///
/// A `this` inside the source intersection is materialised as the relation's
/// own name in `relations`, so the term requires a direct tuple.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct IntersectionGroup {
    /// Relation names that must all be satisfied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<String>,

    /// Tuple-to-userset terms that must be satisfied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_relations: Vec<ParentRelationCheck>,

    /// Per-relation exclusions scoped to this AND-term.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exclusions: BTreeMap<String, Vec<String>>,
}

impl IntersectionGroup {
    /// Deep copy used during union distribution. Groups must not alias their
    /// slices across distributed terms.
    pub fn deep_clone(&self) -> Self {
        IntersectionGroup {
            relations: self.relations.to_vec(),
            parent_relations: self.parent_relations.to_vec(),
            exclusions: self
                .exclusions
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty() && self.parent_relations.is_empty()
    }
}

impl RelationDefinition {
    pub fn named(name: &str) -> Self {
        RelationDefinition {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

impl Schema {
    pub fn object_type(&self, name: &str) -> Option<&ObjectType> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn relation(&self, object_type: &str, relation: &str) -> Option<&RelationDefinition> {
        self.object_type(object_type)
            .and_then(|t| t.relations.iter().find(|r| r.name == relation))
    }

    /// All `(type, relation)` pairs in model order.
    pub fn relation_pairs(&self) -> impl Iterator<Item = (&ObjectType, &RelationDefinition)> {
        self.types
            .iter()
            .flat_map(|t| t.relations.iter().map(move |r| (t, r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_clone_does_not_alias() {
        let mut group = IntersectionGroup {
            relations: vec!["viewer".to_string()],
            parent_relations: vec![ParentRelationCheck::new("member", "group")],
            exclusions: BTreeMap::from([("viewer".to_string(), vec!["blocked".to_string()])]),
        };
        let copy = group.deep_clone();

        group.relations.push("editor".to_string());
        group
            .exclusions
            .get_mut("viewer")
            .unwrap()
            .push("banned".to_string());

        assert_eq!(copy.relations, vec!["viewer"]);
        assert_eq!(copy.exclusions["viewer"], vec!["blocked"]);
    }

    #[test]
    fn test_schema_lookup() {
        let schema = Schema {
            types: vec![ObjectType {
                name: "doc".to_string(),
                relations: vec![RelationDefinition::named("owner")],
            }],
        };
        assert!(schema.relation("doc", "owner").is_some());
        assert!(schema.relation("doc", "viewer").is_none());
        assert!(schema.relation("folder", "owner").is_none());
    }
}
