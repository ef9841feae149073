//! Authorization model
//!
//! The canonical in-memory form an external parser hands the compiler: a list
//! of object types, each carrying named relations whose semantics are a
//! recursive [Rule] tree. The normaliser flattens this tree into the
//! [schema::Schema] the rest of the pipeline consumes.

pub mod schema;

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

/// A named object type with its relations, in declaration order.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    pub relations: Vec<RelationDecl>,
}

/// A relation as declared on a type, before normalisation.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RelationDecl {
    pub name: String,
    pub rule: Rule,
}

/// The recursive rewrite tree of one relation.
///
/// `This` is a direct tuple assignment; the other variants mirror the
/// OpenFGA userset-rewrite vocabulary.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, EnumAsInner)]
pub enum Rule {
    /// Direct assignment: a tuple naming one of the listed subject types.
    This { subject_types: Vec<SubjectTypeRef> },
    /// Satisfied whenever `relation` on the same object is satisfied.
    ComputedUserset { relation: String },
    /// `target from linking`: satisfied when `target` holds on an object
    /// reached through a `linking` tuple.
    TupleToUserset { target: String, linking: String },
    Union(Vec<Rule>),
    Intersection(Vec<Rule>),
    /// `base but not subtract`.
    Difference { base: Box<Rule>, subtract: Box<Rule> },
}

/// A subject type permitted in a direct tuple.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SubjectTypeRef {
    pub subject_type: String,

    /// Userset reference: the subject is `subject_type:<id>#<sub_relation>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_relation: Option<String>,

    /// Whether the literal `*` subject id is permitted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wildcard: bool,

    /// ABAC condition attached by the source model. The compiler cannot
    /// lower conditions; a populated value fails normalisation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl SubjectTypeRef {
    pub fn plain(subject_type: &str) -> Self {
        SubjectTypeRef {
            subject_type: subject_type.to_string(),
            sub_relation: None,
            wildcard: false,
            condition: None,
        }
    }

    pub fn wildcard(subject_type: &str) -> Self {
        SubjectTypeRef {
            wildcard: true,
            ..Self::plain(subject_type)
        }
    }

    pub fn userset(subject_type: &str, sub_relation: &str) -> Self {
        SubjectTypeRef {
            sub_relation: Some(sub_relation.to_string()),
            ..Self::plain(subject_type)
        }
    }
}

impl Rule {
    /// Union of the given rules, flattening single-element unions away.
    pub fn union(mut rules: Vec<Rule>) -> Rule {
        if rules.len() == 1 {
            rules.remove(0)
        } else {
            Rule::Union(rules)
        }
    }

    pub fn this(subject_types: Vec<SubjectTypeRef>) -> Rule {
        Rule::This { subject_types }
    }

    pub fn computed(relation: &str) -> Rule {
        Rule::ComputedUserset {
            relation: relation.to_string(),
        }
    }

    pub fn ttu(target: &str, linking: &str) -> Rule {
        Rule::TupleToUserset {
            target: target.to_string(),
            linking: linking.to_string(),
        }
    }

    pub fn difference(base: Rule, subtract: Rule) -> Rule {
        Rule::Difference {
            base: Box::new(base),
            subtract: Box::new(subtract),
        }
    }
}
