//! Normaliser
//!
//! Flattens each relation's recursive [Rule] tree into a
//! [RelationDefinition]. Unions are pushed out of intersections with the
//! distributive law, so the flat form is an OR-of-ANDs; nested differences
//! fold into exclusion lists.

use anyhow::Result;
use itertools::Itertools;

use crate::error::{Error, ErrorKind, Reason};
use crate::model::schema::{
    IntersectionGroup, ObjectType, ParentRelationCheck, RelationDefinition, Schema,
};
use crate::model::{Rule, RelationDecl, SubjectTypeRef, TypeDefinition};

/// Flattens the whole model. Fails on the first relation that cannot be
/// lowered.
pub fn normalise(types: &[TypeDefinition]) -> Result<Schema> {
    let mut schema = Schema::default();
    for type_def in types {
        let mut relations = Vec::with_capacity(type_def.relations.len());
        for decl in &type_def.relations {
            let definition = normalise_relation(decl).map_err(|e| {
                anyhow::Error::from(e).context(format!(
                    "normalising `{}` on type `{}`",
                    decl.name, type_def.name
                ))
            })?;
            relations.push(definition);
        }
        schema.types.push(ObjectType {
            name: type_def.name.clone(),
            relations,
        });
    }
    log::debug!(
        "normalised {} types, {} relations",
        schema.types.len(),
        schema.types.iter().map(|t| t.relations.len()).sum::<usize>()
    );
    Ok(schema)
}

/// Flattens one relation's rule tree.
pub fn normalise_relation(decl: &RelationDecl) -> Result<RelationDefinition, Error> {
    let mut def = RelationDefinition::named(&decl.name);

    // Fold left-nested differences: `(a - b) - c` becomes `a` with
    // exclusions {b, c}.
    let mut rule = &decl.rule;
    let mut subtrahends = Vec::new();
    while let Rule::Difference { base, subtract } = rule {
        subtrahends.push(subtract.as_ref());
        rule = base.as_ref();
    }
    // Collected inner-most first; exclusion order follows source order.
    subtrahends.reverse();
    for subtract in subtrahends {
        lower_exclusion(subtract, decl, &mut def)?;
    }

    lower_union(rule, decl, &mut def)?;

    def.subject_types = dedup(def.subject_types);
    def.implied_by = dedup(def.implied_by);
    def.parent_relations = dedup(def.parent_relations);
    def.exclusions = dedup(def.exclusions);
    def.excluded_parent_relations = dedup(def.excluded_parent_relations);
    Ok(def)
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Lowers a rule in OR position into the flat definition.
fn lower_union(rule: &Rule, decl: &RelationDecl, def: &mut RelationDefinition) -> Result<(), Error> {
    match rule {
        Rule::Union(rules) => {
            for rule in rules {
                lower_union(rule, decl, def)?;
            }
        }
        Rule::This { subject_types } => {
            def.subject_types.extend(checked_refs(subject_types)?);
        }
        Rule::ComputedUserset { relation } => def.implied_by.push(relation.clone()),
        Rule::TupleToUserset { target, linking } => def
            .parent_relations
            .push(ParentRelationCheck::new(target, linking)),
        Rule::Intersection(operands) => {
            def.intersection_groups.extend(distribute(operands, decl)?);
        }
        Rule::Difference { base, subtract } => {
            // A difference scoped to one OR-branch: `a or (b but not c)`.
            // Encoded as single-part intersection groups so the exclusion
            // stays scoped to the branch.
            let names = exclusion_relation_names(subtract)?;
            for alternative in alternatives(base, decl)? {
                def.intersection_groups
                    .push(attach_exclusions(alternative, &names)?);
            }
        }
    }
    Ok(())
}

/// Lowers a rule in subtract position into relation-level exclusions.
fn lower_exclusion(
    rule: &Rule,
    decl: &RelationDecl,
    def: &mut RelationDefinition,
) -> Result<(), Error> {
    match rule {
        Rule::ComputedUserset { relation } => def.exclusions.push(relation.clone()),
        Rule::TupleToUserset { target, linking } => def
            .excluded_parent_relations
            .push(ParentRelationCheck::new(target, linking)),
        Rule::Union(rules) => {
            for rule in rules {
                lower_exclusion(rule, decl, def)?;
            }
        }
        Rule::Intersection(operands) => {
            def.excluded_intersection_groups
                .extend(distribute(operands, decl)?);
        }
        Rule::This { .. } => {
            return Err(Error::new(
                ErrorKind::InvalidModel,
                Reason::Unsupported {
                    construct: "a direct assignment".to_string(),
                    within: "an exclusion".to_string(),
                },
            ))
        }
        Rule::Difference { .. } => {
            return Err(Error::new(
                ErrorKind::InvalidModel,
                Reason::Unsupported {
                    construct: "a nested difference".to_string(),
                    within: "an exclusion".to_string(),
                },
            )
            .with_help("rewrite the subtrahend as a union of plain relations"))
        }
    }
    Ok(())
}

/// Applies the distributive law over intersection operands, producing the
/// cartesian product of each operand's OR-alternatives.
fn distribute(operands: &[Rule], decl: &RelationDecl) -> Result<Vec<IntersectionGroup>, Error> {
    let mut groups = vec![IntersectionGroup::default()];
    for operand in operands {
        let alternatives = alternatives(operand, decl)?;
        let mut next = Vec::with_capacity(groups.len() * alternatives.len());
        for group in &groups {
            for alternative in &alternatives {
                // Deep copy: distributed terms must not alias slices.
                let mut merged = group.deep_clone();
                merged.relations.extend(alternative.relations.iter().cloned());
                merged
                    .parent_relations
                    .extend(alternative.parent_relations.iter().cloned());
                for (relation, exclusions) in &alternative.exclusions {
                    merged
                        .exclusions
                        .entry(relation.clone())
                        .or_default()
                        .extend(exclusions.iter().cloned());
                }
                next.push(merged);
            }
        }
        groups = next;
    }
    for group in &mut groups {
        group.relations = dedup(std::mem::take(&mut group.relations));
        group.parent_relations = dedup(std::mem::take(&mut group.parent_relations));
    }
    Ok(groups)
}

/// The OR-alternatives of a rule in AND position, each expressed as a
/// conjunctive group contribution.
fn alternatives(rule: &Rule, decl: &RelationDecl) -> Result<Vec<IntersectionGroup>, Error> {
    Ok(match rule {
        // `this` inside an intersection: the AND-term requires a direct
        // tuple, materialised as the relation's own name.
        Rule::This { subject_types } => {
            checked_refs(subject_types)?;
            vec![IntersectionGroup {
                relations: vec![decl.name.clone()],
                ..Default::default()
            }]
        }
        Rule::ComputedUserset { relation } => vec![IntersectionGroup {
            relations: vec![relation.clone()],
            ..Default::default()
        }],
        Rule::TupleToUserset { target, linking } => vec![IntersectionGroup {
            parent_relations: vec![ParentRelationCheck::new(target, linking)],
            ..Default::default()
        }],
        Rule::Union(rules) => {
            let mut out = Vec::new();
            for rule in rules {
                out.extend(alternatives(rule, decl)?);
            }
            out
        }
        Rule::Intersection(operands) => distribute(operands, decl)?,
        Rule::Difference { base, subtract } => {
            let names = exclusion_relation_names(subtract)?;
            let mut out = Vec::new();
            for alternative in alternatives(base, decl)? {
                out.push(attach_exclusions(alternative, &names)?);
            }
            out
        }
    })
}

/// Attaches group-scoped exclusions to a single-relation alternative.
fn attach_exclusions(
    mut group: IntersectionGroup,
    names: &[String],
) -> Result<IntersectionGroup, Error> {
    let [relation] = group.relations.as_slice() else {
        return Err(Error::new(
            ErrorKind::InvalidModel,
            Reason::Unsupported {
                construct: "a difference over a non-relation term".to_string(),
                within: "an intersection".to_string(),
            },
        )
        .with_help("only `relation but not relation` is supported inside an intersection"));
    };
    if !group.parent_relations.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidModel,
            Reason::Unsupported {
                construct: "a difference over a parent-relation term".to_string(),
                within: "an intersection".to_string(),
            },
        ));
    }
    group
        .exclusions
        .entry(relation.clone())
        .or_default()
        .extend(names.iter().cloned());
    Ok(group)
}

/// Subtract sides inside union branches and intersections may only name
/// relations.
fn exclusion_relation_names(rule: &Rule) -> Result<Vec<String>, Error> {
    Ok(match rule {
        Rule::ComputedUserset { relation } => vec![relation.clone()],
        Rule::Union(rules) => rules
            .iter()
            .map(exclusion_relation_names)
            .flatten_ok()
            .try_collect()?,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidModel,
                Reason::Unsupported {
                    construct: "a non-relation subtrahend".to_string(),
                    within: "a scoped exclusion".to_string(),
                },
            )
            .with_help("move the difference to the top level of the relation"))
        }
    })
}

fn checked_refs(refs: &[SubjectTypeRef]) -> Result<Vec<SubjectTypeRef>, Error> {
    for subject_ref in refs {
        if let Some(condition) = &subject_ref.condition {
            return Err(Error::new(
                ErrorKind::InvalidModel,
                Reason::Unsupported {
                    construct: format!("condition `{condition}`"),
                    within: format!("subject type `{}`", subject_ref.subject_type),
                },
            )
            .with_help("conditions are not compilable; drop them or evaluate them client-side"));
        }
    }
    Ok(refs.to_vec())
}
