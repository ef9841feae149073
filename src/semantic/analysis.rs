//! Relation analyser
//!
//! Derives, for every `(type, relation)` pair, the complete compile-time
//! view the template router consumes: feature flags, allowed subject types,
//! satisfying-relation partitions, userset patterns, parent-relation data
//! and exclusion inputs. Templates never re-read the raw schema.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use itertools::Itertools;
use serde::Serialize;

use crate::error::{Error, ErrorKind, Reason};
use crate::model::schema::{IntersectionGroup, RelationDefinition, Schema};
use crate::semantic::closure::{Closure, ClosureRow, UsersetRule};
use crate::utils::toposort;

/// Boolean feature set of one relation; the router's dispatch key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Features {
    pub has_implied_by: bool,
    pub has_parent: bool,
    pub has_exclusion: bool,
    pub has_intersection: bool,
    pub has_userset: bool,
    pub has_wildcard: bool,
    pub has_self_referential: bool,
    pub has_cross_type_links: bool,
    pub complex_exclusion: bool,
}

/// One userset shape a template must expand: tuples of the form
/// `<object> <source_relation> subject_type:<id>#<satisfying sub-relation>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsersetPattern {
    pub subject_type: String,
    pub subject_relation: String,
    /// Sub-relations a tuple may carry (subject-side closure of
    /// `subject_relation`).
    pub satisfying_relations: Vec<String>,
    /// Tuple relations that may carry this pattern (object-side closure).
    pub source_relations: Vec<String>,
    /// `(relation, satisfying_relation)` rows for the membership join,
    /// covering the closure of every accepted sub-relation.
    pub member_closure: Vec<(String, String)>,
    /// True when the pattern arrived through a satisfying relation rather
    /// than the relation's own subject refs.
    pub is_closure: bool,
    /// True when membership cannot be resolved by a direct-tuple join and
    /// must delegate to the recursive check.
    pub is_complex: bool,
    /// True when the subject relation admits wildcard members.
    pub has_wildcard: bool,
}

impl UsersetPattern {
    pub fn is_self_referential(&self, object_type: &str, relation: &str) -> bool {
        self.subject_type == object_type
            && self
                .satisfying_relations
                .iter()
                .any(|s| s == relation)
    }
}

/// One tuple-to-userset edge with everything templates need to follow it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentRelationData {
    pub target: String,
    pub linking: String,
    /// Concrete types a linking tuple's subject may have.
    pub allowed_linking_types: Vec<String>,
    /// Linking tuples may point at an object of the same type with the same
    /// target relation; this drives the recursive templates.
    pub self_referential: bool,
    pub cross_type: bool,
}

/// Compile-time view of a relation referenced from another relation's
/// exclusions or intersection groups; enough to render a scan or decide to
/// delegate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferencedRelation {
    /// Full satisfying set, BFS order.
    pub satisfying: Vec<String>,
    /// Satisfying relations resolvable by a direct-tuple scan.
    pub direct_relations: Vec<String>,
    /// True when a direct-tuple scan under-approximates the relation.
    pub needs_full_check: bool,
    pub direct_subject_types: Vec<String>,
    pub wildcard_subject_types: Vec<String>,
}

/// The per-relation compile-time view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationAnalysis {
    pub object_type: String,
    pub relation: String,
    pub features: Features,

    /// Closed set of types a valid subject may have.
    pub allowed_subject_types: Vec<String>,
    /// Full satisfying set, BFS order, self first.
    pub satisfying_relations: Vec<String>,
    /// Satisfying relations resolvable by a direct-tuple scan (the IN list
    /// of the direct block).
    pub direct_relations: Vec<String>,
    /// Concrete types allowed in direct tuples of the direct relations.
    pub direct_subject_types: Vec<String>,
    /// Types whose direct refs admit the `*` subject.
    pub wildcard_subject_types: Vec<String>,
    /// Concrete types of the relation's own direct refs, ignoring the
    /// closure; intersection terms that require a direct tuple scan these.
    pub own_subject_types: Vec<String>,
    pub own_wildcard_types: Vec<String>,
    /// Satisfying relations that carry exclusions or parent edges and must
    /// be evaluated through the recursive check.
    pub complex_relations: Vec<String>,
    /// Satisfying relations that are themselves intersections, lifted to
    /// their own specialised routines.
    pub intersection_relations: Vec<String>,

    pub userset_patterns: Vec<UsersetPattern>,
    pub parents: Vec<ParentRelationData>,
    /// Parent edges named only inside intersection groups; resolved here so
    /// templates can follow them without re-reading the schema.
    pub referenced_parents: Vec<ParentRelationData>,

    /// Exclusions resolvable by a direct-tuple NOT EXISTS.
    pub excluded_relations: Vec<String>,
    /// Exclusions that require a negated recursive check.
    pub complex_excluded_relations: Vec<String>,
    pub excluded_parents: Vec<ParentRelationData>,
    pub excluded_groups: Vec<IntersectionGroup>,

    pub groups: Vec<IntersectionGroup>,

    /// Every relation named by exclusions or intersection groups, with the
    /// closure detail templates need to scan or delegate it.
    pub referenced: BTreeMap<String, ReferencedRelation>,

    /// Longest static userset chain reachable from this relation.
    pub max_userset_depth: usize,

    /// Closure rows inlined into routines that need them.
    pub closure_rows: Vec<ClosureRow>,
    /// Userset rules restricted to non-delegated source relations.
    pub userset_rules: Vec<UsersetRule>,
}

/// Runs the analyser over the whole schema.
///
/// Output is ordered by `(type, relation)` in model order. Fails when the
/// tuple-to-userset graph contains a loop through differing relations.
pub fn analyse(schema: &Schema, closure: &Closure) -> Result<Vec<RelationAnalysis>, Error> {
    let mut subject_types = SubjectTypeResolver::new(schema, closure);
    let mut analyses = Vec::new();

    for (object_type, definition) in schema.relation_pairs() {
        analyses.push(analyse_relation(
            schema,
            closure,
            &mut subject_types,
            &object_type.name,
            definition,
        ));
    }

    check_parent_loops(&analyses)?;

    log::debug!("analysed {} relations", analyses.len());
    Ok(analyses)
}

fn analyse_relation(
    schema: &Schema,
    closure: &Closure,
    subject_types: &mut SubjectTypeResolver,
    object_type: &str,
    definition: &RelationDefinition,
) -> RelationAnalysis {
    let relation = definition.name.as_str();
    let satisfying_relations = closure.satisfying(object_type, relation);

    // Partition the satisfying set. A satisfying relation that carries its
    // own exclusions or parent edges cannot be folded into a direct-tuple
    // scan: a direct tuple for it does not prove it holds.
    let mut direct_relations = Vec::new();
    let mut complex_relations = Vec::new();
    let mut intersection_relations = Vec::new();
    for satisfying in &satisfying_relations {
        match schema.relation(object_type, satisfying) {
            Some(def) if satisfying != relation && !def.intersection_groups.is_empty() => {
                intersection_relations.push(satisfying.clone());
            }
            Some(def) if satisfying != relation && is_guarded(def) => {
                complex_relations.push(satisfying.clone());
            }
            _ => direct_relations.push(satisfying.clone()),
        }
    }

    // Concrete subject refs across the direct partition drive the direct
    // block and its wildcard arm.
    let mut direct_subject_types = Vec::new();
    let mut wildcard_subject_types = Vec::new();
    for satisfying in &direct_relations {
        let Some(def) = schema.relation(object_type, satisfying) else {
            continue;
        };
        for subject_ref in &def.subject_types {
            if subject_ref.sub_relation.is_some() {
                continue;
            }
            direct_subject_types.push(subject_ref.subject_type.clone());
            if subject_ref.wildcard {
                wildcard_subject_types.push(subject_ref.subject_type.clone());
            }
        }
    }
    direct_subject_types = dedup(direct_subject_types);
    wildcard_subject_types = dedup(wildcard_subject_types);

    let own_subject_types = dedup(
        definition
            .subject_types
            .iter()
            .filter(|r| r.sub_relation.is_none())
            .map(|r| r.subject_type.clone())
            .collect(),
    );
    let own_wildcard_types = dedup(
        definition
            .subject_types
            .iter()
            .filter(|r| r.sub_relation.is_none() && r.wildcard)
            .map(|r| r.subject_type.clone())
            .collect(),
    );

    let userset_patterns = userset_patterns(
        schema,
        closure,
        object_type,
        relation,
        &direct_relations,
    );

    let parents: Vec<_> = definition
        .parent_relations
        .iter()
        .map(|p| parent_data(subject_types, object_type, relation, &p.target, &p.linking))
        .collect();

    let mut referenced_parents: Vec<ParentRelationData> = Vec::new();
    for group in definition
        .intersection_groups
        .iter()
        .chain(&definition.excluded_intersection_groups)
    {
        for check in &group.parent_relations {
            if referenced_parents
                .iter()
                .chain(&parents)
                .any(|p| p.target == check.target && p.linking == check.linking)
            {
                continue;
            }
            referenced_parents.push(parent_data(
                subject_types,
                object_type,
                relation,
                &check.target,
                &check.linking,
            ));
        }
    }

    let mut excluded_relations = Vec::new();
    let mut complex_excluded_relations = Vec::new();
    for excluded in &definition.exclusions {
        if needs_full_check(schema, closure, object_type, excluded) {
            complex_excluded_relations.push(excluded.clone());
        } else {
            excluded_relations.push(excluded.clone());
        }
    }
    let excluded_parents: Vec<_> = definition
        .excluded_parent_relations
        .iter()
        .map(|p| parent_data(subject_types, object_type, relation, &p.target, &p.linking))
        .collect();

    let features = Features {
        has_implied_by: !definition.implied_by.is_empty(),
        has_parent: !parents.is_empty(),
        has_exclusion: !definition.exclusions.is_empty()
            || !excluded_parents.is_empty()
            || !definition.excluded_intersection_groups.is_empty(),
        has_intersection: !definition.intersection_groups.is_empty(),
        has_userset: !userset_patterns.is_empty(),
        has_wildcard: !wildcard_subject_types.is_empty()
            || userset_patterns.iter().any(|p| p.has_wildcard),
        has_self_referential: parents.iter().any(|p| p.self_referential),
        has_cross_type_links: parents.iter().any(|p| p.cross_type),
        complex_exclusion: !complex_excluded_relations.is_empty()
            || !excluded_parents.is_empty()
            || !definition.excluded_intersection_groups.is_empty(),
    };

    // Everything exclusions and intersection groups name, resolved once so
    // templates never consult the schema.
    let mut referenced = BTreeMap::new();
    {
        let mut names: Vec<&String> = Vec::new();
        names.extend(&definition.exclusions);
        for group in definition
            .intersection_groups
            .iter()
            .chain(&definition.excluded_intersection_groups)
        {
            names.extend(&group.relations);
            for (part, excluded) in &group.exclusions {
                names.push(part);
                names.extend(excluded);
            }
        }
        for name in names {
            if name == relation || referenced.contains_key(name) {
                continue;
            }
            referenced.insert(name.clone(), reference(schema, closure, object_type, name));
        }
    }

    // Userset rules whose tuple relation is delegated stay with the
    // delegated relation's own routine.
    let userset_rules: Vec<_> = closure
        .userset_rules_for(object_type, relation)
        .iter()
        .filter(|rule| direct_relations.contains(&rule.tuple_relation))
        .cloned()
        .collect();

    RelationAnalysis {
        object_type: object_type.to_string(),
        relation: relation.to_string(),
        features,
        allowed_subject_types: subject_types.resolve(object_type, relation),
        satisfying_relations,
        direct_relations,
        direct_subject_types,
        wildcard_subject_types,
        own_subject_types,
        own_wildcard_types,
        complex_relations,
        intersection_relations,
        userset_patterns,
        parents,
        referenced_parents,
        excluded_relations,
        complex_excluded_relations,
        excluded_parents,
        excluded_groups: definition.excluded_intersection_groups.clone(),
        groups: definition.intersection_groups.clone(),
        referenced,
        max_userset_depth: userset_depth(closure, object_type, relation, &mut HashSet::new()),
        closure_rows: closure.rows_for(object_type, relation).to_vec(),
        userset_rules,
    }
}

fn reference(
    schema: &Schema,
    closure: &Closure,
    object_type: &str,
    relation: &str,
) -> ReferencedRelation {
    let satisfying = closure.satisfying(object_type, relation);
    let mut direct_relations = Vec::new();
    let mut direct_subject_types = Vec::new();
    let mut wildcard_subject_types = Vec::new();
    for name in &satisfying {
        let Some(def) = schema.relation(object_type, name) else {
            direct_relations.push(name.clone());
            continue;
        };
        if name != relation && (is_guarded(def) || !def.intersection_groups.is_empty()) {
            continue;
        }
        direct_relations.push(name.clone());
        for subject_ref in &def.subject_types {
            if subject_ref.sub_relation.is_some() {
                continue;
            }
            direct_subject_types.push(subject_ref.subject_type.clone());
            if subject_ref.wildcard {
                wildcard_subject_types.push(subject_ref.subject_type.clone());
            }
        }
    }
    ReferencedRelation {
        needs_full_check: needs_full_check(schema, closure, object_type, relation),
        satisfying,
        direct_relations,
        direct_subject_types: dedup(direct_subject_types),
        wildcard_subject_types: dedup(wildcard_subject_types),
    }
}

/// Whether a relation's own definition denies-or-extends beyond direct
/// tuples and implied-by edges.
fn is_guarded(definition: &RelationDefinition) -> bool {
    !definition.parent_relations.is_empty()
        || !definition.exclusions.is_empty()
        || !definition.excluded_parent_relations.is_empty()
        || !definition.excluded_intersection_groups.is_empty()
}

/// Whether evaluating `(object_type, relation)` requires the recursive
/// check rather than a direct-tuple scan over its closure.
pub(crate) fn needs_full_check(
    schema: &Schema,
    closure: &Closure,
    object_type: &str,
    relation: &str,
) -> bool {
    closure
        .satisfying(object_type, relation)
        .iter()
        .any(|satisfying| {
            schema
                .relation(object_type, satisfying)
                .map(|def| {
                    is_guarded(def)
                        || !def.intersection_groups.is_empty()
                        || def.subject_types.iter().any(|r| r.sub_relation.is_some())
                })
                .unwrap_or(false)
        })
}

fn userset_patterns(
    schema: &Schema,
    closure: &Closure,
    object_type: &str,
    relation: &str,
    direct_relations: &[String],
) -> Vec<UsersetPattern> {
    let rules: Vec<_> = closure
        .userset_rules_for(object_type, relation)
        .iter()
        .filter(|rule| direct_relations.contains(&rule.tuple_relation))
        .collect();

    // Group by (subject_type, subject_relation), preserving first-seen order;
    // rules for one pair are not necessarily adjacent.
    let mut keys: Vec<(String, String)> = Vec::new();
    for rule in &rules {
        let key = (rule.subject_type.clone(), rule.subject_relation.clone());
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut patterns = Vec::new();
    for (subject_type, subject_relation) in keys {
        let group: Vec<_> = rules
            .iter()
            .filter(|r| r.subject_type == subject_type && r.subject_relation == subject_relation)
            .collect();
        let satisfying_relations =
            dedup(group.iter().map(|r| r.subject_relation_satisfying.clone()).collect());
        let source_relations = dedup(group.iter().map(|r| r.tuple_relation.clone()).collect());

        let is_complex = needs_full_check(schema, closure, &subject_type, &subject_relation);
        let member_closure = satisfying_relations
            .iter()
            .flat_map(|satisfying| {
                closure
                    .rows_for(&subject_type, satisfying)
                    .iter()
                    .map(|row| (row.relation.clone(), row.satisfying_relation.clone()))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let has_wildcard = satisfying_relations.iter().any(|satisfying| {
            schema
                .relation(&subject_type, satisfying)
                .map(|def| {
                    def.subject_types
                        .iter()
                        .any(|r| r.wildcard && r.sub_relation.is_none())
                })
                .unwrap_or(false)
        });

        patterns.push(UsersetPattern {
            is_closure: source_relations.iter().any(|s| s != relation),
            subject_type,
            subject_relation,
            satisfying_relations,
            source_relations,
            member_closure: dedup(member_closure),
            is_complex,
            has_wildcard,
        });
    }
    patterns
}

fn parent_data(
    subject_types: &mut SubjectTypeResolver,
    object_type: &str,
    relation: &str,
    target: &str,
    linking: &str,
) -> ParentRelationData {
    let allowed_linking_types = subject_types.resolve(object_type, linking);
    let self_referential =
        target == relation && allowed_linking_types.iter().any(|t| t == object_type);
    let cross_type = allowed_linking_types.iter().any(|t| t != object_type);
    ParentRelationData {
        target: target.to_string(),
        linking: linking.to_string(),
        allowed_linking_types,
        self_referential,
        cross_type,
    }
}

/// Longest static chain of userset hops from `(object_type, relation)`.
/// Cyclic (self-referential) chains are runtime-bounded and skipped here.
fn userset_depth(
    closure: &Closure,
    object_type: &str,
    relation: &str,
    on_path: &mut HashSet<(String, String)>,
) -> usize {
    let key = (object_type.to_string(), relation.to_string());
    if !on_path.insert(key.clone()) {
        return 0;
    }

    let mut depth = 0;
    let hops: Vec<_> = closure
        .userset_rules_for(object_type, relation)
        .iter()
        .map(|rule| (rule.subject_type.clone(), rule.subject_relation.clone()))
        .sorted()
        .dedup()
        .collect();
    for (subject_type, subject_relation) in hops {
        depth = depth.max(1 + userset_depth(closure, &subject_type, &subject_relation, on_path));
    }

    on_path.remove(&key);
    depth
}

/// Rejects tuple-to-userset loops through differing relations. A parent
/// edge pointing back at the same `(type, relation)` is the sanctioned
/// recursion the recursive templates compile; anything else that loops is a
/// cycle.
fn check_parent_loops(analyses: &[RelationAnalysis]) -> Result<(), Error> {
    let dependencies: Vec<((String, String), Vec<(String, String)>)> = analyses
        .iter()
        .map(|analysis| {
            let node = (analysis.object_type.clone(), analysis.relation.clone());
            let edges = analysis
                .parents
                .iter()
                .flat_map(|parent| {
                    parent
                        .allowed_linking_types
                        .iter()
                        .map(|linking_type| (linking_type.clone(), parent.target.clone()))
                        .collect::<Vec<_>>()
                })
                .filter(|edge| *edge != node)
                .collect();
            (node, edges)
        })
        .collect();

    if toposort(&dependencies).is_none() {
        let involved = dependencies
            .iter()
            .filter(|(_, edges)| !edges.is_empty())
            .map(|((t, r), _)| format!("{t}#{r}"))
            .collect_vec();
        return Err(Error::new(
            ErrorKind::CyclicSchema,
            Reason::Simple(format!(
                "tuple-to-userset edges form a loop through differing relations (among: {})",
                involved.join(", ")
            )),
        ));
    }
    Ok(())
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

/// Memoised fixpoint over the closed set of concrete subject types a
/// relation admits, following userset refs, parent edges and intersection
/// parts. In-progress pairs contribute nothing, which keeps the resolver
/// total even on graphs the loop check later rejects.
struct SubjectTypeResolver<'a> {
    schema: &'a Schema,
    closure: &'a Closure,
    memo: HashMap<(String, String), Vec<String>>,
    in_progress: HashSet<(String, String)>,
}

impl<'a> SubjectTypeResolver<'a> {
    fn new(schema: &'a Schema, closure: &'a Closure) -> Self {
        SubjectTypeResolver {
            schema,
            closure,
            memo: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    fn resolve(&mut self, object_type: &str, relation: &str) -> Vec<String> {
        let key = (object_type.to_string(), relation.to_string());
        if let Some(cached) = self.memo.get(&key) {
            return cached.clone();
        }
        if !self.in_progress.insert(key.clone()) {
            return Vec::new();
        }

        let mut out = Vec::new();
        for satisfying in self.closure.satisfying(object_type, relation) {
            let Some(def) = self.schema.relation(object_type, &satisfying) else {
                continue;
            };
            let def = def.clone();
            for subject_ref in &def.subject_types {
                match &subject_ref.sub_relation {
                    None => out.push(subject_ref.subject_type.clone()),
                    Some(sub) => out.extend(self.resolve(&subject_ref.subject_type, sub)),
                }
            }
            for parent in &def.parent_relations {
                for linking_type in self.resolve(object_type, &parent.linking) {
                    out.extend(self.resolve(&linking_type, &parent.target));
                }
            }
            for group in &def.intersection_groups {
                for part in &group.relations {
                    out.extend(self.resolve(object_type, part));
                }
                for parent in &group.parent_relations {
                    for linking_type in self.resolve(object_type, &parent.linking) {
                        out.extend(self.resolve(&linking_type, &parent.target));
                    }
                }
            }
        }

        let out = dedup(out).into_iter().sorted().collect_vec();
        self.in_progress.remove(&key);
        self.memo.insert(key, out.clone());
        out
    }
}
