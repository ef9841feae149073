//! Simple tests for "this model compiles to these routines" go here.

use crate::model::{RelationDecl, Rule, SubjectTypeRef, TypeDefinition};
use crate::{compile, ErrorKind, Operation, Options, Template};

fn type_def(name: &str, relations: Vec<(&str, Rule)>) -> TypeDefinition {
    TypeDefinition {
        name: name.to_string(),
        relations: relations
            .into_iter()
            .map(|(name, rule)| RelationDecl {
                name: name.to_string(),
                rule,
            })
            .collect(),
    }
}

fn compile_model(types: Vec<TypeDefinition>) -> crate::Migration {
    compile(&types, &Options::default().no_signature()).unwrap()
}

#[test]
fn test_direct() {
    // doc.owner: [user]
    let migration = compile_model(vec![type_def(
        "doc",
        vec![("owner", Rule::this(vec![SubjectTypeRef::plain("user")]))],
    )]);

    let check = migration.routine_for(Operation::Check, "doc", "owner").unwrap();
    assert!(check.sql.contains("t.object_type = 'doc'"));
    assert!(check.sql.contains("t.relation = 'owner'"));
    assert!(check.sql.contains("t.subject_type = p_subject_type"));
    assert!(check.sql.contains("position('#' in t.subject_id) = 0"));

    let objects = migration
        .routine_for(Operation::ListObjects, "doc", "owner")
        .unwrap();
    assert!(objects.sql.contains("SELECT DISTINCT r.object_id"));

    let subjects = migration
        .routine_for(Operation::ListSubjects, "doc", "owner")
        .unwrap();
    assert!(subjects.sql.contains("t.subject_type = p_subject_type"));
}

#[test]
fn test_implied() {
    // org.admin: [user]; org.member: admin
    let migration = compile_model(vec![type_def(
        "org",
        vec![
            ("admin", Rule::this(vec![SubjectTypeRef::plain("user")])),
            ("member", Rule::computed("admin")),
        ],
    )]);

    // the closure folds admin into member's direct scan
    let check = migration.routine_for(Operation::Check, "org", "member").unwrap();
    assert!(check.sql.contains("t.relation IN ('member', 'admin')"));

    let subjects = migration
        .routine_for(Operation::ListSubjects, "org", "member")
        .unwrap();
    assert!(subjects.sql.contains("t.relation IN ('member', 'admin')"));
}

#[test]
fn test_tuple_to_userset() {
    // repo.org: [org]; repo.viewer: viewer from org; org.viewer: [user]
    let migration = compile_model(vec![
        type_def(
            "repo",
            vec![
                ("org", Rule::this(vec![SubjectTypeRef::plain("org")])),
                ("viewer", Rule::ttu("viewer", "org")),
            ],
        ),
        type_def("org", vec![("viewer", Rule::this(vec![SubjectTypeRef::plain("user")]))]),
    ]);

    let check = migration.routine_for(Operation::Check, "repo", "viewer").unwrap();
    assert!(check.sql.contains("l.relation = 'org'"));
    assert!(check.sql.contains(
        "check_permission_internal(p_subject_type, p_subject_id, 'viewer', l.subject_type, l.subject_id, p_visited || v_key) = 1"
    ));

    // pure anchors compose through the org routine
    let objects = migration
        .routine_for(Operation::ListObjects, "repo", "viewer")
        .unwrap();
    assert_eq!(template_of(objects), Template::Composed);
    assert!(objects
        .sql
        .contains("FROM list_objects_org_viewer(p_subject_type, p_subject_id) AS anchor(object_id)"));
}

#[test]
fn test_userset() {
    // doc.viewer: [group#member]; group.member: [user]
    let migration = compile_model(vec![
        type_def(
            "doc",
            vec![("viewer", Rule::this(vec![SubjectTypeRef::userset("group", "member")]))],
        ),
        type_def("group", vec![("member", Rule::this(vec![SubjectTypeRef::plain("user")]))]),
    ]);

    let check = migration.routine_for(Operation::Check, "doc", "viewer").unwrap();
    assert!(check.sql.contains("split_part(t.subject_id, '#', 2)"));
    assert!(check.sql.contains("INNER JOIN melange_tuples AS m"));
    assert!(check.sql.contains("(VALUES ('member', 'member')) AS c(relation, satisfying_relation)"));

    let subjects = migration
        .routine_for(Operation::ListSubjects, "doc", "viewer")
        .unwrap();
    // userset filter normalises to `<id>#<relation>`
    assert!(subjects.sql.contains("IF position('#' in p_subject_type) > 0 THEN"));
    assert!(subjects.sql.contains(
        "split_part(t.subject_id, '#', 1) || '#' || split_part(p_subject_type, '#', 2)"
    ));
}

#[test]
fn test_exclusion() {
    // doc.viewer: [user] but not blocked; doc.blocked: [user]
    let migration = compile_model(vec![type_def(
        "doc",
        vec![
            ("blocked", Rule::this(vec![SubjectTypeRef::plain("user")])),
            (
                "viewer",
                Rule::difference(
                    Rule::this(vec![SubjectTypeRef::plain("user")]),
                    Rule::computed("blocked"),
                ),
            ),
        ],
    )]);

    let check = migration.routine_for(Operation::Check, "doc", "viewer").unwrap();
    assert_eq!(template_of(check), Template::Exclusion);
    assert!(check.sql.contains("NOT EXISTS (SELECT 1 FROM melange_tuples AS x"));
    assert!(check.sql.contains("x.relation = 'blocked'"));

    let objects = migration
        .routine_for(Operation::ListObjects, "doc", "viewer")
        .unwrap();
    assert!(objects.sql.contains("x.object_id = r.object_id"));
}

#[test]
fn test_intersection_with_recursion() {
    // folder.can_view: viewer and (member from group or owner from group),
    // folders chained by parent
    let migration = compile_model(vec![
        type_def(
            "folder",
            vec![
                ("parent", Rule::this(vec![SubjectTypeRef::plain("folder")])),
                ("group", Rule::this(vec![SubjectTypeRef::plain("group")])),
                ("viewer", Rule::this(vec![SubjectTypeRef::plain("user")])),
                (
                    "can_view",
                    Rule::Union(vec![
                        Rule::Intersection(vec![
                            Rule::computed("viewer"),
                            Rule::Union(vec![
                                Rule::ttu("member", "group"),
                                Rule::ttu("owner", "group"),
                            ]),
                        ]),
                        Rule::ttu("can_view", "parent"),
                    ]),
                ),
            ],
        ),
        type_def(
            "group",
            vec![
                ("member", Rule::this(vec![SubjectTypeRef::plain("user")])),
                ("owner", Rule::this(vec![SubjectTypeRef::plain("user")])),
            ],
        ),
    ]);

    let check = migration
        .routine_for(Operation::Check, "folder", "can_view")
        .unwrap();
    assert_eq!(template_of(check), Template::Intersection);
    // distributed groups: {viewer, member-from-group} and {viewer, owner-from-group}
    assert!(check.sql.contains("t.relation = 'viewer'"));
    assert!(check.sql.contains("'member', l.subject_type"));
    assert!(check.sql.contains("'owner', l.subject_type"));
    // the recursive parent edge is present alongside
    assert!(check.sql.contains("l.relation = 'parent'"));

    let objects = migration
        .routine_for(Operation::ListObjects, "folder", "can_view")
        .unwrap();
    assert!(objects.sql.contains("INTERSECT"));
}

#[test]
fn test_wildcard() {
    // doc.viewer: [user:*]
    let migration = compile_model(vec![type_def(
        "doc",
        vec![("viewer", Rule::this(vec![SubjectTypeRef::wildcard("user")]))],
    )]);

    let check = migration.routine_for(Operation::Check, "doc", "viewer").unwrap();
    assert!(check.sql.contains("t.subject_id = '*'"));
    assert!(check.sql.contains("p_allow_wildcard"));

    let subjects = migration
        .routine_for(Operation::ListSubjects, "doc", "viewer")
        .unwrap();
    // the wildcard surfaces as a literal row and gates a re-check
    assert!(subjects.sql.contains("bool_or(x.subject_id = '*')"));
    assert!(subjects.sql.contains("check_permission_no_wildcard"));
}

#[test]
fn test_empty_model() {
    let migration = compile_model(vec![]);
    assert_eq!(migration.function_names().len(), 6);
    assert!(migration
        .function_names()
        .iter()
        .all(|name| name.starts_with("check_permission") || name.starts_with("list_accessible")));
}

#[test]
fn test_depth_ceiling_boundary() {
    // a three-hop userset chain: doc.viewer -> team#member -> squad#member
    let types = vec![
        type_def(
            "doc",
            vec![("viewer", Rule::this(vec![SubjectTypeRef::userset("team", "member")]))],
        ),
        type_def(
            "team",
            vec![(
                "member",
                Rule::this(vec![
                    SubjectTypeRef::plain("user"),
                    SubjectTypeRef::userset("squad", "member"),
                ]),
            )],
        ),
        type_def(
            "squad",
            vec![("member", Rule::this(vec![SubjectTypeRef::plain("user")]))],
        ),
    ];

    // depth 3 == ceiling: compiles normally
    let at_ceiling = compile(&types, &Options::default().with_depth_ceiling(3)).unwrap();
    let routine = at_ceiling.routine_for(Operation::Check, "doc", "viewer").unwrap();
    assert_ne!(template_of(routine), Template::DepthExceeded);

    // ceiling + 1 exceeded: the routine raises instead of evaluating
    let beyond = compile(&types, &Options::default().with_depth_ceiling(2)).unwrap();
    let routine = beyond.routine_for(Operation::Check, "doc", "viewer").unwrap();
    assert_eq!(template_of(routine), Template::DepthExceeded);
    assert!(routine
        .sql
        .contains("RAISE EXCEPTION 'resolution too complex' USING ERRCODE = 'M2002';"));
    assert!(!routine.sql.contains("RETURN 1"));
}

#[test]
fn test_cyclic_model_fails_before_emission() {
    let err = compile(
        &[type_def(
            "doc",
            vec![
                ("a", Rule::computed("b")),
                ("b", Rule::computed("a")),
            ],
        )],
        &Options::default(),
    )
    .unwrap_err();
    assert_eq!(err.inner[0].kind, Some(ErrorKind::CyclicSchema));
}

#[test]
fn test_invalid_construct_fails() {
    let mut conditioned = SubjectTypeRef::plain("user");
    conditioned.condition = Some("office_hours".to_string());
    let err = compile(
        &[type_def("doc", vec![("viewer", Rule::this(vec![conditioned]))])],
        &Options::default(),
    )
    .unwrap_err();
    assert_eq!(err.inner[0].kind, Some(ErrorKind::InvalidModel));
}

#[test]
fn test_json_round_trip() {
    let types = vec![type_def(
        "doc",
        vec![("owner", Rule::this(vec![SubjectTypeRef::plain("user")]))],
    )];
    let json = crate::json_of_model(&types).unwrap();
    let round = crate::model_of_json(&json).unwrap();
    assert_eq!(types, round);
}

#[test]
fn test_checksum_is_stable_and_model_sensitive() {
    let types = vec![type_def(
        "doc",
        vec![("owner", Rule::this(vec![SubjectTypeRef::plain("user")]))],
    )];
    let schema = crate::schema_of_model(&types).unwrap();
    let a = crate::schema_checksum(&schema);
    let b = crate::schema_checksum(&schema);
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);

    let other = crate::schema_of_model(&[type_def(
        "doc",
        vec![("editor", Rule::this(vec![SubjectTypeRef::plain("user")]))],
    )])
    .unwrap();
    assert_ne!(a, crate::schema_checksum(&other));
}

#[test]
fn test_output_is_deterministic() {
    let types = vec![
        type_def(
            "doc",
            vec![
                ("blocked", Rule::this(vec![SubjectTypeRef::plain("user")])),
                (
                    "viewer",
                    Rule::difference(
                        Rule::Union(vec![
                            Rule::this(vec![SubjectTypeRef::plain("user")]),
                            Rule::this(vec![SubjectTypeRef::userset("group", "member")]),
                        ]),
                        Rule::computed("blocked"),
                    ),
                ),
            ],
        ),
        type_def(
            "group",
            vec![("member", Rule::this(vec![SubjectTypeRef::plain("user")]))],
        ),
    ];
    let first = compile_model(types.clone());
    let second = compile_model(types);
    similar_asserts::assert_eq!(first.script(), second.script());
    assert_eq!(first.schema_checksum, second.schema_checksum);
}

#[test]
fn test_every_routine_is_stable() {
    let migration = compile_model(vec![type_def(
        "doc",
        vec![("owner", Rule::this(vec![SubjectTypeRef::plain("user")]))],
    )]);
    for routine in &migration.routines {
        assert!(routine.sql.contains("STABLE"), "{} is not STABLE", routine.name);
    }
}

fn template_of(routine: &crate::Routine) -> Template {
    match &routine.kind {
        crate::RoutineKind::Specialised { template, .. } => *template,
        crate::RoutineKind::Dispatcher => panic!("dispatcher routine"),
    }
}
