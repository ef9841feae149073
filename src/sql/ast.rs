//! SQL expression tree
//!
//! A closed vocabulary of expressions with one [ToSql] rendering method per
//! node. Rendering is deterministic: equal inputs produce identical text.
//! String literals double their single quotes; identifiers are folded to
//! `[a-z0-9_]`.

use super::stmt::Query;

/// Renders a node into the target dialect's text.
pub trait ToSql {
    fn sql(&self) -> String;
}

/// Doubles single quotes inside a string literal.
pub fn escape_str(value: &str) -> String {
    value.replace('\'', "''")
}

/// Folds an identifier to lowercase `[a-z0-9_]`; anything else becomes `_`.
pub fn sanitize_ident(ident: &str) -> String {
    ident
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Expected outcome of an embedded permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Allow,
    Deny,
}

/// Which check routine an embedded [SqlExpr::CheckPermission] targets.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckRoutine {
    /// `check_permission_internal`, threading a visited array.
    Internal { visited: Box<SqlExpr> },
    /// `check_permission_no_wildcard`.
    NoWildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// `alias.column`
    Column(String, String),
    /// A routine parameter, rendered verbatim.
    Param(String),
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
    /// `ARRAY[]::TEXT[]`
    EmptyTextArray,
    /// Escape hatch; rendered verbatim.
    Raw(String),

    /// `a || b || ...`
    Concat(Vec<SqlExpr>),
    /// `position(needle in haystack)`
    Position {
        needle: Box<SqlExpr>,
        haystack: Box<SqlExpr>,
    },
    /// `substring(expr from start [for len])`
    Substring {
        expr: Box<SqlExpr>,
        start: Box<SqlExpr>,
        length: Option<Box<SqlExpr>>,
    },
    /// `split_part(expr, delimiter, index)`
    SplitPart {
        expr: Box<SqlExpr>,
        delimiter: String,
        index: i64,
    },

    /// Object id of a `"<id>#<relation>"` userset string.
    UsersetObjectId(Box<SqlExpr>),
    /// Relation of a `"<id>#<relation>"` userset string.
    UsersetRelation(Box<SqlExpr>),
    /// The string carries a userset marker.
    HasUserset(Box<SqlExpr>),
    /// The string is a plain id.
    NoUserset(Box<SqlExpr>),

    Eq(Box<SqlExpr>, Box<SqlExpr>),
    Ne(Box<SqlExpr>, Box<SqlExpr>),
    Lt(Box<SqlExpr>, Box<SqlExpr>),
    Gt(Box<SqlExpr>, Box<SqlExpr>),
    Le(Box<SqlExpr>, Box<SqlExpr>),
    Ge(Box<SqlExpr>, Box<SqlExpr>),
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    Not(Box<SqlExpr>),
    /// `expr IN (items)`; an empty list renders FALSE.
    InList {
        expr: Box<SqlExpr>,
        items: Vec<SqlExpr>,
    },
    /// `needle = ANY (array)`
    AnyOf {
        needle: Box<SqlExpr>,
        array: Box<SqlExpr>,
    },
    /// `expr IN (SELECT ...)`
    InSubquery {
        expr: Box<SqlExpr>,
        query: Box<Query>,
    },
    IsNull(Box<SqlExpr>),
    Exists(Box<Query>),
    NotExists(Box<Query>),
    /// Scalar subquery.
    Subquery(Box<Query>),
    FuncCall {
        name: String,
        args: Vec<SqlExpr>,
    },

    /// Call into the recursive check with an expected outcome.
    CheckPermission {
        routine: CheckRoutine,
        subject_type: Box<SqlExpr>,
        subject_id: Box<SqlExpr>,
        relation: Box<SqlExpr>,
        object_type: Box<SqlExpr>,
        object_id: Box<SqlExpr>,
        expect: Expect,
    },
    /// Id equality with an optional wildcard arm gated on a flag.
    SubjectIdMatch {
        column: Box<SqlExpr>,
        value: Box<SqlExpr>,
        wildcard_gate: Option<Box<SqlExpr>>,
    },
}

impl SqlExpr {
    pub fn col(alias: &str, column: &str) -> SqlExpr {
        SqlExpr::Column(sanitize_ident(alias), sanitize_ident(column))
    }

    pub fn param(name: &str) -> SqlExpr {
        SqlExpr::Param(name.to_string())
    }

    pub fn str(value: &str) -> SqlExpr {
        SqlExpr::Str(value.to_string())
    }

    pub fn eq(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::Eq(Box::new(left), Box::new(right))
    }

    pub fn ne(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::Ne(Box::new(left), Box::new(right))
    }

    pub fn and(exprs: Vec<SqlExpr>) -> SqlExpr {
        let mut exprs = exprs;
        if exprs.len() == 1 {
            exprs.remove(0)
        } else {
            SqlExpr::And(exprs)
        }
    }

    pub fn or(exprs: Vec<SqlExpr>) -> SqlExpr {
        let mut exprs = exprs;
        if exprs.len() == 1 {
            exprs.remove(0)
        } else {
            SqlExpr::Or(exprs)
        }
    }

    pub fn not(expr: SqlExpr) -> SqlExpr {
        SqlExpr::Not(Box::new(expr))
    }

    /// `expr IN (...)`, collapsing a single item to equality.
    pub fn in_strings(expr: SqlExpr, items: &[String]) -> SqlExpr {
        match items {
            [single] => SqlExpr::eq(expr, SqlExpr::str(single)),
            items => SqlExpr::InList {
                expr: Box::new(expr),
                items: items.iter().map(|s| SqlExpr::str(s)).collect(),
            },
        }
    }

    pub fn func(name: &str, args: Vec<SqlExpr>) -> SqlExpr {
        SqlExpr::FuncCall {
            name: name.to_string(),
            args,
        }
    }

    fn operand_sql(&self) -> String {
        match self {
            SqlExpr::And(_) | SqlExpr::Or(_) => format!("({})", self.sql()),
            _ => self.sql(),
        }
    }
}

impl ToSql for SqlExpr {
    fn sql(&self) -> String {
        match self {
            SqlExpr::Column(alias, column) => format!("{alias}.{column}"),
            SqlExpr::Param(name) => name.clone(),
            SqlExpr::Str(value) => format!("'{}'", escape_str(value)),
            SqlExpr::Int(value) => value.to_string(),
            SqlExpr::Bool(true) => "TRUE".to_string(),
            SqlExpr::Bool(false) => "FALSE".to_string(),
            SqlExpr::Null => "NULL".to_string(),
            SqlExpr::EmptyTextArray => "ARRAY[]::TEXT[]".to_string(),
            SqlExpr::Raw(text) => text.clone(),

            SqlExpr::Concat(parts) => parts
                .iter()
                .map(SqlExpr::operand_sql)
                .collect::<Vec<_>>()
                .join(" || "),
            SqlExpr::Position { needle, haystack } => {
                format!("position({} in {})", needle.sql(), haystack.sql())
            }
            SqlExpr::Substring { expr, start, length } => match length {
                Some(length) => format!(
                    "substring({} from {} for {})",
                    expr.sql(),
                    start.sql(),
                    length.sql()
                ),
                None => format!("substring({} from {})", expr.sql(), start.sql()),
            },
            SqlExpr::SplitPart {
                expr,
                delimiter,
                index,
            } => format!(
                "split_part({}, '{}', {index})",
                expr.sql(),
                escape_str(delimiter)
            ),

            SqlExpr::UsersetObjectId(expr) => format!("split_part({}, '#', 1)", expr.sql()),
            SqlExpr::UsersetRelation(expr) => format!("split_part({}, '#', 2)", expr.sql()),
            SqlExpr::HasUserset(expr) => format!("position('#' in {}) > 0", expr.sql()),
            SqlExpr::NoUserset(expr) => format!("position('#' in {}) = 0", expr.sql()),

            SqlExpr::Eq(l, r) => format!("{} = {}", l.sql(), r.sql()),
            SqlExpr::Ne(l, r) => format!("{} <> {}", l.sql(), r.sql()),
            SqlExpr::Lt(l, r) => format!("{} < {}", l.sql(), r.sql()),
            SqlExpr::Gt(l, r) => format!("{} > {}", l.sql(), r.sql()),
            SqlExpr::Le(l, r) => format!("{} <= {}", l.sql(), r.sql()),
            SqlExpr::Ge(l, r) => format!("{} >= {}", l.sql(), r.sql()),
            SqlExpr::And(parts) => parts
                .iter()
                .map(SqlExpr::operand_sql)
                .collect::<Vec<_>>()
                .join(" AND "),
            SqlExpr::Or(parts) => parts
                .iter()
                .map(SqlExpr::operand_sql)
                .collect::<Vec<_>>()
                .join(" OR "),
            SqlExpr::Not(expr) => format!("NOT ({})", expr.sql()),
            SqlExpr::InList { expr, items } => {
                if items.is_empty() {
                    return "FALSE".to_string();
                }
                let items = items.iter().map(|i| i.sql()).collect::<Vec<_>>().join(", ");
                format!("{} IN ({items})", expr.sql())
            }
            SqlExpr::AnyOf { needle, array } => {
                format!("{} = ANY ({})", needle.sql(), array.sql())
            }
            SqlExpr::InSubquery { expr, query } => {
                format!("{} IN ({})", expr.sql(), query.sql())
            }
            SqlExpr::IsNull(expr) => format!("{} IS NULL", expr.sql()),
            SqlExpr::Exists(query) => format!("EXISTS ({})", query.sql()),
            SqlExpr::NotExists(query) => format!("NOT EXISTS ({})", query.sql()),
            SqlExpr::Subquery(query) => format!("({})", query.sql()),
            SqlExpr::FuncCall { name, args } => {
                let args = args.iter().map(|a| a.sql()).collect::<Vec<_>>().join(", ");
                format!("{name}({args})")
            }

            SqlExpr::CheckPermission {
                routine,
                subject_type,
                subject_id,
                relation,
                object_type,
                object_id,
                expect,
            } => {
                let outcome = match expect {
                    Expect::Allow => 1,
                    Expect::Deny => 0,
                };
                let mut args = vec![
                    subject_type.sql(),
                    subject_id.sql(),
                    relation.sql(),
                    object_type.sql(),
                    object_id.sql(),
                ];
                let name = match routine {
                    CheckRoutine::Internal { visited } => {
                        args.push(visited.sql());
                        "check_permission_internal"
                    }
                    CheckRoutine::NoWildcard => "check_permission_no_wildcard",
                };
                format!("{name}({}) = {outcome}", args.join(", "))
            }
            SqlExpr::SubjectIdMatch {
                column,
                value,
                wildcard_gate,
            } => match wildcard_gate {
                None => format!("{} = {}", column.sql(), value.sql()),
                // an unconditional gate collapses away
                Some(gate) if **gate == SqlExpr::Bool(true) => format!(
                    "({} = {} OR {} = '*')",
                    column.sql(),
                    value.sql(),
                    column.sql()
                ),
                Some(gate) => format!(
                    "({} = {} OR ({} AND {} = '*'))",
                    column.sql(),
                    value.sql(),
                    gate.sql(),
                    column.sql()
                ),
            },
        }
    }
}

/// A `(type, id)` pair naming a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRef {
    pub subject_type: SqlExpr,
    pub subject_id: SqlExpr,
}

impl SubjectRef {
    /// The routine's subject parameters.
    pub fn params() -> Self {
        SubjectRef {
            subject_type: SqlExpr::param("p_subject_type"),
            subject_id: SqlExpr::param("p_subject_id"),
        }
    }

    pub fn columns(alias: &str) -> Self {
        SubjectRef {
            subject_type: SqlExpr::col(alias, "subject_type"),
            subject_id: SqlExpr::col(alias, "subject_id"),
        }
    }

    pub fn literal(subject_type: &str, subject_id: &str) -> Self {
        SubjectRef {
            subject_type: SqlExpr::str(subject_type),
            subject_id: SqlExpr::str(subject_id),
        }
    }
}

/// A `(type, id)` pair naming an object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRef {
    pub object_type: SqlExpr,
    pub object_id: SqlExpr,
}

impl ObjectRef {
    /// The routine's object parameters.
    pub fn params() -> Self {
        ObjectRef {
            object_type: SqlExpr::param("p_object_type"),
            object_id: SqlExpr::param("p_object_id"),
        }
    }

    pub fn columns(alias: &str) -> Self {
        ObjectRef {
            object_type: SqlExpr::col(alias, "object_type"),
            object_id: SqlExpr::col(alias, "object_id"),
        }
    }

    pub fn literal(object_type: &str, object_id: &str) -> Self {
        ObjectRef {
            object_type: SqlExpr::str(object_type),
            object_id: SqlExpr::str(object_id),
        }
    }
}
