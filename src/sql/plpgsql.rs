//! Procedural-block statements and routine builders.
//!
//! [PlpgsqlFunction] composes a signature, declarations, a statement body
//! and the language/volatility footer. [SqlFunction] is its sibling for
//! single-expression routines in the dialect's pure-SQL language.

use super::ast::{sanitize_ident, SqlExpr, ToSql};
use super::dialect::DialectHandler;
use super::stmt::Query;

/// One routine parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: String,
    pub default: Option<String>,
}

impl Param {
    pub fn new(name: &str, ty: &str) -> Self {
        Param {
            name: name.to_string(),
            ty: ty.to_string(),
            default: None,
        }
    }

    pub fn with_default(name: &str, ty: &str, default: &str) -> Self {
        Param {
            default: Some(default.to_string()),
            ..Param::new(name, ty)
        }
    }

    fn sql(&self) -> String {
        match &self.default {
            Some(default) => format!("{} {} DEFAULT {default}", self.name, self.ty),
            None => format!("{} {}", self.name, self.ty),
        }
    }
}

/// One statement of a procedural body.
#[derive(Debug, Clone, PartialEq)]
pub enum PlStatement {
    /// `variable := expression;`
    Assign { name: String, value: SqlExpr },
    If {
        condition: SqlExpr,
        then: Vec<PlStatement>,
        otherwise: Vec<PlStatement>,
    },
    ReturnQuery(Query),
    Return(SqlExpr),
    Raise { message: String, errcode: String },
    Comment(String),
    Raw(String),
}

impl PlStatement {
    /// The structured "resolution too complex" error.
    pub fn raise_too_complex() -> PlStatement {
        PlStatement::Raise {
            message: "resolution too complex".to_string(),
            errcode: "M2002".to_string(),
        }
    }

    fn render(&self, out: &mut String, indent: usize) {
        let pad = "    ".repeat(indent);
        match self {
            PlStatement::Assign { name, value } => {
                out.push_str(&format!("{pad}{name} := {};\n", value.sql()));
            }
            PlStatement::If {
                condition,
                then,
                otherwise,
            } => {
                out.push_str(&format!("{pad}IF {} THEN\n", condition.sql()));
                for statement in then {
                    statement.render(out, indent + 1);
                }
                if !otherwise.is_empty() {
                    out.push_str(&format!("{pad}ELSE\n"));
                    for statement in otherwise {
                        statement.render(out, indent + 1);
                    }
                }
                out.push_str(&format!("{pad}END IF;\n"));
            }
            PlStatement::ReturnQuery(query) => {
                out.push_str(&format!("{pad}RETURN QUERY\n"));
                for line in query.sql().lines() {
                    out.push_str(&format!("{pad}{line}\n"));
                }
                // terminate the query statement
                let trimmed = out.trim_end_matches('\n').len();
                out.truncate(trimmed);
                out.push_str(";\n");
            }
            PlStatement::Return(expr) => {
                out.push_str(&format!("{pad}RETURN {};\n", expr.sql()));
            }
            PlStatement::Raise { message, errcode } => {
                out.push_str(&format!(
                    "{pad}RAISE EXCEPTION '{}' USING ERRCODE = '{}';\n",
                    super::ast::escape_str(message),
                    super::ast::escape_str(errcode)
                ));
            }
            PlStatement::Comment(text) => {
                out.push_str(&format!("{pad}-- {text}\n"));
            }
            PlStatement::Raw(text) => {
                out.push_str(&format!("{pad}{text}\n"));
            }
        }
    }
}

/// One local variable of a procedural routine.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub ty: String,
    pub default: Option<SqlExpr>,
}

/// Builder for a procedural routine.
#[derive(Debug, Clone, PartialEq)]
pub struct PlpgsqlFunction {
    name: String,
    params: Vec<Param>,
    returns: String,
    declarations: Vec<Declaration>,
    body: Vec<PlStatement>,
    comment: Option<String>,
}

impl PlpgsqlFunction {
    pub fn new(name: &str, returns: &str) -> Self {
        PlpgsqlFunction {
            name: sanitize_ident(name),
            params: Vec::new(),
            returns: returns.to_string(),
            declarations: Vec::new(),
            body: Vec::new(),
            comment: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn declare(mut self, name: &str, ty: &str, default: Option<SqlExpr>) -> Self {
        self.declarations.push(Declaration {
            name: name.to_string(),
            ty: ty.to_string(),
            default,
        });
        self
    }

    pub fn statement(mut self, statement: PlStatement) -> Self {
        self.body.push(statement);
        self
    }

    pub fn statements(mut self, statements: Vec<PlStatement>) -> Self {
        self.body.extend(statements);
        self
    }

    /// Leading `--` comment inside the body, naming what produced the
    /// routine.
    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn sql(&self, dialect: &dyn DialectHandler) -> String {
        let create = if dialect.create_or_replace() {
            "CREATE OR REPLACE FUNCTION"
        } else {
            "CREATE FUNCTION"
        };
        let params = self
            .params
            .iter()
            .map(Param::sql)
            .collect::<Vec<_>>()
            .join(",\n    ");
        let tag = dialect.dollar_tag();

        let mut out = format!(
            "{create} {}(\n    {params}\n) RETURNS {}\nLANGUAGE {} {}\nAS ${tag}$\n",
            self.name,
            self.returns,
            dialect.procedural_language(),
            dialect.stable_marker(),
        );
        if let Some(comment) = &self.comment {
            out.push_str(&format!("-- {comment}\n"));
        }
        if !self.declarations.is_empty() {
            out.push_str("DECLARE\n");
            for declaration in &self.declarations {
                match &declaration.default {
                    Some(default) => out.push_str(&format!(
                        "    {} {} := {};\n",
                        declaration.name,
                        declaration.ty,
                        default.sql()
                    )),
                    None => out.push_str(&format!("    {} {};\n", declaration.name, declaration.ty)),
                }
            }
        }
        out.push_str("BEGIN\n");
        for statement in &self.body {
            statement.render(&mut out, 1);
        }
        out.push_str(&format!("END;\n${tag}$;\n"));
        out
    }
}

/// Builder for a single-expression routine in the pure-SQL language.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFunction {
    name: String,
    params: Vec<Param>,
    returns: String,
    body: SqlExpr,
    comment: Option<String>,
}

impl SqlFunction {
    pub fn new(name: &str, returns: &str, body: SqlExpr) -> Self {
        SqlFunction {
            name: sanitize_ident(name),
            params: Vec::new(),
            returns: returns.to_string(),
            body,
            comment: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn sql(&self, dialect: &dyn DialectHandler) -> String {
        let create = if dialect.create_or_replace() {
            "CREATE OR REPLACE FUNCTION"
        } else {
            "CREATE FUNCTION"
        };
        let params = self
            .params
            .iter()
            .map(Param::sql)
            .collect::<Vec<_>>()
            .join(",\n    ");
        let tag = dialect.dollar_tag();
        let comment = self
            .comment
            .as_ref()
            .map(|c| format!("-- {c}\n"))
            .unwrap_or_default();
        format!(
            "{create} {}(\n    {params}\n) RETURNS {}\nLANGUAGE {} {}\nAS ${tag}$\n{comment}SELECT {};\n${tag}$;\n",
            self.name,
            self.returns,
            dialect.sql_language(),
            dialect.stable_marker(),
            self.body.sql(),
        )
    }
}
