//! Feature map for target dialects.
//!
//! The catalogue targets PostgreSQL-compatible databases only; the handler
//! trait exists for the few spellings that differ between them. Anything a
//! dialect cannot express is a compile error rather than a silent fallback.

use core::fmt::Debug;
use std::any::{Any, TypeId};

use serde::{Deserialize, Serialize};

/// Target dialect for generated routines.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Cockroach,
}

impl Dialect {
    pub(super) fn handler(&self) -> Box<dyn DialectHandler> {
        match self {
            Dialect::Postgres => Box::new(PostgresDialect),
            Dialect::Cockroach => Box::new(CockroachDialect),
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::Postgres
    }
}

#[derive(Debug)]
pub struct PostgresDialect;
#[derive(Debug)]
pub struct CockroachDialect;

pub(super) trait DialectHandler: Any + Debug {
    /// Tag used for dollar-quoting routine bodies.
    fn dollar_tag(&self) -> &'static str {
        "melange"
    }

    fn procedural_language(&self) -> &'static str {
        "plpgsql"
    }

    fn sql_language(&self) -> &'static str {
        "sql"
    }

    /// Whether routines may be replaced in place. When false the migration
    /// driver must drop first.
    fn create_or_replace(&self) -> bool {
        true
    }

    /// Volatility marker for read-only routines.
    fn stable_marker(&self) -> &'static str {
        "STABLE"
    }
}

impl dyn DialectHandler {
    #[inline]
    pub fn is<T: DialectHandler + 'static>(&self) -> bool {
        TypeId::of::<T>() == self.type_id()
    }
}

impl DialectHandler for PostgresDialect {}

impl DialectHandler for CockroachDialect {
    // CockroachDB validates bodies eagerly; replacing a routine that others
    // reference needs drop-and-recreate in the driver.
    fn create_or_replace(&self) -> bool {
        false
    }
}
