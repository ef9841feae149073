//! Compiler for Melange authorization models.
//! Targets stored SQL routines and exposes the flattened schema and the
//! relation analyses as intermediate representations.
//!
//! You probably want to start with the [compile] wrapper function.
//!
//! For more granular access, refer to this diagram:
//! ```ascii
//!             model tree (Vec<TypeDefinition>)
//!
//!                    │         model_of_json
//!                    │       ◄────────────
//!  schema_of_model   │                     JSON
//!    (normalise)     │       ────────────►
//!                    ▼         json_of_model
//!
//!                  Schema
//!
//!                    │
//! analyses_of_schema │  (closure + analyser)
//!                    ▼
//!
//!           Vec<RelationAnalysis>
//!
//!                    │
//!    sql_of_analyses │  (templates + inliner + dispatchers)
//!                    ▼
//!
//!                Migration
//! ```

pub mod error;
pub mod model;
pub mod semantic;
pub mod sql;
#[cfg(test)]
mod test;
mod utils;

pub use error::{ErrorKind, ErrorMessage, ErrorMessages};
pub use sql::{Dialect, Migration, Operation, Routine, RoutineKind, Template};

use anyhow::Result;
use once_cell::sync::Lazy;
use semver::Version;
use sha2::{Digest, Sha256};

use model::schema::Schema;
use model::TypeDefinition;
use semantic::RelationAnalysis;

pub static MELANGE_VERSION: Lazy<Version> =
    Lazy::new(|| Version::parse(env!("CARGO_PKG_VERSION")).expect("Invalid melange version number"));

/// Compilation options.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Target dialect of the generated routines.
    pub dialect: Dialect,

    /// Maximum recursion depth compiled into the generated routines.
    /// Relations whose static userset depth exceeds this compile to a
    /// routine that raises instead of evaluating.
    pub depth_ceiling: usize,

    /// Emits a signature comment at the head of the migration script.
    pub signature_comment: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            dialect: Dialect::default(),
            depth_ceiling: 25,
            signature_comment: true,
        }
    }
}

impl Options {
    pub fn no_signature(mut self) -> Self {
        self.signature_comment = false;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_depth_ceiling(mut self, depth_ceiling: usize) -> Self {
        self.depth_ceiling = depth_ceiling;
        self
    }
}

/// Compile an authorization model into a set of stored routines.
///
/// This is a wrapper for:
/// - [schema_of_model] — flatten the rule trees into the schema
/// - [analyses_of_schema] — build the closure and analyse every relation
/// - [sql_of_analyses] — emit specialised routines and dispatchers
pub fn compile(types: &[TypeDefinition], options: &Options) -> Result<Migration, ErrorMessages> {
    schema_of_model(types)
        .and_then(|schema| {
            let checksum = schema_checksum(&schema);
            let analyses = analyses_of_schema(&schema)?;
            sql_of_analyses(&analyses, checksum, options)
        })
        .map_err(error::downcast)
}

/// Normalise the model tree into the flat schema.
pub fn schema_of_model(types: &[TypeDefinition]) -> Result<Schema> {
    semantic::schema_of_model(types)
}

/// Build the closure and run the relation analyser.
pub fn analyses_of_schema(schema: &Schema) -> Result<Vec<RelationAnalysis>> {
    semantic::analyses_of_schema(schema)
}

/// Generate the migration from relation analyses.
pub fn sql_of_analyses(
    analyses: &[RelationAnalysis],
    schema_checksum: String,
    options: &Options,
) -> Result<Migration> {
    sql::compile(analyses, schema_checksum, options)
}

/// SHA-256 over the canonical JSON schema; recorded by the migration
/// driver to skip re-migration of an unchanged model.
pub fn schema_checksum(schema: &Schema) -> String {
    let canonical = serde_json::to_vec(schema).expect("schema serialises");
    Sha256::digest(&canonical)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// JSON serialization
pub fn json_of_model(types: &[TypeDefinition]) -> Result<String, ErrorMessages> {
    serde_json::to_string(types).map_err(|e| error::downcast(anyhow::anyhow!(e)))
}

/// JSON deserialization
pub fn model_of_json(json: &str) -> Result<Vec<TypeDefinition>, ErrorMessages> {
    serde_json::from_str(json).map_err(|e| error::downcast(anyhow::anyhow!(e)))
}
