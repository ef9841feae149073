//! Semantic stage: normalisation, closure construction and relation analysis.

pub mod analysis;
pub mod closure;
mod normalise;

pub use analysis::{
    Features, ParentRelationData, ReferencedRelation, RelationAnalysis, UsersetPattern,
};
pub use closure::{Closure, ClosureRow, UsersetRule};
pub use normalise::normalise;

use anyhow::Result;

use crate::model::schema::Schema;
use crate::model::TypeDefinition;

/// Normalises the model tree into the flat schema.
pub fn schema_of_model(types: &[TypeDefinition]) -> Result<Schema> {
    normalise(types)
}

/// Builds the closure and runs the analyser, producing the template
/// router's only input.
pub fn analyses_of_schema(schema: &Schema) -> Result<Vec<RelationAnalysis>> {
    let closure = closure::build_closure(schema)?;
    Ok(analysis::analyse(schema, &closure)?)
}
