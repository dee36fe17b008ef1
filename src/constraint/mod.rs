//! # Constraint Compiler
//!
//! Rewrites a client `where` document before it reaches storage:
//!
//! - `$select` / `$dontSelect` become `$in` / `$nin` over a projected key
//!   of a nested query's results
//! - `$inQuery` / `$notInQuery` become `$in` / `$nin` over pointers to a
//!   nested query's results
//! - constraint objects mixing direct keys with operators get an explicit
//!   `$eq`
//!
//! ## Invariants
//! - A compiled document holds none of the four subquery operators
//! - A nonexistent subquery class resolves to an empty value set
//! - Subquery nesting is bounded by `max_subquery_depth`

mod compiler;
mod operators;

pub use compiler::ConstraintCompiler;
pub use operators::{normalize_equality, Subquery, SubqueryOperator, SubqueryResult};

use async_trait::async_trait;

use crate::document::Document;
use crate::errors::EngineResult;
use crate::rest::RestOptions;

/// Executes the nested reads a constraint document asks for
#[async_trait]
pub trait SubqueryRunner: Send + Sync {
    async fn run_subquery(
        &self,
        class_name: &str,
        where_: Document,
        options: RestOptions,
    ) -> EngineResult<SubqueryResult>;
}
