//! Scalar field strategy
//!
//! First writer wins: the highest-precedence contribution is taken verbatim.
//! Also used for undeclared fields, whatever their JSON type.

use crate::strategy::{Contribution, FieldStrategy, MergeError, Provenance};
use serde_json::Value as JsonValue;

/// Highest-precedence value wins, verbatim
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarStrategy;

impl ScalarStrategy {
    /// Create new scalar strategy
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FieldStrategy for ScalarStrategy {
    fn merge_field(
        &self,
        path: &str,
        contributions: &[Contribution<'_>],
        provenance: &mut Provenance,
    ) -> Result<Option<JsonValue>, MergeError> {
        let Some(winner) = contributions.first() else {
            return Ok(None);
        };

        if contributions.len() > 1 {
            tracing::trace!(
                path,
                winner = %winner.source,
                overridden = contributions.len() - 1,
                "scalar field overridden"
            );
        }

        provenance.record(path, winner.source);
        Ok(Some(winner.value.clone()))
    }

    fn name(&self) -> &'static str {
        "Scalar"
    }
}
