//! Set-like list strategy
//!
//! Concatenates contributions in precedence order and drops exact duplicates.

use crate::strategy::{Contribution, FieldStrategy, MergeError, Provenance};
use fragsync_model::canonical_json;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

/// Concatenate lists, removing exact duplicates
#[derive(Debug, Clone, Copy, Default)]
pub struct SetListStrategy;

impl SetListStrategy {
    /// Create new set-list strategy
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FieldStrategy for SetListStrategy {
    fn merge_field(
        &self,
        path: &str,
        contributions: &[Contribution<'_>],
        provenance: &mut Provenance,
    ) -> Result<Option<JsonValue>, MergeError> {
        if contributions.is_empty() {
            return Ok(None);
        }

        let mut merged = Vec::new();
        let mut seen = ExactDedup::default();

        for contribution in contributions {
            for element in contribution.as_array(path)? {
                if seen.insert(element) {
                    provenance.record(format!("{path}[#{}]", merged.len()), contribution.source);
                    merged.push(element.clone());
                }
            }
        }

        Ok(Some(JsonValue::Array(merged)))
    }

    fn name(&self) -> &'static str {
        "SetList"
    }
}

/// Exact-equality filter over JSON values
///
/// Compares canonical forms, so objects differing only in key order count
/// as duplicates.
#[derive(Debug, Default)]
pub(crate) struct ExactDedup {
    seen: HashSet<String>,
}

impl ExactDedup {
    /// Returns true the first time a value is seen
    pub(crate) fn insert(&mut self, value: &JsonValue) -> bool {
        self.seen.insert(canonical_json(value))
    }
}
