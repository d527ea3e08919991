//! Identity-keyed list strategy
//!
//! Each element is claimed by the highest-precedence contributor of its
//! identity. Disjoint identities are concatenated in precedence order, keeping
//! each fragment's own element order.

use crate::set_list::ExactDedup;
use crate::strategy::{Contribution, FieldStrategy, MergeError, Provenance};
use fragsync_model::canonical_json;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

/// Identity field name and canonical JSON of its value (`None` when absent
/// or null); `"1"` and `1` are different identities
type Identity = Vec<(String, Option<String>)>;

/// Merge list elements by identity fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedListStrategy {
    identity: Vec<String>,
}

impl KeyedListStrategy {
    /// Create strategy for the given identity fields
    #[inline]
    #[must_use]
    pub fn new(identity: Vec<String>) -> Self {
        Self { identity }
    }

    /// Identity fields
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &[String] {
        &self.identity
    }

    /// Identity of an element, `None` if it carries none of the identity fields
    ///
    /// Missing fields take part as `null`, so `{host: a}` and
    /// `{host: a, path: null}` are the same element.
    fn identity_of(&self, element: &JsonValue) -> Option<Identity> {
        let object = element.as_object()?;
        let parts: Identity = self
            .identity
            .iter()
            .map(|field| {
                let value = object
                    .get(field)
                    .filter(|v| !v.is_null())
                    .map(canonical_json);
                (field.clone(), value)
            })
            .collect();
        parts.iter().any(|(_, v)| v.is_some()).then_some(parts)
    }
}

impl FieldStrategy for KeyedListStrategy {
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
        let mut claimed: HashSet<Identity> = HashSet::new();
        let mut anonymous = ExactDedup::default();

        for contribution in contributions {
            for element in contribution.as_array(path)? {
                match self.identity_of(element) {
                    Some(identity) => {
                        if claimed.contains(&identity) {
                            // Claimed by a higher-precedence fragment (or an
                            // earlier element of this one).
                            continue;
                        }
                        provenance.record(
                            element_path(path, &self.identity, element),
                            contribution.source,
                        );
                        claimed.insert(identity);
                        merged.push(element.clone());
                    }
                    None => {
                        if anonymous.insert(element) {
                            provenance
                                .record(format!("{path}[#{}]", merged.len()), contribution.source);
                            merged.push(element.clone());
                        }
                    }
                }
            }
        }

        Ok(Some(JsonValue::Array(merged)))
    }

    fn name(&self) -> &'static str {
        "KeyedList"
    }
}

/// Provenance path of a keyed element
///
/// Strings are shown unquoted unless they would read as another JSON type.
fn element_path(path: &str, fields: &[String], element: &JsonValue) -> String {
    let key = fields
        .iter()
        .filter_map(|field| {
            let value = element.get(field).filter(|v| !v.is_null())?;
            Some(match value {
                JsonValue::String(s) if !reads_as_literal(s) => format!("{field}={s}"),
                other => format!("{field}={}", canonical_json(other)),
            })
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{path}[{key}]")
}

fn reads_as_literal(s: &str) -> bool {
    serde_json::from_str::<JsonValue>(s).is_ok_and(|v| !v.is_string())
}
