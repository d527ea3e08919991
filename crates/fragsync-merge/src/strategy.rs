//! Field strategy trait and core types
//!
//! Provides the [`FieldStrategy`] trait for per-field conflict resolution,
//! the [`Contribution`] each strategy consumes and the [`Provenance`] map it
//! fills in.

use fragsync_model::SourceRef;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Per-field merge strategy
///
/// # Determinism
/// `contributions` arrive in precedence order (priority ascending, then
/// source order). Implementations must depend on nothing but that slice, so
/// the same input always yields byte-identical output.
pub trait FieldStrategy: Send + Sync + std::fmt::Debug {
    /// Merge one field's contributions
    ///
    /// # Returns
    /// - `Ok(Some(value))` with the merged value
    /// - `Ok(None)` if no contribution sets the field
    /// - `Err(MergeError)` on a structural mismatch
    fn merge_field(
        &self,
        path: &str,
        contributions: &[Contribution<'_>],
        provenance: &mut Provenance,
    ) -> Result<Option<JsonValue>, MergeError>;

    /// Strategy name (for debugging)
    fn name(&self) -> &'static str;
}

/// One fragment's value for one field
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    /// Producer of the value
    pub source: &'a SourceRef,
    /// Fragment priority (lower wins)
    pub priority: i32,
    /// The value, never `null` (null means "not set" and is filtered out)
    pub value: &'a JsonValue,
}

impl<'a> Contribution<'a> {
    /// Create a contribution
    #[inline]
    #[must_use]
    pub fn new(source: &'a SourceRef, priority: i32, value: &'a JsonValue) -> Self {
        Self {
            source,
            priority,
            value,
        }
    }

    /// Borrow the value as an array
    ///
    /// # Errors
    /// Returns [`MergeError::TypeMismatch`] if the value is not an array
    pub fn as_array(&self, path: &str) -> Result<&'a Vec<JsonValue>, MergeError> {
        self.value
            .as_array()
            .ok_or_else(|| MergeError::type_mismatch(path, "array", self.source))
    }
}

/// Which producer set each field of a merged document
///
/// Keys are field paths: `/field`, `/obj/field`, `/list[key=value]` for
/// identity-keyed elements and `/list[#n]` for positional ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    entries: BTreeMap<String, SourceRef>,
}

impl Provenance {
    /// Create empty provenance
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the winning source for `path`
    #[inline]
    pub fn record(&mut self, path: impl Into<String>, source: &SourceRef) {
        self.entries.insert(path.into(), source.clone());
    }

    /// Winning source for `path`
    #[inline]
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&SourceRef> {
        self.entries.get(path)
    }

    /// Number of recorded paths
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was recorded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceRef)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Render as path -> `kind/namespace/name`, for status reporting
    #[must_use]
    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

/// Structural merge failures
///
/// Precedence conflicts are never errors; these cover payloads whose shape
/// contradicts the declared schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// A fragment payload is not a JSON object
    #[error("payload from {producer} is not an object")]
    PayloadNotObject {
        /// Offending producer
        producer: String,
    },

    /// A declared field holds the wrong JSON type
    #[error("{path}: expected {expected} from {producer}")]
    TypeMismatch {
        /// Field path
        path: String,
        /// Expected JSON type
        expected: &'static str,
        /// Offending producer
        producer: String,
    },
}

impl MergeError {
    /// Create a type mismatch error
    #[inline]
    #[must_use]
    pub fn type_mismatch(path: &str, expected: &'static str, producer: &SourceRef) -> Self {
        Self::TypeMismatch {
            path: path.to_string(),
            expected,
            producer: producer.to_string(),
        }
    }
}

/// Join a parent path and a field name
#[inline]
pub(crate) fn child_path(parent: &str, field: &str) -> String {
    format!("{parent}/{field}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provenance_records_and_renders() {
        let source = SourceRef::new("Tunnel", "ns", "a");
        let mut provenance = Provenance::new();
        provenance.record("/warp_routing", &source);
        assert_eq!(provenance.get("/warp_routing"), Some(&source));
        assert_eq!(
            provenance.to_string_map().get("/warp_routing").map(String::as_str),
            Some("Tunnel/ns/a")
        );
    }

    #[test]
    fn contribution_as_array_mismatch() {
        let source = SourceRef::new("Tunnel", "ns", "a");
        let value = json!("not a list");
        let contribution = Contribution::new(&source, 1, &value);
        let err = contribution.as_array("/ingress").unwrap_err();
        assert_eq!(
            err.to_string(),
            "/ingress: expected array from Tunnel/ns/a"
        );
    }

    #[test]
    fn child_path_joins() {
        assert_eq!(child_path("", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
    }
}
