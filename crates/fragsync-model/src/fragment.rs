//! Producer contributions
//!
//! A [`ConfigFragment`] is one producer's partial desired state for one
//! external resource. [`SourceRef`] is the producer identity used for upsert
//! and delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;

/// Stable identity of a fragment's producer
///
/// Ordered by its display form (`kind/namespace/name`), which is also the
/// merge tie-breaker between equal priorities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// Producer kind (e.g. `Tunnel`, `DnsSource`)
    pub kind: String,
    /// Namespace of the owning cluster object
    pub namespace: String,
    /// Name of the owning cluster object
    pub name: String,
}

impl SourceRef {
    /// Create a new source reference
    #[inline]
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Bytes of the rendered `kind/namespace/name` form
    fn rendered_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.kind
            .bytes()
            .chain(Some(b'/'))
            .chain(self.namespace.bytes())
            .chain(Some(b'/'))
            .chain(self.name.bytes())
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl PartialOrd for SourceRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SourceRef {
    fn cmp(&self, other: &Self) -> Ordering {
        // Same order as comparing the rendered strings, without allocating.
        self.rendered_bytes()
            .cmp(other.rendered_bytes())
            .then_with(|| {
                (&self.kind, &self.namespace, &self.name).cmp(&(
                    &other.kind,
                    &other.namespace,
                    &other.name,
                ))
            })
    }
}

/// One producer's contribution to a resource's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFragment {
    /// Producer identity
    pub source: SourceRef,
    /// Opaque structured document, schema depends on the resource type
    pub payload: JsonValue,
    /// Lower value takes precedence
    pub priority: i32,
    /// When the producer last replaced this fragment
    pub last_updated: DateTime<Utc>,
}

impl ConfigFragment {
    /// Create a fragment stamped with the current time
    #[inline]
    #[must_use]
    pub fn new(source: SourceRef, payload: JsonValue, priority: i32) -> Self {
        Self {
            source,
            payload,
            priority,
            last_updated: Utc::now(),
        }
    }

    /// Parse the payload from JSON text
    ///
    /// # Errors
    /// Returns error if the text is not valid JSON
    pub fn from_json(source: SourceRef, json: &str, priority: i32) -> Result<Self, FragmentError> {
        let payload: JsonValue = serde_json::from_str(json)?;
        Ok(Self::new(source, payload, priority))
    }

    /// Parse the payload from YAML text
    ///
    /// # Errors
    /// Returns error if the text is not valid YAML or has non-string keys
    pub fn from_yaml(source: SourceRef, yaml: &str, priority: i32) -> Result<Self, FragmentError> {
        let payload: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self::new(source, payload, priority))
    }

    /// True if payload and priority match, ignoring the timestamp
    #[inline]
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.source == other.source
            && self.priority == other.priority
            && self.payload == other.payload
    }
}

/// Fragment parsing errors
#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    /// Payload text is not valid JSON
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Payload text is not valid YAML
    #[error("invalid YAML payload: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn source_ref_display() {
        let source = SourceRef::new("Tunnel", "default", "edge");
        assert_eq!(source.to_string(), "Tunnel/default/edge");
    }

    #[test]
    fn from_yaml_payload() {
        let yaml = "ingress:\n  - hostname: a.example.com\n    service: http://web:80\n";
        let fragment =
            ConfigFragment::from_yaml(SourceRef::new("Tunnel", "ns", "a"), yaml, 10).unwrap();
        assert_eq!(
            fragment.payload,
            json!({"ingress": [{"hostname": "a.example.com", "service": "http://web:80"}]})
        );
    }

    #[test]
    fn from_json_rejects_garbage() {
        let result = ConfigFragment::from_json(SourceRef::new("k", "n", "x"), "{nope", 0);
        assert!(matches!(result, Err(FragmentError::InvalidJson(_))));
    }

    #[test]
    fn same_content_ignores_timestamp() {
        let source = SourceRef::new("Tunnel", "ns", "a");
        let mut a = ConfigFragment::new(source.clone(), json!({"x": 1}), 5);
        let b = ConfigFragment::new(source, json!({"x": 1}), 5);
        a.last_updated = DateTime::<Utc>::default();
        assert!(a.same_content(&b));
        assert!(!a.same_content(&ConfigFragment { priority: 6, ..b }));
    }

    proptest! {
        #[test]
        fn prop_ord_matches_display_order(
            a in ("[a-z.-]{0,4}", "[a-z.-]{0,4}", "[a-z.-]{0,4}"),
            b in ("[a-z.-]{0,4}", "[a-z.-]{0,4}", "[a-z.-]{0,4}"),
        ) {
            let lhs = SourceRef::new(a.0, a.1, a.2);
            let rhs = SourceRef::new(b.0, b.1, b.2);
            prop_assert_eq!(lhs.cmp(&rhs), lhs.to_string().cmp(&rhs.to_string()));
        }
    }
}
