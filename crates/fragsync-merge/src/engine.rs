//! Merge engine
//!
//! Pure function from a fragment set to one canonical document plus
//! per-field provenance. Fragments are ordered by priority (ascending) and
//! then by source, so the input order never matters.

use crate::keyed_list::KeyedListStrategy;
use crate::registry::SchemaRegistry;
use crate::scalar::ScalarStrategy;
use crate::schema::{FieldRule, MergeSchema};
use crate::set_list::SetListStrategy;
use crate::strategy::{child_path, Contribution, FieldStrategy, MergeError, Provenance};
use fragsync_model::{canonical_json, ConfigFragment, ContentHash, ResourceType, SourceRef};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The merged, canonical configuration of one resource
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDocument(JsonValue);

impl MergedDocument {
    /// Wrap a merged value
    #[inline]
    #[must_use]
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    /// Borrow the JSON value
    #[inline]
    #[must_use]
    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    /// Take the JSON value
    #[inline]
    #[must_use]
    pub fn into_value(self) -> JsonValue {
        self.0
    }

    /// Canonical serialization (sorted keys, no whitespace)
    #[inline]
    #[must_use]
    pub fn to_canonical_json(&self) -> String {
        canonical_json(&self.0)
    }

    /// SHA-256 of the canonical serialization
    #[inline]
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        ContentHash::of_document(&self.0)
    }

    /// True if no field is set
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.as_object().is_some_and(Map::is_empty)
    }
}

/// Result of a merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Merged document
    pub document: MergedDocument,
    /// Winning source per field path
    pub provenance: Provenance,
    /// Contributing sources, in precedence order
    pub contributors: Vec<SourceRef>,
}

/// Merges fragment sets using per-resource-type schemas
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    registry: Arc<SchemaRegistry>,
}

impl MergeEngine {
    /// Create engine over a schema registry
    #[inline]
    #[must_use]
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Engine with the built-in schemas
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(SchemaRegistry::with_defaults())
    }

    /// Schema registry in use
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Merge fragments for a resource type
    ///
    /// # Errors
    /// Returns [`MergeError`] if a payload's shape contradicts the schema
    pub fn merge(
        &self,
        resource_type: &ResourceType,
        fragments: &[ConfigFragment],
    ) -> Result<MergeOutcome, MergeError> {
        merge_with_schema(self.registry.schema_for(resource_type), fragments)
    }
}

/// Merge fragments with an explicit schema
///
/// # Errors
/// Returns [`MergeError`] if a payload's shape contradicts the schema
pub fn merge_with_schema(
    schema: &MergeSchema,
    fragments: &[ConfigFragment],
) -> Result<MergeOutcome, MergeError> {
    let mut ordered: Vec<&ConfigFragment> = fragments.iter().collect();
    ordered.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.source.cmp(&b.source))
    });

    let mut contributions = Vec::with_capacity(ordered.len());
    for fragment in &ordered {
        match &fragment.payload {
            JsonValue::Object(_) => contributions.push(Contribution::new(
                &fragment.source,
                fragment.priority,
                &fragment.payload,
            )),
            // An empty contribution: the producer currently sets nothing.
            JsonValue::Null => {}
            _ => {
                return Err(MergeError::PayloadNotObject {
                    producer: fragment.source.to_string(),
                })
            }
        }
    }

    let mut provenance = Provenance::new();
    let merged = merge_object(schema, "", &contributions, &mut provenance)?;

    tracing::debug!(
        fragments = ordered.len(),
        fields = provenance.len(),
        "merged fragment set"
    );

    Ok(MergeOutcome {
        document: MergedDocument::new(JsonValue::Object(merged)),
        provenance,
        contributors: ordered.iter().map(|f| f.source.clone()).collect(),
    })
}

/// Walk one object level; every contribution value must be an object
fn merge_object(
    schema: &MergeSchema,
    path: &str,
    contributions: &[Contribution<'_>],
    provenance: &mut Provenance,
) -> Result<Map<String, JsonValue>, MergeError> {
    let mut fields = BTreeSet::new();
    for contribution in contributions {
        if let Some(object) = contribution.value.as_object() {
            fields.extend(object.keys().map(String::as_str));
        }
    }

    let mut merged = Map::new();
    for field in fields {
        let field_path = child_path(path, field);
        let field_contributions: Vec<Contribution<'_>> = contributions
            .iter()
            .filter_map(|c| {
                c.value
                    .get(field)
                    .filter(|v| !v.is_null())
                    .map(|v| Contribution::new(c.source, c.priority, v))
            })
            .collect();

        let value = match schema.rule(field) {
            FieldRule::Scalar => {
                ScalarStrategy::new().merge_field(&field_path, &field_contributions, provenance)?
            }
            FieldRule::KeyedList { identity } => KeyedListStrategy::new(identity.clone())
                .merge_field(&field_path, &field_contributions, provenance)?,
            FieldRule::SetList => {
                SetListStrategy::new().merge_field(&field_path, &field_contributions, provenance)?
            }
            FieldRule::Object(inner) => {
                merge_nested(inner, &field_path, &field_contributions, provenance)?
            }
        };

        if let Some(value) = value {
            merged.insert(field.to_string(), value);
        }
    }

    Ok(merged)
}

fn merge_nested(
    schema: &MergeSchema,
    path: &str,
    contributions: &[Contribution<'_>],
    provenance: &mut Provenance,
) -> Result<Option<JsonValue>, MergeError> {
    if contributions.is_empty() {
        return Ok(None);
    }
    if let Some(bad) = contributions.iter().find(|c| !c.value.is_object()) {
        return Err(MergeError::type_mismatch(path, "object", bad.source));
    }
    let merged = merge_object(schema, path, contributions, provenance)?;
    Ok(Some(JsonValue::Object(merged)))
}
