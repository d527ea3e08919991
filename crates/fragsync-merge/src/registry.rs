//! Schema registry
//!
//! Maps each [`ResourceType`] to the [`MergeSchema`] its fragments merge
//! with.

use crate::schema::MergeSchema;
use fragsync_model::ResourceType;
use std::collections::HashMap;

/// Registry of merge schemas by resource type
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<ResourceType, MergeSchema>,
    fallback: MergeSchema,
}

impl SchemaRegistry {
    /// Create new empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create registry with built-in schemas
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            ResourceType::TunnelConfig,
            MergeSchema::new()
                .keyed_list("ingress", &["hostname", "path"])
                .object("origin_request", MergeSchema::new())
                .object("warp_routing", MergeSchema::new())
                .set_list("tags"),
        );
        registry.register(
            ResourceType::DnsRecords,
            MergeSchema::new()
                .keyed_list("records", &["name", "type"])
                .set_list("tags"),
        );
        registry.register(
            ResourceType::AccessPolicy,
            MergeSchema::new()
                .keyed_list("rules", &["name"])
                .set_list("include")
                .set_list("tags"),
        );
        registry.register(
            ResourceType::ZoneRuleset,
            MergeSchema::new()
                .keyed_list("rules", &["ref"])
                .set_list("tags"),
        );
        registry
    }

    /// Register (or replace) a schema
    pub fn register(&mut self, resource_type: ResourceType, schema: MergeSchema) {
        self.schemas.insert(resource_type, schema);
    }

    /// Check if a schema is registered
    #[inline]
    #[must_use]
    pub fn contains(&self, resource_type: &ResourceType) -> bool {
        self.schemas.contains_key(resource_type)
    }

    /// Registered schema, if any
    #[inline]
    #[must_use]
    pub fn get(&self, resource_type: &ResourceType) -> Option<&MergeSchema> {
        self.schemas.get(resource_type)
    }

    /// Schema to merge with; unregistered types get an empty schema
    #[inline]
    #[must_use]
    pub fn schema_for(&self, resource_type: &ResourceType) -> &MergeSchema {
        self.schemas.get(resource_type).unwrap_or(&self.fallback)
    }

    /// Get number of registered schemas
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldRule;

    #[test]
    fn defaults_cover_builtin_types() {
        let registry = SchemaRegistry::with_defaults();
        assert_eq!(registry.len(), 4);
        assert!(registry.contains(&ResourceType::TunnelConfig));
        assert!(registry.contains(&ResourceType::DnsRecords));
        assert_eq!(
            registry.schema_for(&ResourceType::DnsRecords).rule("records"),
            &FieldRule::keyed(&["name", "type"])
        );
    }

    #[test]
    fn unregistered_type_uses_empty_schema() {
        let registry = SchemaRegistry::with_defaults();
        let other = ResourceType::Other("load-balancer".to_string());
        assert!(registry.get(&other).is_none());
        let schema = registry.schema_for(&other);
        assert_eq!(schema.fields().count(), 0);
        assert_eq!(schema.rule("pools"), &FieldRule::Scalar);
    }

    #[test]
    fn register_replaces() {
        let mut registry = SchemaRegistry::new();
        assert!(registry.is_empty());
        registry.register(ResourceType::DnsRecords, MergeSchema::new());
        registry.register(ResourceType::DnsRecords, MergeSchema::new().set_list("tags"));
        assert_eq!(registry.len(), 1);
        assert!(registry
            .schema_for(&ResourceType::DnsRecords)
            .declares("tags"));
    }
}
