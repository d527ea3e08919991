//! Per-resource-type merge schema
//!
//! Declares how each field of a document is merged. Fields a schema does not
//! mention are passed through verbatim, first writer wins.

use std::collections::BTreeMap;

/// Merge rule for one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    /// Highest-precedence non-null value wins
    Scalar,

    /// List whose elements carry a natural identity
    ///
    /// Elements with equal identity fields are the same element; the
    /// highest-precedence one replaces the others.
    KeyedList {
        /// Element fields that together form the identity
        identity: Vec<String>,
    },

    /// List without identity semantics, concatenated with duplicates removed
    SetList,

    /// Nested object merged field by field
    Object(MergeSchema),
}

impl FieldRule {
    /// Keyed list rule from field names
    #[must_use]
    pub fn keyed(identity: &[&str]) -> Self {
        Self::KeyedList {
            identity: identity.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// Field rules of one document level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSchema {
    fields: BTreeMap<String, FieldRule>,
}

impl MergeSchema {
    /// Schema with no declared fields (every field first-writer-wins)
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field rule
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(name.into(), rule);
        self
    }

    /// Declare a list merged by identity
    #[must_use]
    pub fn keyed_list(self, name: impl Into<String>, identity: &[&str]) -> Self {
        self.with_field(name, FieldRule::keyed(identity))
    }

    /// Declare a set-like list
    #[must_use]
    pub fn set_list(self, name: impl Into<String>) -> Self {
        self.with_field(name, FieldRule::SetList)
    }

    /// Declare a nested object
    #[must_use]
    pub fn object(self, name: impl Into<String>, schema: MergeSchema) -> Self {
        self.with_field(name, FieldRule::Object(schema))
    }

    /// Rule for `name`; undeclared fields merge as scalars
    #[inline]
    #[must_use]
    pub fn rule(&self, name: &str) -> &FieldRule {
        static SCALAR: FieldRule = FieldRule::Scalar;
        self.fields.get(name).unwrap_or(&SCALAR)
    }

    /// True if `name` is declared
    #[inline]
    #[must_use]
    pub fn declares(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Declared fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}
