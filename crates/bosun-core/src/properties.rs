//! Build properties: named JSON values tagged with the source that set them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub value: Value,
    pub source: String,
}

/// An ordered property set. Later updates override earlier values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, PropertyValue>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a property set from plain values, all attributed to `source`.
    pub fn from_values(values: BTreeMap<String, Value>, source: &str) -> Self {
        let mut props = Self::new();
        for (name, value) in values {
            props.set(name, value, source);
        }
        props
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>, source: &str) {
        self.0.insert(
            name.into(),
            PropertyValue {
                value: value.into(),
                source: source.to_string(),
            },
        );
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>, source: &str) -> Self {
        self.set(name, value, source);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).map(|p| &p.value)
    }

    pub fn source(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|p| p.source.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Overlay `other` onto this set; values in `other` win on conflict.
    pub fn update(&mut self, other: &Properties) {
        for (name, prop) in &other.0 {
            self.0.insert(name.clone(), prop.clone());
        }
    }

    /// A copy of this set overridden by `other`.
    pub fn updated(&self, other: &Properties) -> Properties {
        let mut merged = self.clone();
        merged.update(other);
        merged
    }

    /// Compare values only, ignoring which source set them.
    pub fn same_values(&self, other: &Properties) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .all(|(name, prop)| other.get(name) == Some(&prop.value))
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.0
            .iter()
            .map(|(name, prop)| (name.clone(), prop.value.clone()))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
