//! Field-level and request-level errors as they appear on the wire.
//!
//! Named distinctly from this crate's own [`crate::error::IncrementalError`],
//! which covers programmer-contract violations rather than query-time errors.

use crate::path::PathSegment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single GraphQL-style error attached to a result or payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphQlError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

impl GraphQlError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

impl Serialize for PathSegment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            PathSegment::Field(name) => serializer.serialize_str(name),
            PathSegment::Index(i) => serializer.serialize_u64(*i as u64),
        }
    }
}

impl<'de> Deserialize<'de> for PathSegment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => Ok(PathSegment::Field(s.into())),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(|i| PathSegment::Index(i as usize))
                .ok_or_else(|| serde::de::Error::custom("path index out of range")),
            other => Err(serde::de::Error::custom(format!(
                "invalid path segment: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_with_path_serializes_compactly() {
        let err = GraphQlError::new("boom")
            .with_path(vec![PathSegment::from("a"), PathSegment::Index(2)])
            .with_code("NOT_FOUND");

        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["message"], "boom");
        assert_eq!(value["path"], serde_json::json!(["a", 2]));
        assert_eq!(value["extensions"]["code"], "NOT_FOUND");
    }

    impl GraphQlError {
        fn with_code(self, code: impl Into<String>) -> Self {
            self.with_extension("code", serde_json::Value::String(code.into()))
        }
    }
}
