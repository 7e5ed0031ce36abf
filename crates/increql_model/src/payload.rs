//! Wire payload shapes (spec §6), exactly as the Payload Publisher emits
//! them to the consumer: one [`InitialResult`] followed by a lazy sequence
//! of [`SubsequentResult`]s.

use crate::graphql_error::GraphQlError;
use crate::path::PathSegment;
use serde::{Deserialize, Serialize};

/// The monotonically increasing identifier the Publisher assigns to a
/// delivery group the moment it first appears as pending. Serialized as a
/// string on the wire, matching the literal examples in spec §8
/// (`"id":"0"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryGroupId(pub u64);

impl Serialize for DeliveryGroupId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DeliveryGroupId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>()
            .map(DeliveryGroupId)
            .map_err(|_| serde::de::Error::custom("invalid delivery group id"))
    }
}

impl std::fmt::Display for DeliveryGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An announcement that a delivery group (deferred fragment or stream)
/// has begun and will eventually produce `incremental`/`completed`
/// entries under this `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub id: DeliveryGroupId,
    pub path: Vec<PathSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One `incremental` array entry: either data for a deferred fragment or
/// items for a stream. `#[serde(untagged)]` reproduces the wire shape,
/// which carries no explicit discriminant — `data` vs `items` tells them
/// apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum IncrementalEntry {
    Defer {
        id: DeliveryGroupId,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub_path: Option<Vec<PathSegment>>,
        data: serde_json::Value,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        errors: Vec<GraphQlError>,
    },
    Stream {
        id: DeliveryGroupId,
        items: Vec<serde_json::Value>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        errors: Vec<GraphQlError>,
    },
}

/// Reports that a delivery group will produce no further entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedEntry {
    pub id: DeliveryGroupId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQlError>>,
}

impl CompletedEntry {
    #[must_use]
    pub fn ok(id: DeliveryGroupId) -> Self {
        Self { id, errors: None }
    }

    #[must_use]
    pub fn failed(id: DeliveryGroupId, errors: Vec<GraphQlError>) -> Self {
        Self {
            id,
            errors: Some(errors),
        }
    }
}

/// The single initial payload: `{data, errors?, pending: [...], hasNext:
/// true}` when any delivery groups were installed, or plain `{data,
/// errors?}` with `hasNext` entirely absent otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialResult {
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<GraphQlError>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pending: Vec<PendingEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_next: Option<bool>,
}

impl InitialResult {
    #[must_use]
    pub fn complete(data: serde_json::Value, errors: Vec<GraphQlError>) -> Self {
        Self {
            data,
            errors,
            pending: Vec::new(),
            has_next: None,
        }
    }

    #[must_use]
    pub fn with_pending(
        data: serde_json::Value,
        errors: Vec<GraphQlError>,
        pending: Vec<PendingEntry>,
    ) -> Self {
        Self {
            data,
            errors,
            pending,
            has_next: Some(true),
        }
    }
}

/// A subsequent payload: `{pending?, incremental?, completed?, hasNext}`.
/// At least one of `incremental`/`completed` is non-empty, or `pending` is
/// non-empty and `has_next` is true — an empty payload is never
/// constructed by the Publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsequentResult {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pending: Vec<PendingEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub incremental: Vec<IncrementalEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub completed: Vec<CompletedEntry>,
    pub has_next: bool,
}

impl SubsequentResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.incremental.is_empty() && self.completed.is_empty()
    }
}
