//! Stored resources, their identities and the reference links between them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::{Error, Result};

/// Versionless identity of a stored resource (`Type/id`).
///
/// Ordering is by type then id, which keeps candidate sets and batch plans stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Parse a relative `Type/id` reference. Anything after the id (e.g. `_history/2`) is ignored.
    pub fn parse(reference: &str) -> Result<Self> {
        let mut parts = reference.trim().splitn(3, '/');
        match (parts.next(), parts.next()) {
            (Some(rt), Some(id)) if !rt.is_empty() && !id.is_empty() => Ok(Self::new(rt, id)),
            _ => Err(Error::Validation(format!(
                "Invalid resource reference '{}': expected Type/id",
                reference
            ))),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// Partition a resource was written into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub const DEFAULT: &'static str = "DEFAULT";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partitions a request is allowed to see when resolving its candidate set.
///
/// Only candidate resolution is partition scoped. Reference lookups always span every partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", tag = "mode", content = "partitions")]
pub enum RequestPartition {
    #[default]
    All,
    Only(Vec<PartitionId>),
}

impl RequestPartition {
    pub fn only(partition: impl Into<String>) -> Self {
        Self::Only(vec![PartitionId::new(partition)])
    }

    /// Parse the comma-separated `X-Partition-Id` header value.
    pub fn from_header(value: &str) -> Self {
        let partitions: Vec<PartitionId> = value
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PartitionId::new)
            .collect();
        if partitions.is_empty() {
            Self::All
        } else {
            Self::Only(partitions)
        }
    }

    pub fn contains(&self, partition: &PartitionId) -> bool {
        match self {
            Self::All => true,
            Self::Only(partitions) => partitions.contains(partition),
        }
    }
}

/// One version row of a stored resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    pub key: ResourceKey,
    pub version_id: i32,
    pub partition: PartitionId,
    pub resource: JsonValue,
    pub last_updated: DateTime<Utc>,
}

/// Directed edge from a field of one stored resource to another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceLink {
    pub source: ResourceKey,
    pub source_partition: PartitionId,
    /// Element path of the referencing field, e.g. `Patient.managingOrganization`.
    pub path: String,
    pub target: ResourceKey,
}

/// A candidate that is still referenced from a resource outside the candidate set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Conflict {
    pub target: ResourceKey,
    pub referrer: ResourceKey,
    pub path: String,
}

impl Conflict {
    pub fn from_link(link: &ReferenceLink) -> Self {
        Self {
            target: link.target.clone(),
            referrer: link.source.clone(),
            path: link.path.clone(),
        }
    }
}

impl From<Conflict> for Error {
    fn from(conflict: Conflict) -> Self {
        Error::ReferentialConflict {
            target: conflict.target.to_string(),
            referrer: conflict.referrer.to_string(),
            path: conflict.path,
        }
    }
}
