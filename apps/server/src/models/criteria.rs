//! Delete-by-criteria requests

use serde::{Deserialize, Serialize};

use super::{RequestPartition, StoredResource};
use crate::{Error, Result};

pub const PARAM_DELETE_EXPUNGE: &str = "_expunge";

/// Parameters that only shape the response and never narrow the match.
const RESULT_PARAMETERS: &[&str] = &["_format", "_pretty", "_summary"];

/// The narrow subset of search criteria the delete path resolves itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    pub resource_type: String,
    /// `_id` values (OR semantics). `None` matches every resource of the type.
    pub ids: Option<Vec<String>>,
}

impl SearchCriteria {
    pub fn all(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ids: None,
        }
    }

    pub fn by_ids<I, S>(resource_type: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_type: resource_type.into(),
            ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, resource: &StoredResource) -> bool {
        if resource.key.resource_type != self.resource_type {
            return false;
        }
        match &self.ids {
            Some(ids) => ids.iter().any(|id| *id == resource.key.id),
            None => true,
        }
    }
}

/// A delete-by-criteria request as received from the REST layer.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub criteria: SearchCriteria,
    pub expunge: bool,
    pub partition: RequestPartition,
}

impl DeleteRequest {
    /// Parse a conditional delete URL such as `Patient?_id=a,b&_expunge=true`.
    pub fn from_url(url: &str) -> Result<Self> {
        let (resource_type, query) = match url.split_once('?') {
            Some((rt, q)) => (rt, q),
            None => (url, ""),
        };
        Self::from_query(resource_type.trim_start_matches('/'), query)
    }

    pub fn from_query(resource_type: &str, query: &str) -> Result<Self> {
        validate_resource_type_name(resource_type)?;

        let mut ids: Option<Vec<String>> = None;
        let mut expunge = false;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(raw_value)
                .map_err(|e| Error::Validation(format!("Invalid value for {}: {}", name, e)))?;

            match name {
                "_id" => {
                    let values = value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string);
                    // Repeated _id parameters are AND-ed: keep the intersection.
                    ids = Some(match ids.take() {
                        Some(existing) => {
                            let next: Vec<String> = values.collect();
                            existing.into_iter().filter(|id| next.contains(id)).collect()
                        }
                        None => values.collect(),
                    });
                }
                PARAM_DELETE_EXPUNGE => {
                    expunge = match &*value {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(Error::Validation(format!(
                                "Invalid value for {}: '{}' (expected true or false)",
                                PARAM_DELETE_EXPUNGE, other
                            )))
                        }
                    };
                }
                other if RESULT_PARAMETERS.contains(&other) => {}
                other => {
                    return Err(Error::Validation(format!(
                        "Unsupported search parameter for conditional delete: {}",
                        other
                    )))
                }
            }
        }

        Ok(Self {
            criteria: SearchCriteria {
                resource_type: resource_type.to_string(),
                ids,
            },
            expunge,
            partition: RequestPartition::All,
        })
    }

    pub fn with_partition(mut self, partition: RequestPartition) -> Self {
        self.partition = partition;
        self
    }
}

fn validate_resource_type_name(resource_type: &str) -> Result<()> {
    let mut chars = resource_type.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(Error::Validation(format!(
            "Invalid resource type: {}",
            resource_type
        )));
    }
    Ok(())
}
