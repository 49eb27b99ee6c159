use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::UploaderError;
use crate::session::{SessionManager, send_with_retries};

/// A `{rel, href}` pair embedded in a server response. Transient; the server
/// is the source of truth for the resource graph, so links are re-resolved
/// on every navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// Selects the sub-resource whose `key` field equals `value`
/// (case-insensitive).
#[derive(Debug, Clone)]
pub struct LinkFilter {
    pub key: String,
    pub value: String,
}

impl LinkFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    resource: ResourceBody,
}

#[derive(Debug, Deserialize)]
struct ResourceBody {
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    resources: Option<Vec<Value>>,
}

pub struct LinkResolver {
    session: Arc<SessionManager>,
}

impl LinkResolver {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Fetches `resource_url` and extracts the link for `rel`, optionally
    /// narrowed to the sub-resource matched by `filter`.
    pub fn resolve_link(
        &self,
        resource_url: &str,
        rel: &str,
        filter: Option<&LinkFilter>,
    ) -> Result<String, UploaderError> {
        let session = self.session.get_session()?;
        let response = send_with_retries(|| {
            self.session
                .client()
                .get(resource_url)
                .bearer_auth(session.token())
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "link resolution failed".to_string());
            return Err(UploaderError::Status { status, message });
        }

        let envelope: Envelope = response.json().map_err(|err| {
            UploaderError::Contract(format!("malformed resource at {resource_url}: {err}"))
        })?;

        let href = match filter {
            Some(filter) => {
                let resources = envelope.resource.resources.ok_or_else(|| {
                    UploaderError::Contract(format!(
                        "resource at {resource_url} has no sub-resource collection"
                    ))
                })?;
                let matched = select_subresource(&resources, filter)?;
                let links = links_of(matched)?;
                select_link(&links, rel)?
            }
            None => select_link(&envelope.resource.links, rel)?,
        };

        debug!(rel, href = %href, "resolved link");
        Ok(href)
    }
}

/// Finds the link for `rel`; a miss names the relations that were present so
/// contract drift is diagnosable from the error alone.
pub fn select_link(links: &[Link], rel: &str) -> Result<String, UploaderError> {
    links
        .iter()
        .find(|link| link.rel == rel)
        .map(|link| link.href.clone())
        .ok_or_else(|| {
            let found: Vec<&str> = links.iter().map(|link| link.rel.as_str()).collect();
            UploaderError::ResourceNotFound(format!(
                "no link with rel {rel:?} (found {found:?})"
            ))
        })
}

/// Picks the sub-resource whose `filter.key` field equals `filter.value`.
/// A sub-resource missing the key entirely is an API-contract break, not a
/// lookup miss.
pub fn select_subresource<'a>(
    resources: &'a [Value],
    filter: &LinkFilter,
) -> Result<&'a Value, UploaderError> {
    for resource in resources {
        let field = resource.get(&filter.key).ok_or_else(|| {
            UploaderError::Contract(format!(
                "sub-resource is missing expected field {:?}",
                filter.key
            ))
        })?;
        if field_matches(field, &filter.value) {
            return Ok(resource);
        }
    }
    Err(UploaderError::ResourceNotFound(format!(
        "no sub-resource with {} = {:?} among {} candidates",
        filter.key,
        filter.value,
        resources.len()
    )))
}

pub fn links_of(resource: &Value) -> Result<Vec<Link>, UploaderError> {
    let links = resource
        .get("links")
        .ok_or_else(|| UploaderError::Contract("sub-resource carries no links".to_string()))?;
    serde_json::from_value(links.clone())
        .map_err(|err| UploaderError::Contract(format!("malformed links array: {err}")))
}

fn field_matches(field: &Value, wanted: &str) -> bool {
    match field {
        Value::String(s) => s.eq_ignore_ascii_case(wanted),
        Value::Number(n) => n.to_string() == wanted,
        Value::Bool(b) => b.to_string().eq_ignore_ascii_case(wanted),
        _ => false,
    }
}
