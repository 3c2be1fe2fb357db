//! Wire model of `EndpointSlice` watch events.
//!
//! Only the fields needed for resolution are modelled. Unknown fields are ignored and
//! missing or `null` arrays decode as empty, so partial objects (including the `Status`
//! carried by `ERROR` events) never fail to decode.

use k8s_openapi::api::discovery::v1::EndpointConditions;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Deserializer, Serialize};

/// The kind of a watch event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// An object was added.
    Added,
    /// An object was modified.
    Modified,
    /// An object was deleted.
    Deleted,
    /// The server reported an error.
    Error,
    /// A resource version bookmark.
    Bookmark,
    /// Any kind this crate does not recognise.
    #[default]
    #[serde(other)]
    Unknown,
}

/// One unit of the watch stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// The event kind. A missing, `null` or non-string `type` decodes as
    /// [`EventKind::Unknown`].
    #[serde(rename = "type", default, deserialize_with = "lenient_kind")]
    pub kind: EventKind,

    /// The `EndpointSlice` the event refers to.
    #[serde(rename = "object", default, skip_serializing_if = "Option::is_none")]
    pub endpoint_slice: Option<EndpointSliceSnapshot>,
}

impl WatchEvent {
    /// Creates an event for a slice.
    #[must_use]
    pub fn new(kind: EventKind, endpoint_slice: EndpointSliceSnapshot) -> Self {
        Self {
            kind,
            endpoint_slice: Some(endpoint_slice),
        }
    }
}

/// The parts of an `EndpointSlice` the resolver reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSliceSnapshot {
    /// Object metadata; only the name is used.
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Endpoints in the order received.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub endpoints: Vec<EndpointRecord>,

    /// Ports in the order received.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ports: Vec<PortRecord>,
}

impl EndpointSliceSnapshot {
    /// Returns the slice name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }
}

/// One endpoint of a slice.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// IP addresses of the endpoint.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub addresses: Vec<String>,

    /// Endpoint conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<EndpointConditions>,
}

impl EndpointRecord {
    /// Returns the `ready` condition, if reported.
    #[must_use]
    pub fn ready(&self) -> Option<bool> {
        self.conditions.as_ref().and_then(|c| c.ready)
    }

    /// Whether the endpoint may receive traffic.
    ///
    /// An unset `ready` condition counts as ready, as the Kubernetes API specifies.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready().unwrap_or(true)
    }
}

/// One port of a slice.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    /// Port name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Port number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

fn lenient_kind<'de, D>(deserializer: D) -> Result<EventKind, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default())
}
