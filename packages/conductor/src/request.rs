//! Submitted requests and the identifiers derived from them.
//!
//! Every admitted [`SequenceRequest`] carries three derived names used for
//! resource arbitration:
//!
//! - **owner** - the sequence name's leading qualifier (`"Canvas"` for
//!   `"Canvas.drop-symphony"`)
//! - **resource id** - an explicit `resourceId` / `componentId` / `elementId` /
//!   `canvasId` from the request data, otherwise `"<owner>-resource"`
//! - **instance id** - an explicit `instanceId` from the request data,
//!   otherwise `"<owner>-default"`

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Admission priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Runs ahead of everything already queued.
    High,
    #[default]
    Normal,
    /// Follow-up work: after HIGH, ahead of NORMAL.
    Chained,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Chained => "CHAINED",
        }
    }

    /// Queue tier; lower runs first.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Chained => 1,
            Priority::Normal => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Ok(Priority::High),
            "NORMAL" => Ok(Priority::Normal),
            "CHAINED" => Ok(Priority::Chained),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Identifier returned by `submit`.
///
/// A suppressed duplicate returns [`RequestId::DUPLICATE`] instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Sentinel for a suppressed duplicate (nil UUID).
    pub const DUPLICATE: Self = Self(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_duplicate(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_duplicate() {
            write!(f, "DUPLICATE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One admitted invocation of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRequest {
    pub id: RequestId,
    pub sequence_id: String,
    pub sequence_name: String,
    pub data: Map<String, Value>,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub resource_id: String,
    pub owner: String,
    pub instance_id: String,
    /// Idempotency hash recorded at admission.
    pub hash: String,
    /// Resource this request is parked behind, if deferred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

/// Data keys that name the contested resource, in lookup order.
const RESOURCE_KEYS: [&str; 4] = ["resourceId", "componentId", "elementId", "canvasId"];

/// Separators that end a sequence name's owner qualifier.
const OWNER_SEPARATORS: [char; 5] = ['.', '-', ':', '/', ' '];

/// The sequence name's leading qualifier, before the first separator.
pub fn owner_name(sequence_name: &str) -> String {
    let trimmed = sequence_name.trim();
    match trimmed.find(OWNER_SEPARATORS) {
        Some(0) | None => trimmed.to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Explicit resource id from the data, or one derived from the owner.
pub fn resource_id(owner: &str, data: &Map<String, Value>) -> String {
    RESOURCE_KEYS
        .iter()
        .find_map(|key| scalar(data.get(*key)))
        .unwrap_or_else(|| format!("{owner}-resource"))
}

/// Explicit instance id from the data, or the owner's default instance.
pub fn instance_id(owner: &str, data: &Map<String, Value>) -> String {
    scalar(data.get("instanceId")).unwrap_or_else(|| format!("{owner}-default"))
}

fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
