//! Change Event Types - postgres_changes compatible format

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Row mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown change kind '{other}'")),
        }
    }
}

/// Which event kinds a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventFilter {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[default]
    #[serde(rename = "*")]
    All,
}

impl EventFilter {
    #[inline]
    pub fn accepts(self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Insert => kind == ChangeKind::Insert,
            Self::Update => kind == ChangeKind::Update,
            Self::Delete => kind == ChangeKind::Delete,
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::All => "*",
        }
    }
}

/// Single change delivered by the transport.
///
/// `new` carries the post-image for INSERT/UPDATE, `old` the pre-image
/// for UPDATE/DELETE (often only the primary key for DELETE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

pub(crate) fn default_schema() -> String {
    "public".into()
}

impl ChangeEvent {
    #[inline]
    pub fn insert(table: &str, row: Value) -> Self {
        Self::new(table, ChangeKind::Insert, Some(row), None)
    }
    #[inline]
    pub fn update(table: &str, old: Option<Value>, row: Value) -> Self {
        Self::new(table, ChangeKind::Update, Some(row), old)
    }
    #[inline]
    pub fn delete(table: &str, old: Value) -> Self {
        Self::new(table, ChangeKind::Delete, None, Some(old))
    }

    fn new(table: &str, kind: ChangeKind, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            kind,
            commit_timestamp: Some(chrono::Utc::now().to_rfc3339()),
            new,
            old,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Row image that identifies the affected row: pre-image for DELETE,
    /// post-image otherwise.
    #[inline]
    pub fn record(&self) -> Option<&Value> {
        match self.kind {
            ChangeKind::Delete => self.old.as_ref(),
            ChangeKind::Insert | ChangeKind::Update => self.new.as_ref(),
        }
    }

    /// Identity value of the affected row
    #[inline]
    pub fn identity(&self, field: &str) -> Option<&Value> {
        self.record().and_then(|r| r.get(field))
    }
}

/// Current time in milliseconds since UNIX epoch
#[inline(always)]
pub fn ts_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
