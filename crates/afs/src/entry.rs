//! Entries and the option/result types of the module boundary.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::driver::InvocationContext;
use crate::view::View;

/// Content payload of an entry. Its shape is backend-defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Content {
    /// UTF-8 text
    Text(String),
    /// Opaque bytes (images, archives)
    Bytes(Vec<u8>),
    /// Structured data
    Json(Value),
}

impl Content {
    /// Build content from raw bytes, preferring text when they are valid UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Content::Text(text),
            Err(err) => Content::Bytes(err.into_bytes()),
        }
    }

    /// Text view of the content, if it has one.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Content::Text(text) => Some(Cow::Borrowed(text)),
            Content::Json(value) => Some(Cow::Owned(value.to_string())),
            Content::Bytes(_) => None,
        }
    }

    /// Serialized bytes of the content.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Content::Text(text) => text.as_bytes().to_vec(),
            Content::Bytes(bytes) => bytes.clone(),
            Content::Json(value) => value.to_string().into_bytes(),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

/// Whether an entry is a leaf or a directory-like node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Leaf entry with content
    #[default]
    File,
    /// Node with children
    Directory,
}

/// The unit of the file system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Identifier, unique within the owning module
    pub id: String,
    /// Path (module-relative inside a module, absolute once routed)
    pub path: String,
    /// Leaf or directory
    #[serde(default)]
    pub kind: EntryKind,
    /// Owning user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Owning session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Owning agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Short human-readable summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Path of a related entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_to: Option<String>,
    /// Payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// Creation time (ms since epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Last modification time (ms since epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Entry {
    /// Create an empty file entry at `path`, using the path as its id.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            id: path.clone(),
            path,
            kind: EntryKind::File,
            user_id: None,
            session_id: None,
            agent_id: None,
            summary: None,
            metadata: Map::new(),
            link_to: None,
            content: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Create a directory entry at `path`.
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::new(path)
        }
    }

    /// Set the content.
    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Insert a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this is a directory-like entry.
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Field used to order list results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderField {
    /// Order by path
    Path,
    /// Order by last modification time
    UpdatedAt,
}

/// Ordering of list results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to sort on
    pub field: OrderField,
    /// Descending instead of ascending
    pub descending: bool,
}

/// Depth used for recursive listings without an explicit budget.
pub const UNBOUNDED_DEPTH: usize = usize::MAX;

/// Options for `list`
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Glob pattern matched against the path relative to the listed root
    pub filter: Option<String>,
    /// Descend without limit when no `max_depth` is given
    pub recursive: bool,
    /// Depth budget; entries deeper than this below the root are omitted
    pub max_depth: Option<usize>,
    /// Maximum number of merged results
    pub limit: Option<usize>,
    /// Result ordering
    pub order_by: Option<OrderBy>,
}

impl ListOptions {
    /// Options with an explicit depth budget.
    pub fn with_depth(max_depth: usize) -> Self {
        Self {
            max_depth: Some(max_depth),
            ..Self::default()
        }
    }

    /// Effective depth budget.
    pub fn depth(&self) -> usize {
        match (self.max_depth, self.recursive) {
            (Some(depth), _) => depth,
            (None, true) => UNBOUNDED_DEPTH,
            (None, false) => 1,
        }
    }
}

/// How a view-qualified read behaves while a projection is being generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Wait for the projection to be generated
    #[default]
    Strict,
    /// Serve the source immediately and generate in the background
    Fallback,
}

/// Options for `read`
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Requested projection
    pub view: Option<View>,
    /// Wait strategy (module default when `None`)
    pub wait: Option<WaitStrategy>,
    /// Invocation context for drivers (module default when `None`)
    pub context: Option<InvocationContext>,
}

impl ReadOptions {
    /// Options requesting a view.
    pub fn view(view: View) -> Self {
        Self {
            view: Some(view),
            ..Self::default()
        }
    }

    /// Set the wait strategy.
    pub fn wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Set the invocation context.
    pub fn context(mut self, context: InvocationContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Data written by `write`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritePayload {
    /// New content
    pub content: Option<Content>,
    /// Summary
    pub summary: Option<String>,
    /// Metadata merged into the entry
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Owning user
    pub user_id: Option<String>,
    /// Owning session
    pub session_id: Option<String>,
    /// Owning agent
    pub agent_id: Option<String>,
    /// Related entry
    pub link_to: Option<String>,
}

impl WritePayload {
    /// Payload carrying only content.
    pub fn content(content: impl Into<Content>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Options for `write`
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Append to existing content instead of replacing it
    pub append: bool,
}

/// Options for `delete`
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Delete non-empty directories
    pub recursive: bool,
}

/// Options for `rename`
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameOptions {
    /// Replace an existing destination
    pub overwrite: bool,
}

/// Options for `search`
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    /// Maximum number of results
    pub limit: Option<usize>,
    /// Match case exactly
    pub case_sensitive: bool,
}

/// Options for `exec`
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Invocation context of the caller
    pub context: Option<InvocationContext>,
}

/// Result of `list` and `search`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListResult {
    /// Matching entries
    pub entries: Vec<Entry>,
    /// Informational message (partial failures, truncation)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ListResult {
    /// Result holding `entries` and no message.
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            message: None,
        }
    }
}

/// Result of `read`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadResult {
    /// The entry, if it exists
    pub entry: Option<Entry>,
    /// Informational message (e.g. projection still generating)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReadResult {
    /// Result for an existing entry.
    pub fn found(entry: Entry) -> Self {
        Self {
            entry: Some(entry),
            message: None,
        }
    }

    /// Result for a missing entry.
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Result of `write`
#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    /// The entry as stored
    pub entry: Entry,
    /// Informational message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of `exec`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecResult {
    /// Structured output
    pub result: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_depth_defaults() {
        assert_eq!(ListOptions::default().depth(), 1);
        let recursive = ListOptions {
            recursive: true,
            ..ListOptions::default()
        };
        assert_eq!(recursive.depth(), UNBOUNDED_DEPTH);
        assert_eq!(ListOptions::with_depth(0).depth(), 0);
    }

    #[test]
    fn test_content_from_bytes() {
        assert_eq!(Content::from_bytes(b"hi".to_vec()), Content::Text("hi".into()));
        let raw = vec![0xff, 0xfe];
        assert_eq!(Content::from_bytes(raw.clone()), Content::Bytes(raw));
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let entry = Entry::new("/a.md").with_summary("a");
        let json = serde_json::to_value(&entry).unwrap_or_default();
        assert_eq!(json["path"], "/a.md");
        assert_eq!(json["summary"], "a");
        assert!(json.get("userId").is_none());
    }
}
