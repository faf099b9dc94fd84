//! In-memory entry tree.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{matches_query, tree_listing};
use crate::entry::{
    Content, DeleteOptions, Entry, ListOptions, ListResult, ReadOptions, ReadResult,
    RenameOptions, SearchOptions, WriteOptions, WritePayload, WriteResult,
};
use crate::error::{AfsError, Result};
use crate::module::{AccessMode, AfsModule};
use crate::path;
use crate::time::now_millis;

/// A module holding entries in memory.
///
/// Directories are implicit: a path is a directory when entries exist
/// below it.
#[derive(Debug)]
pub struct MemoryModule {
    name: String,
    description: Option<String>,
    access_mode: AccessMode,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryModule {
    /// Create an empty, writable module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            access_mode: AccessMode::ReadWrite,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Reject mutations routed through the composer.
    pub fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::ReadOnly;
        self
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the module holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn is_below(base: &str, path: &str) -> bool {
    path::depth_below(base, path).is_some_and(|d| d > 0)
}

fn append(existing: Option<&Content>, extra: Content) -> Result<Content> {
    match (existing, extra) {
        (None, extra) => Ok(extra),
        (Some(Content::Text(old)), Content::Text(new)) => Ok(Content::Text(format!("{old}{new}"))),
        (Some(Content::Bytes(old)), Content::Bytes(new)) => {
            Ok(Content::Bytes([old.as_slice(), new.as_slice()].concat()))
        }
        _ => Err(AfsError::Validation(
            "cannot append content of a different type".to_string(),
        )),
    }
}

#[async_trait]
impl AfsModule for MemoryModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<ListResult> {
        let entries = self.entries.read().await;
        Ok(ListResult::new(tree_listing(
            path,
            entries.values(),
            options.depth(),
        )))
    }

    async fn read(&self, path: &str, options: &ReadOptions) -> Result<ReadResult> {
        if let Some(view) = options.view.as_ref().filter(|v| !v.is_empty()) {
            return Err(AfsError::NoDriver(view.key().to_string()));
        }
        let path = path::normalize(path);
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(&path) {
            return Ok(ReadResult::found(entry.clone()));
        }
        if entries.keys().any(|key| is_below(&path, key)) {
            return Ok(ReadResult::found(Entry::directory(path)));
        }
        Ok(ReadResult::missing())
    }

    async fn write(
        &self,
        path: &str,
        payload: WritePayload,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        let path = path::normalize(path);
        if path == "/" {
            return Err(AfsError::InvalidPath("cannot write the module root".to_string()));
        }
        let now = now_millis();
        let mut entries = self.entries.write().await;
        let mut entry = entries.get(&path).cloned().unwrap_or_else(|| {
            let mut fresh = Entry::new(path.clone());
            fresh.created_at = Some(now);
            fresh
        });

        if let Some(content) = payload.content {
            entry.content = Some(if options.append {
                append(entry.content.as_ref(), content)?
            } else {
                content
            });
        }
        if payload.summary.is_some() {
            entry.summary = payload.summary;
        }
        entry.metadata.extend(payload.metadata);
        entry.user_id = payload.user_id.or(entry.user_id);
        entry.session_id = payload.session_id.or(entry.session_id);
        entry.agent_id = payload.agent_id.or(entry.agent_id);
        entry.link_to = payload.link_to.or(entry.link_to);
        entry.updated_at = Some(now);

        entries.insert(path, entry.clone());
        Ok(WriteResult {
            entry,
            message: None,
        })
    }

    async fn delete(&self, path: &str, options: &DeleteOptions) -> Result<()> {
        let path = path::normalize(path);
        let mut entries = self.entries.write().await;
        let children: Vec<String> = entries
            .keys()
            .filter(|key| is_below(&path, key))
            .cloned()
            .collect();
        if !children.is_empty() && !options.recursive {
            return Err(AfsError::Validation(format!("directory not empty: {path}")));
        }
        let existed = entries.remove(&path).is_some();
        if !existed && children.is_empty() {
            return Err(AfsError::NotFound(path));
        }
        for child in children {
            entries.remove(&child);
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, options: &RenameOptions) -> Result<()> {
        let (from, to) = (path::normalize(from), path::normalize(to));
        if is_below(&from, &to) {
            return Err(AfsError::InvalidPath(format!("cannot move {from} into itself")));
        }
        let mut entries = self.entries.write().await;
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| **key == from || is_below(&from, key))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(AfsError::NotFound(from));
        }
        let occupied = entries.keys().any(|key| *key == to || is_below(&to, key));
        if occupied && !options.overwrite {
            return Err(AfsError::Validation(format!("destination exists: {to}")));
        }
        if occupied {
            entries.retain(|key, _| !(*key == to || is_below(&to, key)));
        }

        let base = path::segments(&from).len();
        for old in moved {
            if let Some(mut entry) = entries.remove(&old) {
                let rest = path::segments(&old)[base..].join("/");
                let new_path = path::join(&to, &rest);
                if entry.id == entry.path {
                    entry.id = new_path.clone();
                }
                entry.path = new_path.clone();
                entry.updated_at = Some(now_millis());
                entries.insert(new_path, entry);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        path: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<ListResult> {
        let base = path::normalize(path);
        let entries = self.entries.read().await;
        let found = entries
            .values()
            .filter(|e| path::depth_below(&base, &e.path).is_some())
            .filter(|e| matches_query(e, query, options.case_sensitive))
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(ListResult::new(found))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::view::View;

    async fn put(module: &MemoryModule, path: &str, text: &str) {
        module
            .write(path, WritePayload::content(text), &WriteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_read_and_append() {
        let module = MemoryModule::new("mem");
        put(&module, "/notes/a.md", "one").await;
        module
            .write(
                "/notes/a.md",
                WritePayload::content(" two"),
                &WriteOptions { append: true },
            )
            .await
            .unwrap();

        let entry = module
            .read("/notes/a.md", &ReadOptions::default())
            .await
            .unwrap()
            .entry
            .unwrap();
        assert_eq!(entry.content, Some("one two".into()));
        assert!(entry.created_at <= entry.updated_at);

        let dir = module.read("/notes", &ReadOptions::default()).await.unwrap();
        assert!(dir.entry.unwrap().is_directory());
        assert!(
            module
                .read("/missing", &ReadOptions::default())
                .await
                .unwrap()
                .entry
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_view_reads_have_no_driver() {
        let module = MemoryModule::new("mem");
        put(&module, "/a.md", "x").await;
        let err = module
            .read("/a.md", &ReadOptions::view(View::language("en")))
            .await
            .unwrap_err();
        assert!(matches!(err, AfsError::NoDriver(_)));
    }

    #[tokio::test]
    async fn test_delete_requires_recursive_for_directories() {
        let module = MemoryModule::new("mem");
        put(&module, "/dir/a.md", "x").await;
        put(&module, "/dir/b.md", "y").await;
        assert!(module.delete("/dir", &DeleteOptions::default()).await.is_err());
        module
            .delete("/dir", &DeleteOptions { recursive: true })
            .await
            .unwrap();
        assert!(module.is_empty().await);
        assert!(matches!(
            module.delete("/dir", &DeleteOptions::default()).await,
            Err(AfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let module = MemoryModule::new("mem");
        put(&module, "/old/a.md", "a").await;
        put(&module, "/old/sub/b.md", "b").await;
        put(&module, "/new/x.md", "x").await;

        assert!(
            module
                .rename("/old", "/new", &RenameOptions::default())
                .await
                .is_err()
        );
        module
            .rename("/old", "/new", &RenameOptions { overwrite: true })
            .await
            .unwrap();

        let listed = module
            .list("/", &ListOptions::with_depth(usize::MAX))
            .await
            .unwrap();
        let paths: Vec<_> = listed.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/new", "/new/a.md", "/new/sub", "/new/sub/b.md"]);
        assert_eq!(module.len().await, 2);
    }

    #[tokio::test]
    async fn test_search_scope_and_limit() {
        let module = MemoryModule::new("mem");
        put(&module, "/a/1.md", "Needle").await;
        put(&module, "/a/2.md", "needle").await;
        put(&module, "/b/3.md", "needle").await;

        let options = SearchOptions {
            limit: None,
            case_sensitive: true,
        };
        let found = module.search("/a", "needle", &options).await.unwrap();
        assert_eq!(found.entries.len(), 1);

        let options = SearchOptions {
            limit: Some(2),
            case_sensitive: false,
        };
        let found = module.search("/", "needle", &options).await.unwrap();
        assert_eq!(found.entries.len(), 2);
    }
}
