//! Append-only history log (agent turns, session events).

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use ulid::{Generator, Ulid};

use super::matches_query;
use crate::entry::{
    Entry, ListOptions, ListResult, ReadOptions, ReadResult, SearchOptions, WriteOptions,
    WritePayload, WriteResult,
};
use crate::error::{AfsError, Result};
use crate::module::AfsModule;
use crate::path;
use crate::time::now_millis;

/// An append-only log of records.
///
/// Each appended record gets a monotonic ULID and lives at `/<ulid>`.
/// Listing and search return records newest first. Records cannot be
/// modified, renamed or deleted.
pub struct HistoryModule {
    name: String,
    description: Option<String>,
    state: Mutex<HistoryState>,
}

struct HistoryState {
    ids: Generator,
    records: BTreeMap<Ulid, Entry>,
}

impl std::fmt::Debug for HistoryModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl HistoryModule {
    /// Create an empty log.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            state: Mutex::new(HistoryState {
                ids: Generator::new(),
                records: BTreeMap::new(),
            }),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a record and return it.
    pub async fn append(&self, payload: WritePayload) -> Result<Entry> {
        let mut state = self.state.lock().await;
        let id = state
            .ids
            .generate()
            .map_err(|err| AfsError::Internal(format!("history id exhausted: {err}")))?;
        let now = now_millis();

        let mut entry = Entry::new(format!("/{id}"));
        entry.id = id.to_string();
        entry.content = payload.content;
        entry.summary = payload.summary;
        entry.metadata = payload.metadata;
        entry.user_id = payload.user_id;
        entry.session_id = payload.session_id;
        entry.agent_id = payload.agent_id;
        entry.link_to = payload.link_to;
        entry.created_at = Some(now);
        entry.updated_at = Some(now);

        state.records.insert(id, entry.clone());
        tracing::trace!(module = %self.name, id = %id, "appended history record");
        Ok(entry)
    }
}

#[async_trait]
impl AfsModule for HistoryModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<ListResult> {
        if !path::segments(path).is_empty() || options.depth() == 0 {
            return Ok(ListResult::default());
        }
        let state = self.state.lock().await;
        Ok(ListResult::new(
            state.records.values().rev().cloned().collect(),
        ))
    }

    async fn read(&self, path: &str, _options: &ReadOptions) -> Result<ReadResult> {
        let parts = path::segments(path);
        let [id] = parts.as_slice() else {
            return Ok(ReadResult::missing());
        };
        let Ok(id) = Ulid::from_string(id) else {
            return Ok(ReadResult::missing());
        };
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(&id)
            .cloned()
            .map_or_else(ReadResult::missing, ReadResult::found))
    }

    async fn write(
        &self,
        path: &str,
        payload: WritePayload,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        if !options.append && !path::segments(path).is_empty() {
            return Err(AfsError::PermissionDenied(format!(
                "history {} is append-only",
                self.name
            )));
        }
        let entry = self.append(payload).await?;
        Ok(WriteResult {
            entry,
            message: None,
        })
    }

    async fn search(
        &self,
        path: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<ListResult> {
        if !path::segments(path).is_empty() {
            return Ok(ListResult::default());
        }
        let state = self.state.lock().await;
        let found = state
            .records
            .values()
            .rev()
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
    use crate::entry::DeleteOptions;

    async fn log(module: &HistoryModule, text: &str) -> Entry {
        module
            .write(
                "/",
                WritePayload {
                    session_id: Some("s1".to_string()),
                    ..WritePayload::content(text)
                },
                &WriteOptions { append: true },
            )
            .await
            .unwrap()
            .entry
    }

    #[tokio::test]
    async fn test_records_listed_newest_first() {
        let history = HistoryModule::new("history");
        let first = log(&history, "U> hello").await;
        let second = log(&history, "A> hi there").await;
        let third = log(&history, "U> bye").await;

        let listed = history.list("/", &ListOptions::default()).await.unwrap();
        let ids: Vec<_> = listed.entries.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![third.id, second.id.clone(), first.id]);
        assert_eq!(listed.entries[0].session_id.as_deref(), Some("s1"));

        let read = history
            .read(&format!("/{}", second.id), &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(read.entry.unwrap().content, Some("A> hi there".into()));
    }

    #[tokio::test]
    async fn test_records_are_immutable() {
        let history = HistoryModule::new("history");
        let entry = log(&history, "U> hello").await;
        let err = history
            .write(&entry.path, WritePayload::content("edited"), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AfsError::PermissionDenied(_)));
        assert!(matches!(
            history.delete(&entry.path, &DeleteOptions::default()).await,
            Err(AfsError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_newest_first() {
        let history = HistoryModule::new("history");
        log(&history, "U> rust question").await;
        log(&history, "A> other").await;
        let latest = log(&history, "U> another RUST question").await;

        let found = history
            .search("/", "rust", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(found.entries.len(), 2);
        assert_eq!(found.entries[0].id, latest.id);
    }
}
