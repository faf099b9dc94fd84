//! Directory-backed document module.
//!
//! Documents are plain files under a root directory. Every write records a
//! content-hash revision, marks existing projections stale, propagates the
//! invalidation along dependency edges and scans the document for asset
//! slots. View-qualified reads go through the [`ViewEngine`]; projections
//! are stored under the same root in hidden directories (`.i18n`,
//! `.images`) that listings skip.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{matches_query, tree_listing};
use crate::driver::{
    ArtifactStore, DriverRegistry, EngineOptions, InvocationContext, Projection,
    ProjectionRequest, TRANSLATION_DRIVER_NAME, ViewEngine,
};
use crate::entry::{
    Content, DeleteOptions, Entry, ListOptions, ListResult, ReadOptions, ReadResult,
    RenameOptions, SearchOptions, UNBOUNDED_DEPTH, WriteOptions, WritePayload, WriteResult,
};
use crate::error::{AfsError, Result};
use crate::events::{AfsEvent, EventBus};
use crate::metadata::{MetadataStore, SourceMetadata};
use crate::module::{AccessMode, AfsModule, MountContext};
use crate::path;
use crate::slots::{DEFAULT_NAMESPACE, SlotScanner, asset_prefix};
use crate::time::system_time_millis;
use crate::view::View;

const DOCUMENT_KIND: &str = "document";

/// Revision token of a document body.
fn content_revision(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn is_hidden(path: &str) -> bool {
    path::segments(path).iter().any(|s| s.starts_with('.'))
}

fn stamp(mut entry: Entry, meta: &std::fs::Metadata) -> Entry {
    entry.created_at = meta.created().ok().map(system_time_millis);
    entry.updated_at = meta.modified().ok().map(system_time_millis);
    entry
}

fn resolve_under(root: &Path, path: &str) -> Result<PathBuf> {
    path::validate(path)?;
    let mut out = root.to_path_buf();
    out.extend(path::segments(path));
    Ok(out)
}

async fn read_optional(file: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(file).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Projections stored as files under the module root.
#[derive(Debug)]
struct FsArtifacts {
    root: PathBuf,
}

#[async_trait]
impl ArtifactStore for FsArtifacts {
    async fn read_artifact(&self, storage_path: &str) -> Result<Option<Content>> {
        let file = resolve_under(&self.root, storage_path)?;
        Ok(read_optional(&file).await?.map(Content::from_bytes))
    }

    async fn write_artifact(&self, storage_path: &str, content: &Content) -> Result<()> {
        let file = resolve_under(&self.root, storage_path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content.to_bytes()).await?;
        Ok(())
    }
}

/// Builder for [`DocumentModule`].
#[derive(Debug)]
pub struct DocumentModuleBuilder {
    name: String,
    root: PathBuf,
    description: Option<String>,
    read_only: bool,
    store: Option<MetadataStore>,
    drivers: Option<DriverRegistry>,
    namespace: String,
    options: EngineOptions,
    context: Option<InvocationContext>,
}

impl DocumentModuleBuilder {
    /// Start building a module named `name` over the directory `root`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            description: None,
            read_only: false,
            store: None,
            drivers: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            options: EngineOptions::default(),
            context: None,
        }
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Reject mutations routed through the composer.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Metadata store (a private in-memory store by default).
    pub fn store(mut self, store: MetadataStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Drivers (translation and image by default).
    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = Some(drivers);
        self
    }

    /// Namespace of intent-addressed asset paths.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Projection engine options.
    pub fn engine_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Invocation context used by reads that carry none.
    pub fn context(mut self, context: InvocationContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Build the module.
    pub fn build(self) -> Result<DocumentModule> {
        let store = match self.store {
            Some(store) => store,
            None => MetadataStore::open_in_memory()?,
        };
        let artifacts = Arc::new(FsArtifacts {
            root: self.root.clone(),
        });
        let mut engine = ViewEngine::new(
            store.clone(),
            self.drivers.unwrap_or_else(DriverRegistry::with_builtin),
            artifacts,
            self.options,
        );
        if let Some(context) = self.context {
            engine = engine.with_default_context(context);
        }
        Ok(DocumentModule {
            scanner: SlotScanner::new(store.clone(), self.namespace),
            name: self.name,
            description: self.description,
            access_mode: if self.read_only {
                AccessMode::ReadOnly
            } else {
                AccessMode::ReadWrite
            },
            root: self.root,
            store,
            engine,
            mount: OnceLock::new(),
        })
    }
}

/// A module serving documents from a directory, with view projections and
/// slot tracking.
pub struct DocumentModule {
    name: String,
    description: Option<String>,
    access_mode: AccessMode,
    root: PathBuf,
    store: MetadataStore,
    engine: ViewEngine,
    scanner: SlotScanner,
    mount: OnceLock<MountContext>,
}

impl fmt::Debug for DocumentModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentModule")
            .field("name", &self.name)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl DocumentModule {
    /// Start building a module.
    pub fn builder(name: impl Into<String>, root: impl Into<PathBuf>) -> DocumentModuleBuilder {
        DocumentModuleBuilder::new(name, root)
    }

    /// The module's metadata store.
    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// The module's slot scanner.
    pub fn scanner(&self) -> &SlotScanner {
        &self.scanner
    }

    /// The backing directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn fs_path(&self, path: &str) -> Result<PathBuf> {
        resolve_under(&self.root, path)
    }

    fn events(&self) -> Option<EventBus> {
        self.mount.get().map(|ctx| ctx.events.clone())
    }

    fn writable_path(path: &str) -> Result<String> {
        let path = path::normalize(path);
        path::validate(&path)?;
        if path == "/" || is_hidden(&path) {
            return Err(AfsError::InvalidPath(format!(
                "{path} is not a writable document path"
            )));
        }
        Ok(path)
    }

    /// Files and directories below `base`, hidden names excluded.
    async fn walk(&self, base: &str, budget: usize) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut pending = vec![(path::normalize(base), 0usize)];
        while let Some((dir, depth)) = pending.pop() {
            if depth >= budget {
                continue;
            }
            let mut reader = match tokio::fs::read_dir(self.fs_path(&dir)?).await {
                Ok(reader) => reader,
                Err(err)
                    if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            while let Some(item) = reader.next_entry().await? {
                let name = item.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let child = path::join(&dir, &name);
                let meta = item.metadata().await?;
                if meta.is_dir() {
                    out.push(stamp(Entry::directory(child.clone()), &meta));
                    pending.push((child, depth + 1));
                } else {
                    out.push(stamp(Entry::new(child), &meta));
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Record `bytes` as the current body of `path`.
    ///
    /// When the revision changed, existing projections and their dependents
    /// go stale, slots are re-scanned and `SourceChanged` is published.
    async fn sync_source(
        &self,
        path: &str,
        bytes: &[u8],
        attrs: Option<Map<String, Value>>,
    ) -> Result<SourceMetadata> {
        let revision = content_revision(bytes);
        let previous = self.store.get_source(&self.name, path).await?;
        let changed = previous
            .as_ref()
            .is_none_or(|p| p.source_revision != revision);
        if !changed
            && attrs.is_none()
            && let Some(previous) = previous
        {
            return Ok(previous);
        }

        let mut meta = SourceMetadata::new(&self.name, path, &revision)
            .with_drivers_hint([TRANSLATION_DRIVER_NAME])
            .with_kind(DOCUMENT_KIND);
        meta.attrs = match attrs {
            Some(attrs) => attrs,
            None => previous.map(|p| p.attrs).unwrap_or_default(),
        };
        let stored = self.store.set_source(meta).await?;
        if !changed {
            return Ok(stored);
        }

        self.store.mark_views_as_stale(&self.name, path).await?;
        self.store.invalidate_dependents(&self.name, path).await?;
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                self.scanner.scan(&self.name, path, text, &revision).await?;
            }
            Err(_) => {
                self.store.sync_slots(path, Vec::new()).await?;
            }
        }
        tracing::debug!(module = %self.name, path = %path, revision = %revision, "source changed");
        if let Some(events) = self.events() {
            events.publish(AfsEvent::SourceChanged {
                module: self.name.clone(),
                path: path.to_string(),
                revision,
            });
        }
        Ok(stored)
    }

    /// Drop every record and artifact derived from `path`.
    async fn forget(&self, path: &str) -> Result<()> {
        self.store.invalidate_dependents(&self.name, path).await?;
        for view in self.store.list_views(&self.name, path).await? {
            let Some(storage_path) = view.storage_path else {
                continue;
            };
            match tokio::fs::remove_file(self.fs_path(&storage_path)?).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.store.delete_views(&self.name, path, None).await?;
        self.store.delete_dependencies(path).await?;
        self.store.sync_slots(path, Vec::new()).await?;
        self.store.delete_source(&self.name, path).await?;
        Ok(())
    }

    fn document_entry(
        path: &str,
        bytes: Vec<u8>,
        source: Option<&SourceMetadata>,
        meta: &std::fs::Metadata,
    ) -> Entry {
        let mut entry = stamp(Entry::new(path), meta).with_content(Content::from_bytes(bytes));
        if let Some(source) = source {
            entry.summary = source
                .attrs
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(Value::Object(extra)) = source.attrs.get("metadata") {
                entry.metadata.extend(extra.clone());
            }
            entry = entry.with_metadata("revision", source.source_revision.clone());
        }
        entry
    }

    async fn project(
        &self,
        path: &str,
        source: Entry,
        metadata: SourceMetadata,
        view: &View,
        options: &ReadOptions,
    ) -> Result<ReadResult> {
        let key = view.key();
        let projection = self
            .engine
            .project(ProjectionRequest {
                module: self.name.clone(),
                path: path.to_string(),
                view: view.clone(),
                source: source.clone(),
                metadata,
                wait: options.wait,
                context: options.context.clone(),
                events: self.events(),
            })
            .await?;

        let mut entry = source;
        let message = match projection {
            Projection::Fresh(content) => {
                entry.content = Some(content);
                None
            }
            Projection::Generated { content, message } => {
                entry.content = Some(content);
                message
            }
            Projection::Pending => {
                return Ok(ReadResult {
                    entry: Some(entry),
                    message: Some(format!("view {key} is generating; serving source")),
                });
            }
        };
        entry = entry.with_metadata("view", key.to_string());
        Ok(ReadResult {
            entry: Some(entry),
            message,
        })
    }

    async fn read_asset(
        &self,
        path: &str,
        view: Option<&View>,
        options: &ReadOptions,
    ) -> Result<ReadResult> {
        let Some(metadata) = self.store.get_source(&self.name, path).await? else {
            return Ok(ReadResult::missing());
        };
        let desc = match self.store.slot_for_asset(path).await? {
            Some(slot) => slot.desc,
            None => metadata
                .attrs
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        let mut entry = Entry::new(path)
            .with_content(desc)
            .with_metadata("kind", "asset")
            .with_metadata("intentKey", path::file_name(path));
        entry.created_at = Some(metadata.created_at);
        entry.updated_at = Some(metadata.updated_at);

        match view {
            Some(view) => self.project(path, entry, metadata, view, options).await,
            None => Ok(ReadResult::found(entry)),
        }
    }
}

#[async_trait]
impl AfsModule for DocumentModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    fn on_mount(&self, ctx: MountContext) {
        let mount_path = ctx.mount_path.clone();
        if self.mount.set(ctx).is_err() {
            tracing::warn!(module = %self.name, mount = %mount_path, "module mounted twice");
        }
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<ListResult> {
        let base = path::normalize(path);
        let assets_dir = path::normalize(&asset_prefix(self.scanner.namespace()));
        if base == assets_dir {
            let assets: Vec<Entry> = self
                .store
                .asset_paths()
                .await?
                .into_iter()
                .map(Entry::new)
                .collect();
            return Ok(ListResult::new(tree_listing(&base, &assets, options.depth())));
        }
        Ok(ListResult::new(self.walk(&base, options.depth()).await?))
    }

    async fn read(&self, path: &str, options: &ReadOptions) -> Result<ReadResult> {
        let path = path::normalize(path);
        path::validate(&path)?;
        let view = options.view.as_ref().filter(|v| !v.is_empty());
        if self.scanner.is_asset_path(&path) {
            return self.read_asset(&path, view, options).await;
        }

        let file = self.fs_path(&path)?;
        let meta = match tokio::fs::metadata(&file).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ReadResult::missing()),
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            if view.is_some() {
                return Err(AfsError::Validation(format!(
                    "views apply to documents, {path} is a directory"
                )));
            }
            return Ok(ReadResult::found(stamp(Entry::directory(path), &meta)));
        }

        let bytes = tokio::fs::read(&file).await?;
        match view {
            None => {
                let source = self.store.get_source(&self.name, &path).await?;
                Ok(ReadResult::found(Self::document_entry(
                    &path,
                    bytes,
                    source.as_ref(),
                    &meta,
                )))
            }
            Some(view) => {
                // Out-of-band edits show up here as a revision mismatch
                let source = self.sync_source(&path, &bytes, None).await?;
                let entry = Self::document_entry(&path, bytes, Some(&source), &meta);
                self.project(&path, entry, source, view, options).await
            }
        }
    }

    async fn write(
        &self,
        path: &str,
        payload: WritePayload,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        let path = Self::writable_path(path)?;
        let file = self.fs_path(&path)?;
        let existing = read_optional(&file).await?;
        let bytes = match (payload.content, existing) {
            (Some(content), Some(mut old)) if options.append => {
                old.extend(content.to_bytes());
                old
            }
            (Some(content), _) => content.to_bytes(),
            (None, Some(old)) => old,
            (None, None) => Vec::new(),
        };

        // Reject malformed slot annotations before anything is written
        if let Ok(text) = std::str::from_utf8(&bytes) {
            self.scanner.plan(&path, text, "")?;
        }

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, &bytes).await?;

        let mut attrs = self
            .store
            .get_source(&self.name, &path)
            .await?
            .map(|p| p.attrs)
            .unwrap_or_default();
        if let Some(summary) = payload.summary {
            attrs.insert("summary".to_string(), Value::String(summary));
        }
        if !payload.metadata.is_empty() {
            let mut merged = match attrs.remove("metadata") {
                Some(Value::Object(existing)) => existing,
                _ => Map::new(),
            };
            merged.extend(payload.metadata);
            attrs.insert("metadata".to_string(), Value::Object(merged));
        }

        let source = self.sync_source(&path, &bytes, Some(attrs)).await?;
        let meta = tokio::fs::metadata(&file).await?;
        let mut entry = Self::document_entry(&path, bytes, Some(&source), &meta);
        entry.user_id = payload.user_id;
        entry.session_id = payload.session_id;
        entry.agent_id = payload.agent_id;
        entry.link_to = payload.link_to;
        Ok(WriteResult {
            entry,
            message: None,
        })
    }

    async fn delete(&self, path: &str, options: &DeleteOptions) -> Result<()> {
        let path = Self::writable_path(path)?;
        let file = self.fs_path(&path)?;
        let meta = match tokio::fs::metadata(&file).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(AfsError::NotFound(path)),
            Err(err) => return Err(err.into()),
        };

        if meta.is_dir() {
            let mut reader = tokio::fs::read_dir(&file).await?;
            if !options.recursive && reader.next_entry().await?.is_some() {
                return Err(AfsError::Validation(format!("directory not empty: {path}")));
            }
            for entry in self.walk(&path, UNBOUNDED_DEPTH).await? {
                if !entry.is_directory() {
                    self.forget(&entry.path).await?;
                }
            }
            tokio::fs::remove_dir_all(&file).await?;
        } else {
            tokio::fs::remove_file(&file).await?;
            self.forget(&path).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, options: &RenameOptions) -> Result<()> {
        let from = Self::writable_path(from)?;
        let to = Self::writable_path(to)?;
        let source = self.fs_path(&from)?;
        let target = self.fs_path(&to)?;

        let meta = match tokio::fs::metadata(&source).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(AfsError::NotFound(from)),
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            return Err(AfsError::InvalidPath(format!(
                "only documents can be renamed: {from}"
            )));
        }
        if tokio::fs::try_exists(&target).await? && !options.overwrite {
            return Err(AfsError::Validation(format!("destination exists: {to}")));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;

        let attrs = self
            .store
            .get_source(&self.name, &from)
            .await?
            .map(|p| p.attrs);
        let bytes = tokio::fs::read(&target).await?;
        self.forget(&from).await?;
        self.sync_source(&to, &bytes, attrs).await?;
        Ok(())
    }

    async fn search(
        &self,
        path: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<ListResult> {
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        for entry in self.walk(path, UNBOUNDED_DEPTH).await? {
            if found.len() >= limit {
                break;
            }
            if entry.is_directory() {
                continue;
            }
            let Some(bytes) = read_optional(&self.fs_path(&entry.path)?).await? else {
                continue;
            };
            let Ok(text) = String::from_utf8(bytes) else {
                continue;
            };
            let entry = entry.with_content(text);
            if matches_query(&entry, query, options.case_sensitive) {
                found.push(entry);
            }
        }
        Ok(ListResult::new(found))
    }
}
