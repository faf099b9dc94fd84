//! The composer: routes path-addressed operations to mounted modules.
//!
//! Mount points are matched segment-wise. Point operations (`read`, `write`,
//! `delete`, `rename`, `exec`) go to the longest matching mount. Aggregate
//! operations (`list`, `search`) fan out to every mount that covers the
//! requested path *and* every mount below it, then merge the results with
//! paths re-qualified to absolute form.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::entry::{
    DeleteOptions, Entry, ExecOptions, ExecResult, ListOptions, ListResult, OrderField,
    ReadOptions, ReadResult, RenameOptions, SearchOptions, WriteOptions, WritePayload,
    WriteResult,
};
use crate::error::{AfsError, Result};
use crate::events::{AfsEvent, DEFAULT_EVENT_CAPACITY, EventBus};
use crate::module::{AccessMode, AfsModule, MountContext, RootHandle};
use crate::path;

/// Description of one mount.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    /// Normalized mount path
    pub path: String,
    /// Module name
    pub module: String,
    /// Module description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the module accepts mutations
    pub access_mode: AccessMode,
}

struct Mount {
    path: String,
    segments: Vec<String>,
    module: Arc<dyn AfsModule>,
}

impl Mount {
    fn qualify(&self, mut entry: Entry) -> Entry {
        entry.path = path::join(&self.path, &entry.path);
        entry
    }
}

/// A module selected for a fan-out call.
struct Target<'a> {
    mount: &'a Mount,
    /// Path to pass to the module
    relative: String,
    /// How many segments the mount sits below the requested root
    depth: usize,
}

/// Builder that mounts modules and produces the composer.
///
/// Mounting only happens here; once built, the mount table is fixed.
///
/// # Example
///
/// ```rust,ignore
/// let afs = AfsBuilder::new()
///     .mount("/docs", DocumentModule::new(...))
///     .mount("/history", HistoryModule::new("history"))
///     .build()?;
/// ```
pub struct AfsBuilder {
    mounts: Vec<(String, Arc<dyn AfsModule>)>,
    event_capacity: usize,
}

impl fmt::Debug for AfsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfsBuilder")
            .field(
                "mounts",
                &self.mounts.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl Default for AfsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AfsBuilder {
    /// Create a builder with no mounts.
    pub fn new() -> Self {
        Self {
            mounts: Vec::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Mount a module at `path`.
    pub fn mount(self, path: &str, module: impl AfsModule + 'static) -> Self {
        self.mount_arc(path, Arc::new(module))
    }

    /// Mount a shared module at `path`.
    pub fn mount_arc(mut self, path: &str, module: Arc<dyn AfsModule>) -> Self {
        self.mounts.push((path::normalize(path), module));
        self
    }

    /// Capacity of the event channel.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the composer and notify every module that it was mounted.
    ///
    /// Fails if two modules share a mount path.
    pub fn build(self) -> Result<Arc<Afs>> {
        let mut seen = HashSet::new();
        let mut mounts = Vec::with_capacity(self.mounts.len());
        for (mount_path, module) in self.mounts {
            path::validate(&mount_path)?;
            if !seen.insert(mount_path.clone()) {
                return Err(AfsError::Validation(format!(
                    "mount path already in use: {mount_path}"
                )));
            }
            mounts.push(Mount {
                segments: path::segments(&mount_path)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                path: mount_path,
                module,
            });
        }

        let events = EventBus::new(self.event_capacity);
        let afs = Arc::new(Afs {
            mounts,
            events: events.clone(),
        });

        for mount in &afs.mounts {
            tracing::debug!(
                mount = %mount.path,
                module = %mount.module.name(),
                "mounting module"
            );
            mount.module.on_mount(MountContext {
                mount_path: mount.path.clone(),
                root: RootHandle::new(Arc::downgrade(&afs)),
                events: events.clone(),
            });
        }

        Ok(afs)
    }
}

/// The agent file system: a fixed set of mounted modules.
pub struct Afs {
    mounts: Vec<Mount>,
    events: EventBus,
}

impl fmt::Debug for Afs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Afs")
            .field(
                "mounts",
                &self.mounts.iter().map(|m| &m.path).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Afs {
    /// Start building a composer.
    pub fn builder() -> AfsBuilder {
        AfsBuilder::new()
    }

    /// Mounted modules in registration order.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts
            .iter()
            .map(|m| MountInfo {
                path: m.path.clone(),
                module: m.module.name().to_string(),
                description: m.module.description().map(str::to_string),
                access_mode: m.module.access_mode(),
            })
            .collect()
    }

    /// The shared event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Find the longest mount covering `path`. Ties keep the first registered.
    fn resolve(&self, path: &str) -> Result<(&Mount, String)> {
        let segments = path::segments(path);
        let mut best: Option<&Mount> = None;
        for mount in &self.mounts {
            if path::is_prefix(&mount.segments, &segments)
                && best.is_none_or(|b| mount.segments.len() > b.segments.len())
            {
                best = Some(mount);
            }
        }
        let mount = best.ok_or_else(|| AfsError::NoModule(path::normalize(path)))?;
        let relative = path::from_segments(&segments[mount.segments.len()..]);
        Ok((mount, relative))
    }

    fn resolve_writable(&self, path: &str) -> Result<(&Mount, String)> {
        path::validate(path)?;
        let (mount, relative) = self.resolve(path)?;
        if mount.module.access_mode() == AccessMode::ReadOnly {
            return Err(AfsError::PermissionDenied(format!(
                "module {} is read-only",
                mount.module.name()
            )));
        }
        Ok((mount, relative))
    }

    /// Mounts at or above `root` and mounts below it, in registration order.
    fn fan_out_targets(&self, root: &[&str]) -> Vec<Target<'_>> {
        let mut targets = Vec::new();
        for mount in &self.mounts {
            if path::is_prefix(&mount.segments, root) {
                targets.push(Target {
                    mount,
                    relative: path::from_segments(&root[mount.segments.len()..]),
                    depth: 0,
                });
            } else if path::is_prefix(root, &mount.segments) {
                targets.push(Target {
                    mount,
                    relative: "/".to_string(),
                    depth: mount.segments.len() - root.len(),
                });
            }
        }
        targets
    }

    /// List entries under `path` across every relevant module.
    ///
    /// A module mounted `d` segments below `path` receives a depth budget of
    /// `max_depth - d` and is skipped when that would be negative. Intermediate
    /// segments leading to such mounts appear as directory entries. A failing
    /// module is logged and left out of the result.
    pub async fn list(&self, path: &str, options: &ListOptions) -> Result<ListResult> {
        let root = path::normalize(path);
        let root_segments = path::segments(&root);
        let max_depth = options.depth();

        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut calls = Vec::new();

        for target in self.fan_out_targets(&root_segments) {
            if target.depth > max_depth {
                tracing::trace!(
                    mount = %target.mount.path,
                    depth = target.depth,
                    max_depth,
                    "skipping module beyond depth budget"
                );
                continue;
            }

            for level in 1..=target.depth {
                let node =
                    path::from_segments(&target.mount.segments[..root_segments.len() + level]);
                if seen.insert(node.clone()) {
                    let mut entry = Entry::directory(node);
                    if level == target.depth {
                        entry = entry.with_metadata("module", target.mount.module.name());
                        if let Some(desc) = target.mount.module.description() {
                            entry = entry.with_summary(desc);
                        }
                    }
                    entries.push(entry);
                }
            }

            let module_options = ListOptions {
                max_depth: Some(max_depth - target.depth),
                recursive: options.recursive,
                ..ListOptions::default()
            };
            calls.push(async move {
                let result = target
                    .mount
                    .module
                    .list(&target.relative, &module_options)
                    .await;
                (target.mount, result)
            });
        }

        let mut failed = Vec::new();
        for (mount, result) in join_all(calls).await {
            match result {
                Ok(list) => entries.extend(list.entries.into_iter().map(|e| mount.qualify(e))),
                Err(err) => {
                    tracing::warn!(
                        module = %mount.module.name(),
                        mount = %mount.path,
                        error = %err,
                        "module failed during list, excluding its entries"
                    );
                    failed.push(mount.module.name().to_string());
                }
            }
        }

        let entries = finish_listing(&root, entries, options)?;
        Ok(ListResult {
            entries,
            message: failure_message(&failed),
        })
    }

    /// Read one entry from the longest matching mount.
    pub async fn read(&self, path: &str, options: &ReadOptions) -> Result<ReadResult> {
        let (mount, relative) = self.resolve(path)?;
        let mut result = mount.module.read(&relative, options).await?;
        result.entry = result.entry.map(|e| mount.qualify(e));
        Ok(result)
    }

    /// Write one entry to the longest matching mount.
    pub async fn write(
        &self,
        path: &str,
        payload: WritePayload,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        let (mount, relative) = self.resolve_writable(path)?;
        let mut result = mount.module.write(&relative, payload, options).await?;
        result.entry = mount.qualify(result.entry);
        self.events.publish(AfsEvent::EntryWritten {
            path: result.entry.path.clone(),
        });
        Ok(result)
    }

    /// Delete one entry.
    pub async fn delete(&self, path: &str, options: &DeleteOptions) -> Result<()> {
        let (mount, relative) = self.resolve_writable(path)?;
        mount.module.delete(&relative, options).await?;
        self.events.publish(AfsEvent::EntryDeleted {
            path: path::join(&mount.path, &relative),
        });
        Ok(())
    }

    /// Rename an entry. Both paths must resolve to the same mount.
    pub async fn rename(&self, from: &str, to: &str, options: &RenameOptions) -> Result<()> {
        let (mount, from_relative) = self.resolve_writable(from)?;
        let (to_mount, to_relative) = self.resolve_writable(to)?;
        if mount.path != to_mount.path {
            return Err(AfsError::InvalidPath(format!(
                "cannot rename across modules: {from} -> {to}"
            )));
        }
        mount
            .module
            .rename(&from_relative, &to_relative, options)
            .await?;
        self.events.publish(AfsEvent::EntryRenamed {
            from: path::join(&mount.path, &from_relative),
            to: path::join(&mount.path, &to_relative),
        });
        Ok(())
    }

    /// Search every module at or below `path`.
    pub async fn search(
        &self,
        path: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<ListResult> {
        let root = path::normalize(path);
        let root_segments = path::segments(&root);

        let calls = self
            .fan_out_targets(&root_segments)
            .into_iter()
            .map(|target| async move {
                let result = target
                    .mount
                    .module
                    .search(&target.relative, query, options)
                    .await;
                (target.mount, result)
            });

        let mut entries = Vec::new();
        let mut failed = Vec::new();
        for (mount, result) in join_all(calls).await {
            match result {
                Ok(list) => entries.extend(list.entries.into_iter().map(|e| mount.qualify(e))),
                Err(err) => {
                    tracing::warn!(
                        module = %mount.module.name(),
                        mount = %mount.path,
                        error = %err,
                        "module failed during search, excluding its entries"
                    );
                    failed.push(mount.module.name().to_string());
                }
            }
        }

        if let Some(limit) = options.limit {
            entries.truncate(limit);
        }
        Ok(ListResult {
            entries,
            message: failure_message(&failed),
        })
    }

    /// Invoke an executable entry.
    pub async fn exec(
        &self,
        path: &str,
        args: serde_json::Value,
        options: &ExecOptions,
    ) -> Result<ExecResult> {
        let (mount, relative) = self.resolve(path)?;
        mount.module.exec(&relative, args, options).await
    }
}

fn failure_message(failed: &[String]) -> Option<String> {
    (!failed.is_empty()).then(|| {
        format!(
            "{} module(s) failed and were excluded: {}",
            failed.len(),
            failed.join(", ")
        )
    })
}

/// Apply filter, ordering and limit to a merged listing.
fn finish_listing(
    root: &str,
    mut entries: Vec<Entry>,
    options: &ListOptions,
) -> Result<Vec<Entry>> {
    if let Some(filter) = &options.filter {
        let pattern = glob::Pattern::new(filter)
            .map_err(|e| AfsError::Validation(format!("invalid filter {filter}: {e}")))?;
        let root_len = path::segments(root).len();
        entries.retain(|entry| {
            let parts = path::segments(&entry.path);
            let relative = parts
                .get(root_len..)
                .map(|rest| rest.join("/"))
                .unwrap_or_default();
            pattern.matches(&relative)
        });
    }

    if let Some(order) = options.order_by {
        match order.field {
            OrderField::Path => entries.sort_by(|a, b| a.path.cmp(&b.path)),
            OrderField::UpdatedAt => entries.sort_by_key(|e| e.updated_at),
        }
        if order.descending {
            entries.reverse();
        }
    }

    if let Some(limit) = options.limit {
        entries.truncate(limit);
    }
    Ok(entries)
}
