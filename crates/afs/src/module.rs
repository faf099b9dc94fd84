//! The module boundary.
//!
//! A module is a named backend mounted at a path. It implements any subset
//! of the operations below; the defaults report
//! [`AfsError::Unsupported`]. All paths a module sees and returns are
//! relative to its mount path; the router re-qualifies them.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;

use crate::entry::{
    DeleteOptions, ExecOptions, ExecResult, ListOptions, ListResult, ReadOptions, ReadResult,
    RenameOptions, SearchOptions, WriteOptions, WritePayload, WriteResult,
};
use crate::error::{AfsError, Result};
use crate::events::{AfsEvent, EventBus};
use crate::router::Afs;

/// Whether a module accepts mutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Only `list`, `read`, `search` and `exec`
    ReadOnly,
    /// All operations
    #[default]
    ReadWrite,
}

/// Non-owning reference from a module back to the composer.
///
/// Used for routing follow-up calls; it never keeps the composer alive.
#[derive(Debug, Clone)]
pub struct RootHandle {
    root: Weak<Afs>,
}

impl RootHandle {
    pub(crate) fn new(root: Weak<Afs>) -> Self {
        Self { root }
    }

    /// The composer, if it is still alive.
    pub fn upgrade(&self) -> Option<Arc<Afs>> {
        self.root.upgrade()
    }
}

/// Handed to a module when it is mounted.
#[derive(Debug, Clone)]
pub struct MountContext {
    /// Normalized mount path
    pub mount_path: String,
    /// Back-reference to the composer
    pub root: RootHandle,
    /// Event bus shared by all modules
    pub events: EventBus,
}

impl MountContext {
    /// Publish an event on the shared bus.
    pub fn publish(&self, event: AfsEvent) {
        self.events.publish(event);
    }
}

/// A backend mounted into the file system.
#[async_trait]
pub trait AfsModule: Send + Sync {
    /// Module name, used as the metadata namespace
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> Option<&str> {
        None
    }

    /// Whether the module accepts mutations
    fn access_mode(&self) -> AccessMode {
        AccessMode::ReadWrite
    }

    /// Called once when the module is mounted
    fn on_mount(&self, _ctx: MountContext) {}

    /// List entries below `path`, at most `options.depth()` levels deep
    async fn list(&self, _path: &str, _options: &ListOptions) -> Result<ListResult> {
        Err(AfsError::unsupported(self.name(), "list"))
    }

    /// Read one entry
    async fn read(&self, _path: &str, _options: &ReadOptions) -> Result<ReadResult> {
        Err(AfsError::unsupported(self.name(), "read"))
    }

    /// Create or update one entry
    async fn write(
        &self,
        _path: &str,
        _payload: WritePayload,
        _options: &WriteOptions,
    ) -> Result<WriteResult> {
        Err(AfsError::unsupported(self.name(), "write"))
    }

    /// Delete one entry
    async fn delete(&self, _path: &str, _options: &DeleteOptions) -> Result<()> {
        Err(AfsError::unsupported(self.name(), "delete"))
    }

    /// Move an entry within the module
    async fn rename(&self, _from: &str, _to: &str, _options: &RenameOptions) -> Result<()> {
        Err(AfsError::unsupported(self.name(), "rename"))
    }

    /// Search entries below `path`
    async fn search(
        &self,
        _path: &str,
        _query: &str,
        _options: &SearchOptions,
    ) -> Result<ListResult> {
        Err(AfsError::unsupported(self.name(), "search"))
    }

    /// Invoke an executable entry
    async fn exec(
        &self,
        _path: &str,
        _args: serde_json::Value,
        _options: &ExecOptions,
    ) -> Result<ExecResult> {
        Err(AfsError::unsupported(self.name(), "exec"))
    }
}
