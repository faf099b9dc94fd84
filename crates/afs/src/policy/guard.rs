//! Policy-enforcing module wrapper.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::handler::{Operation, PolicyDecision, PolicyHandler};
use crate::entry::{
    DeleteOptions, ExecOptions, ExecResult, ListOptions, ListResult, ReadOptions, ReadResult,
    RenameOptions, SearchOptions, WriteOptions, WritePayload, WriteResult,
};
use crate::error::{AfsError, Result};
use crate::module::{AccessMode, AfsModule, MountContext};

/// Wraps a module and checks every call against a [`PolicyHandler`]
/// before delegating.
///
/// Paths are checked as the module sees them, relative to its mount.
/// Entries returned by `list` and `search` that the policy would not let
/// the caller read are dropped.
pub struct GuardedModule<M: AfsModule + ?Sized, P: PolicyHandler + ?Sized> {
    inner: Arc<M>,
    policy: Arc<P>,
}

impl<M: AfsModule + ?Sized, P: PolicyHandler + ?Sized> GuardedModule<M, P> {
    /// Guard `inner` with `policy`.
    pub fn new(inner: Arc<M>, policy: Arc<P>) -> Self {
        Self { inner, policy }
    }

    /// The wrapped module.
    pub fn inner(&self) -> &Arc<M> {
        &self.inner
    }

    fn check(&self, path: &str, operation: Operation) -> Result<()> {
        match self.policy.check_access(path, operation) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => {
                tracing::debug!(
                    module = %self.inner.name(),
                    path = %path,
                    operation = ?operation,
                    reason = %reason,
                    "policy denied access"
                );
                Err(AfsError::PermissionDenied(reason))
            }
        }
    }

    fn visible(&self, mut result: ListResult) -> ListResult {
        result.entries.retain(|entry| {
            self.policy
                .check_access(&entry.path, Operation::Read)
                .is_allowed()
        });
        result
    }
}

impl<M: AfsModule + ?Sized, P: PolicyHandler + ?Sized> Clone for GuardedModule<M, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<M: AfsModule + ?Sized, P: PolicyHandler + ?Sized> fmt::Debug for GuardedModule<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedModule")
            .field("module", &self.inner.name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<M: AfsModule + ?Sized + 'static, P: PolicyHandler + ?Sized + 'static> AfsModule
    for GuardedModule<M, P>
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> Option<&str> {
        self.inner.description()
    }

    fn access_mode(&self) -> AccessMode {
        self.inner.access_mode()
    }

    fn on_mount(&self, ctx: MountContext) {
        self.inner.on_mount(ctx);
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<ListResult> {
        self.check(path, Operation::List)?;
        Ok(self.visible(self.inner.list(path, options).await?))
    }

    async fn read(&self, path: &str, options: &ReadOptions) -> Result<ReadResult> {
        self.check(path, Operation::Read)?;
        self.inner.read(path, options).await
    }

    async fn write(
        &self,
        path: &str,
        payload: WritePayload,
        options: &WriteOptions,
    ) -> Result<WriteResult> {
        self.check(path, Operation::Write)?;
        self.inner.write(path, payload, options).await
    }

    async fn delete(&self, path: &str, options: &DeleteOptions) -> Result<()> {
        self.check(path, Operation::Delete)?;
        self.inner.delete(path, options).await
    }

    async fn rename(&self, from: &str, to: &str, options: &RenameOptions) -> Result<()> {
        self.check(from, Operation::Rename)?;
        self.check(to, Operation::Rename)?;
        self.inner.rename(from, to, options).await
    }

    async fn search(
        &self,
        path: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<ListResult> {
        self.check(path, Operation::Search)?;
        Ok(self.visible(self.inner.search(path, query, options).await?))
    }

    async fn exec(
        &self,
        path: &str,
        args: serde_json::Value,
        options: &ExecOptions,
    ) -> Result<ExecResult> {
        self.check(path, Operation::Exec)?;
        self.inner.exec(path, args, options).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::modules::MemoryModule;
    use crate::policy::{PolicyBuilder, ReadOnlyPolicy};

    async fn seeded() -> Arc<MemoryModule> {
        let module = MemoryModule::new("notes");
        for path in ["/public/a.md", "/private/b.md"] {
            module
                .write(path, WritePayload::content("text"), &WriteOptions::default())
                .await
                .unwrap();
        }
        Arc::new(module)
    }

    #[tokio::test]
    async fn test_denied_write_never_reaches_module() {
        let inner = seeded().await;
        let guarded = GuardedModule::new(Arc::clone(&inner), Arc::new(ReadOnlyPolicy));
        let err = guarded
            .write("/public/c.md", WritePayload::content("x"), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AfsError::PermissionDenied(_)));
        let read = inner.read("/public/c.md", &ReadOptions::default()).await.unwrap();
        assert!(read.entry.is_none());
    }

    #[tokio::test]
    async fn test_listing_hides_unreadable_entries() {
        let policy = PolicyBuilder::allow_by_default().deny("/private/**").build();
        let guarded = GuardedModule::new(seeded().await, Arc::new(policy));

        let listed = guarded
            .list("/", &ListOptions::with_depth(usize::MAX))
            .await
            .unwrap();
        let paths: Vec<_> = listed.entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"/public/a.md"));
        assert!(!paths.iter().any(|p| p.starts_with("/private")));

        assert!(guarded.read("/private/b.md", &ReadOptions::default()).await.is_err());
        let found = guarded
            .search("/", "text", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(found.entries.len(), 1);
    }
}
