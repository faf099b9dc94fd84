//! View projection dispatch.
//!
//! The engine decides whether a cached projection is fresh, claims the
//! `generating` state before running a driver, and records the outcome.
//! The claim is a single compare-and-set in the metadata store, so two
//! readers of the same view never both run a driver.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Driver, DriverRegistry, DriverRequest, InvocationContext};
use crate::entry::{Content, Entry, WaitStrategy};
use crate::error::{AfsError, DriverError, Result};
use crate::events::{AfsEvent, EventBus};
use crate::metadata::{DependencyEdge, MetadataStore, SourceMetadata, ViewMetadata, ViewState};
use crate::time::millis_ago;
use crate::view::{View, ViewKey};

/// Role recorded on the edge from a projection to its own source.
const SOURCE_ROLE: &str = "source";

/// Physical storage for generated projections.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read an artifact, `None` if it does not exist.
    async fn read_artifact(&self, storage_path: &str) -> Result<Option<Content>>;

    /// Write an artifact, replacing any previous one.
    async fn write_artifact(&self, storage_path: &str, content: &Content) -> Result<()>;
}

/// Timing and default behaviour of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// How often a strict reader re-checks an in-flight generation
    pub poll_interval: Duration,
    /// Upper bound for one driver run and for a strict reader's wait
    pub generation_timeout: Duration,
    /// Wait strategy when the caller does not pick one
    pub default_wait: WaitStrategy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            generation_timeout: Duration::from_secs(120),
            default_wait: WaitStrategy::Strict,
        }
    }
}

/// One view-qualified read.
#[derive(Debug, Clone)]
pub struct ProjectionRequest {
    /// Owning module
    pub module: String,
    /// Module-relative source path
    pub path: String,
    /// Requested view
    pub view: View,
    /// Current source entry
    pub source: Entry,
    /// Current source record
    pub metadata: SourceMetadata,
    /// Wait strategy; engine default when `None`
    pub wait: Option<WaitStrategy>,
    /// Invocation context; engine default when `None`
    pub context: Option<InvocationContext>,
    /// Where to announce the outcome
    pub events: Option<EventBus>,
}

/// Outcome of [`ViewEngine::project`].
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// A cached projection derived from the current revision
    Fresh(Content),
    /// Generated during this call
    Generated {
        /// The projection
        content: Content,
        /// Driver message
        message: Option<String>,
    },
    /// Generation is in flight (fallback strategy); serve the source
    Pending,
}

/// Runs drivers against the metadata state machine.
#[derive(Clone)]
pub struct ViewEngine {
    store: MetadataStore,
    drivers: Arc<DriverRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    default_context: Option<InvocationContext>,
    options: EngineOptions,
}

impl fmt::Debug for ViewEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewEngine")
            .field("drivers", &self.drivers)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A claimed generation, owned so it can move onto a background task.
struct Job {
    driver: Arc<dyn Driver>,
    key: ViewKey,
    storage_path: String,
    request: ProjectionRequest,
    context: Option<InvocationContext>,
}

impl ViewEngine {
    /// Create an engine.
    pub fn new(
        store: MetadataStore,
        drivers: DriverRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            drivers: Arc::new(drivers),
            artifacts,
            default_context: None,
            options,
        }
    }

    /// Use `context` for reads that carry none.
    pub fn with_default_context(mut self, context: InvocationContext) -> Self {
        self.default_context = Some(context);
        self
    }

    /// The drivers this engine dispatches to.
    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// The engine's options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Serve or produce the projection described by `request`.
    ///
    /// Fails with [`AfsError::Validation`] when a view value is not a
    /// single path segment and with [`AfsError::NoDriver`] when no driver
    /// can produce the view. Driver failures are recorded on the view and returned.
    pub async fn project(&self, request: ProjectionRequest) -> Result<Projection> {
        request.view.validate()?;
        let key = request.view.key();
        let driver = self
            .drivers
            .select(&request.view)
            .ok_or_else(|| AfsError::NoDriver(key.to_string()))?;
        let storage_path = driver.storage_path(&request.path, &request.view);
        let revision = request.metadata.source_revision.clone();
        let wait = request.wait.unwrap_or(self.options.default_wait);
        let deadline = Instant::now() + self.options.generation_timeout;
        let mut waited = false;

        loop {
            let row = self
                .store
                .get_view_by_key(&request.module, &request.path, &key)
                .await?;
            match &row {
                Some(row) if row.is_fresh(&revision) => {
                    let stored = row.storage_path.as_deref().unwrap_or(&storage_path);
                    if let Some(content) = self.artifacts.read_artifact(stored).await? {
                        return Ok(Projection::Fresh(content));
                    }
                    tracing::debug!(
                        module = %request.module,
                        path = %request.path,
                        view = %key,
                        "artifact missing for ready view"
                    );
                    self.store
                        .mark_view_stale(&request.module, &request.path, &key)
                        .await?;
                    continue;
                }
                Some(row) if row.state == ViewState::Generating && !self.is_abandoned(row) => {
                    if wait == WaitStrategy::Fallback {
                        return Ok(Projection::Pending);
                    }
                    if Instant::now() >= deadline {
                        return Err(AfsError::Timeout(format!(
                            "{}:{} [{}]",
                            request.module, request.path, key
                        )));
                    }
                    waited = true;
                    tokio::time::sleep(self.options.poll_interval).await;
                    continue;
                }
                Some(row) if waited && row.state == ViewState::Failed => {
                    // The run we waited on failed; report it rather than retry
                    let message = row.error.clone().unwrap_or_default();
                    return Err(DriverError::Generation(message).into());
                }
                _ => {}
            }

            let claimed = self
                .store
                .try_begin_generation(
                    &request.module,
                    &request.path,
                    &key,
                    &revision,
                    &storage_path,
                    self.options.generation_timeout,
                )
                .await?;
            if !claimed {
                // Lost the race; the next pass sees the winner's state
                continue;
            }

            let context = request
                .context
                .clone()
                .or_else(|| self.default_context.clone());
            let job = Job {
                driver: Arc::clone(&driver),
                key: key.clone(),
                storage_path: storage_path.clone(),
                request,
                context,
            };

            let handle = self.spawn(job);
            return match wait {
                WaitStrategy::Strict => {
                    // Dropping this read leaves the spawned run going
                    let (content, message) = handle
                        .await
                        .map_err(|err| DriverError::Generation(err.to_string()))??;
                    Ok(Projection::Generated { content, message })
                }
                WaitStrategy::Fallback => Ok(Projection::Pending),
            };
        }
    }

    /// A `generating` row nobody has touched for a whole generation timeout.
    fn is_abandoned(&self, row: &ViewMetadata) -> bool {
        row.updated_at < millis_ago(self.options.generation_timeout)
    }

    /// Run a claimed job on its own task.
    ///
    /// A panicking driver still moves the row to `failed`.
    fn spawn(&self, job: Job) -> JoinHandle<Result<(Content, Option<String>)>> {
        let engine = self.clone();
        let module = job.request.module.clone();
        let path = job.request.path.clone();
        let key = job.key.clone();
        let events = job.request.events.clone();
        tokio::spawn(async move {
            let run = tokio::spawn({
                let engine = engine.clone();
                async move { engine.run(job).await }
            });
            let err = match run.await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "view generation returned an error");
                    return Err(err);
                }
                Err(err) => err,
            };
            let message = format!("generation aborted: {err}");
            tracing::warn!(
                module = %module,
                path = %path,
                view = %key,
                error = %message,
                "view generation aborted"
            );
            engine
                .store
                .fail_generation(&module, &path, &key, &message)
                .await?;
            if let Some(events) = &events {
                events.publish(AfsEvent::ViewFailed {
                    module,
                    path,
                    view: key,
                    error: message.clone(),
                });
            }
            Err(DriverError::Generation(message).into())
        })
    }

    async fn run(&self, job: Job) -> Result<(Content, Option<String>)> {
        let Job {
            driver,
            key,
            storage_path,
            request,
            context,
        } = job;
        let module = request.module.as_str();
        let path = request.path.as_str();
        let revision = request.metadata.source_revision.as_str();
        tracing::debug!(
            module = %module,
            path = %path,
            view = %key,
            driver = driver.name(),
            "generating view"
        );

        let driver_request = DriverRequest {
            module,
            path,
            view: &request.view,
            source: &request.source,
            metadata: &request.metadata,
            context: context.as_ref(),
        };
        let outcome = match tokio::time::timeout(
            self.options.generation_timeout,
            driver.process(driver_request),
        )
        .await
        {
            Ok(outcome) => outcome.map_err(AfsError::from),
            Err(_) => Err(AfsError::Driver(DriverError::Generation(format!(
                "timed out after {:?}",
                self.options.generation_timeout
            )))),
        };
        let stored = match outcome {
            Ok(output) => self
                .artifacts
                .write_artifact(&storage_path, &output.result)
                .await
                .map(|()| output),
            Err(err) => Err(err),
        };

        let output = match stored {
            Ok(output) => output,
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(
                    module = %module,
                    path = %path,
                    view = %key,
                    error = %message,
                    "view generation failed"
                );
                self.store
                    .fail_generation(module, path, &key, &message)
                    .await?;
                if let Some(events) = &request.events {
                    events.publish(AfsEvent::ViewFailed {
                        module: module.to_string(),
                        path: path.to_string(),
                        view: key.clone(),
                        error: message,
                    });
                }
                return Err(err);
            }
        };

        self.store
            .complete_generation(module, path, &key, revision, &storage_path)
            .await?;
        self.store
            .record_dependency(DependencyEdge::new(
                path,
                key.clone(),
                path,
                revision,
                SOURCE_ROLE,
            ))
            .await?;
        tracing::debug!(module = %module, path = %path, view = %key, "view ready");
        if let Some(events) = &request.events {
            events.publish(AfsEvent::ViewReady {
                module: module.to_string(),
                path: path.to_string(),
                view: key,
            });
        }
        Ok((output.result, output.message))
    }
}
