//! Transformation drivers.
//!
//! A driver declares the view dimensions it understands and produces a
//! projection of a source entry. Drivers are selected first-match, in
//! registration order, by [`Driver::can_handle`].
//!
//! Selection is conservative: the default `can_handle` rejects the empty
//! view and any view carrying a dimension outside the driver's declared
//! capabilities. Built-in drivers additionally require their primary
//! dimension (`language` for translation, `format` for images).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::entry::{Content, Entry};
use crate::error::DriverError;
use crate::metadata::SourceMetadata;
use crate::view::{Dimension, View};

mod engine;
mod image;
mod translation;

pub use engine::{ArtifactStore, EngineOptions, Projection, ProjectionRequest, ViewEngine};
pub use image::{IMAGE_DRIVER_NAME, ImageGenerationDriver};
pub use translation::{TRANSLATION_DRIVER_NAME, TranslationDriver};

/// The view dimensions a driver understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Supported dimensions
    pub dimensions: Vec<Dimension>,
}

impl DriverCapabilities {
    /// Capabilities over `dimensions`.
    pub fn new(dimensions: impl IntoIterator<Item = Dimension>) -> Self {
        Self {
            dimensions: dimensions.into_iter().collect(),
        }
    }

    /// Whether `dim` is supported.
    pub fn supports(&self, dim: Dimension) -> bool {
        self.dimensions.contains(&dim)
    }

    /// Whether every dimension present in `view` is supported.
    pub fn covers(&self, view: &View) -> bool {
        view.dimensions().all(|(dim, _)| self.supports(dim))
    }
}

/// What a [`Generator`] is asked to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationTask {
    /// Translate text into `language`
    Translate {
        /// Target language
        language: String,
    },
    /// Render an image from a description
    Image {
        /// Output format (`png`, `webp`)
        format: String,
        /// Optional variant (`thumbnail`)
        variant: Option<String>,
    },
}

/// Input handed to a [`Generator`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Task to perform
    pub task: GenerationTask,
    /// Module-relative path of the source
    pub path: String,
    /// Source text or asset description
    pub input: Content,
}

/// The backend that performs the actual transformation (an AI model call,
/// a renderer). Supplied by the caller through an [`InvocationContext`].
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce the transformed content.
    async fn generate(&self, request: GenerationRequest) -> Result<Content, DriverError>;
}

/// Per-invocation context handed to drivers.
///
/// The generator is the cancellation boundary: a cancelled call surfaces
/// as a [`DriverError::Generation`] and fails the projection.
#[derive(Clone)]
pub struct InvocationContext {
    /// Generation backend
    pub generator: Arc<dyn Generator>,
    /// Caller-defined attributes (user, session, model hints)
    pub attrs: Map<String, Value>,
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

impl InvocationContext {
    /// Context using `generator`.
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            attrs: Map::new(),
        }
    }

    /// Insert an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Everything a driver receives for one projection.
#[derive(Debug, Clone, Copy)]
pub struct DriverRequest<'a> {
    /// Owning module
    pub module: &'a str,
    /// Module-relative source path
    pub path: &'a str,
    /// Requested view
    pub view: &'a View,
    /// The source entry
    pub source: &'a Entry,
    /// Source revision record
    pub metadata: &'a SourceMetadata,
    /// Invocation context, if the caller supplied one
    pub context: Option<&'a InvocationContext>,
}

impl<'a> DriverRequest<'a> {
    /// The invocation context, or [`DriverError::MissingContext`].
    pub fn require_context(&self, driver: &str) -> Result<&'a InvocationContext, DriverError> {
        self.context
            .ok_or_else(|| DriverError::MissingContext(driver.to_string()))
    }
}

/// What a driver produced.
#[derive(Debug, Clone)]
pub struct DriverOutput {
    /// The projection
    pub result: Content,
    /// Informational message
    pub message: Option<String>,
}

/// A pluggable producer of view projections.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver name, referenced by `drivers_hint`
    fn name(&self) -> &str;

    /// Declared capabilities
    fn capabilities(&self) -> &DriverCapabilities;

    /// Whether this driver can produce `view`
    fn can_handle(&self, view: &View) -> bool {
        !view.is_empty() && self.capabilities().covers(view)
    }

    /// Module-relative path where the projection of `path` is stored
    fn storage_path(&self, path: &str, view: &View) -> String;

    /// Produce the projection
    async fn process(&self, request: DriverRequest<'_>) -> Result<DriverOutput, DriverError>;
}

/// Ordered set of drivers.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The translation and image drivers, in that order.
    pub fn with_builtin() -> Self {
        Self::new()
            .with(TranslationDriver::new())
            .with(ImageGenerationDriver::new())
    }

    /// Builder-style [`DriverRegistry::register`].
    pub fn with(mut self, driver: impl Driver + 'static) -> Self {
        self.register(Arc::new(driver));
        self
    }

    /// Append a driver; earlier drivers win ties.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.push(driver);
    }

    /// The first driver able to produce `view`.
    pub fn select(&self, view: &View) -> Option<Arc<dyn Driver>> {
        self.drivers
            .iter()
            .find(|driver| driver.can_handle(view))
            .cloned()
    }

    /// Look a driver up by name.
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.name() == name).cloned()
    }

    /// Registered driver names, in order.
    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_is_conservative() {
        let registry = DriverRegistry::with_builtin();

        let language = View::language("zh");
        assert_eq!(registry.select(&language).unwrap().name(), TRANSLATION_DRIVER_NAME);

        let image = View::parse("format=png;variant=thumb").unwrap();
        assert_eq!(registry.select(&image).unwrap().name(), IMAGE_DRIVER_NAME);

        // Translation does not ignore an extra format dimension
        let mixed = View::parse("language=en;format=png").unwrap();
        assert!(registry.select(&mixed).is_none());

        // Variant alone lacks the format the image driver needs
        let variant_only = View::parse("variant=thumb").unwrap();
        assert!(registry.select(&variant_only).is_none());

        assert!(registry.select(&View::new()).is_none());
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let registry = DriverRegistry::new()
            .with(TranslationDriver::with_name("first"))
            .with(TranslationDriver::with_name("second"));
        assert_eq!(registry.select(&View::language("en")).unwrap().name(), "first");
        assert_eq!(registry.names(), vec!["first", "second"]);
        assert!(registry.by_name("second").is_some());
        assert!(registry.by_name("third").is_none());
    }

    #[test]
    fn test_capabilities_cover() {
        let caps = DriverCapabilities::new([Dimension::Format, Dimension::Variant]);
        assert!(caps.covers(&View::parse("format=png").unwrap()));
        assert!(!caps.covers(&View::parse("format=png;policy=draft").unwrap()));
    }
}
