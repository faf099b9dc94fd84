//! The built-in translation driver.

use async_trait::async_trait;

use super::{
    Driver, DriverCapabilities, DriverOutput, DriverRequest, GenerationRequest, GenerationTask,
};
use crate::entry::Content;
use crate::error::DriverError;
use crate::path;
use crate::view::{Dimension, View};

/// Name of the built-in translation driver.
pub const TRANSLATION_DRIVER_NAME: &str = "i18n";

/// Translates text entries. Projections live at `/.i18n/<language>/<path>`.
#[derive(Debug, Clone)]
pub struct TranslationDriver {
    name: String,
    capabilities: DriverCapabilities,
}

impl Default for TranslationDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationDriver {
    /// The driver under its default name.
    pub fn new() -> Self {
        Self::with_name(TRANSLATION_DRIVER_NAME)
    }

    /// The driver under a custom name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: DriverCapabilities::new([Dimension::Language]),
        }
    }
}

#[async_trait]
impl Driver for TranslationDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &DriverCapabilities {
        &self.capabilities
    }

    fn can_handle(&self, view: &View) -> bool {
        view.get(Dimension::Language).is_some() && self.capabilities.covers(view)
    }

    fn storage_path(&self, path: &str, view: &View) -> String {
        let language = view.get(Dimension::Language).unwrap_or("und");
        format!("/.i18n/{language}{}", path::normalize(path))
    }

    async fn process(&self, request: DriverRequest<'_>) -> Result<DriverOutput, DriverError> {
        let context = request.require_context(&self.name)?;
        let language = request
            .view
            .get(Dimension::Language)
            .ok_or_else(|| DriverError::InvalidSource("view has no language".to_string()))?;
        let text = request
            .source
            .content
            .as_ref()
            .and_then(Content::as_text)
            .ok_or_else(|| {
                DriverError::InvalidSource(format!("{} has no text content", request.path))
            })?;

        let result = context
            .generator
            .generate(GenerationRequest {
                task: GenerationTask::Translate {
                    language: language.to_string(),
                },
                path: request.path.to_string(),
                input: Content::Text(text.into_owned()),
            })
            .await?;

        Ok(DriverOutput {
            result,
            message: Some(format!("translated {} to {language}", request.path)),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::metadata::SourceMetadata;

    #[test]
    fn test_storage_path() {
        let driver = TranslationDriver::new();
        assert_eq!(
            driver.storage_path("/guide/intro.md", &View::language("ZH")),
            "/.i18n/zh/guide/intro.md"
        );
    }

    #[tokio::test]
    async fn test_missing_context_is_usage_error() {
        let driver = TranslationDriver::new();
        let view = View::language("en");
        let source = Entry::new("/a.md").with_content("hola");
        let metadata = SourceMetadata::new("docs", "/a.md", "r1");
        let err = driver
            .process(DriverRequest {
                module: "docs",
                path: "/a.md",
                view: &view,
                source: &source,
                metadata: &metadata,
                context: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::MissingContext(name) if name == "i18n"));
    }
}
