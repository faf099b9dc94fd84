//! The built-in image driver: renders a description into an image asset.

use async_trait::async_trait;

use super::{
    Driver, DriverCapabilities, DriverOutput, DriverRequest, GenerationRequest, GenerationTask,
};
use crate::entry::Content;
use crate::error::DriverError;
use crate::path;
use crate::view::{Dimension, View};

/// Name of the built-in image driver, used as the drivers hint of slot
/// assets.
pub const IMAGE_DRIVER_NAME: &str = "image-generate";

/// Renders images from a text description.
///
/// The description is the source entry's text content, falling back to the
/// `desc` attribute of its source record. Projections live at
/// `/.images/<format>[.<variant>]/<path>`.
#[derive(Debug, Clone)]
pub struct ImageGenerationDriver {
    capabilities: DriverCapabilities,
}

impl Default for ImageGenerationDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageGenerationDriver {
    /// The driver.
    pub fn new() -> Self {
        Self {
            capabilities: DriverCapabilities::new([Dimension::Format, Dimension::Variant]),
        }
    }
}

#[async_trait]
impl Driver for ImageGenerationDriver {
    fn name(&self) -> &str {
        IMAGE_DRIVER_NAME
    }

    fn capabilities(&self) -> &DriverCapabilities {
        &self.capabilities
    }

    fn can_handle(&self, view: &View) -> bool {
        view.get(Dimension::Format).is_some() && self.capabilities.covers(view)
    }

    fn storage_path(&self, path: &str, view: &View) -> String {
        let format = view.get(Dimension::Format).unwrap_or("bin");
        let dir = match view.get(Dimension::Variant) {
            Some(variant) => format!("{format}.{variant}"),
            None => format.to_string(),
        };
        format!("/.images/{dir}{}", path::normalize(path))
    }

    async fn process(&self, request: DriverRequest<'_>) -> Result<DriverOutput, DriverError> {
        let context = request.require_context(IMAGE_DRIVER_NAME)?;
        let format = request
            .view
            .get(Dimension::Format)
            .ok_or_else(|| DriverError::InvalidSource("view has no format".to_string()))?;

        let description = request
            .source
            .content
            .as_ref()
            .and_then(Content::as_text)
            .map(|text| text.into_owned())
            .or_else(|| {
                request
                    .metadata
                    .attrs
                    .get("desc")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .filter(|desc| !desc.trim().is_empty())
            .ok_or_else(|| {
                DriverError::InvalidSource(format!("{} has no image description", request.path))
            })?;

        let result = context
            .generator
            .generate(GenerationRequest {
                task: GenerationTask::Image {
                    format: format.to_string(),
                    variant: request.view.get(Dimension::Variant).map(str::to_string),
                },
                path: request.path.to_string(),
                input: Content::Text(description),
            })
            .await?;

        Ok(DriverOutput {
            result,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_includes_variant() {
        let driver = ImageGenerationDriver::new();
        let plain = View::new().with(Dimension::Format, "PNG");
        let thumb = plain.clone().with(Dimension::Variant, "thumb");
        assert_eq!(
            driver.storage_path("/.afs/images/by-intent/k1", &plain),
            "/.images/png/.afs/images/by-intent/k1"
        );
        assert_eq!(driver.storage_path("/hero", &thumb), "/.images/png.thumb/hero");

        let dashed = View::new().with(Dimension::Format, "png-thumb");
        assert_ne!(driver.storage_path("/hero", &dashed), driver.storage_path("/hero", &thumb));
    }
}
