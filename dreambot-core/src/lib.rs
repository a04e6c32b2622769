pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod images;
pub mod packager;
pub mod reply;
pub mod router;
pub mod service;

use std::time::Duration;

pub use backend::{load_backend, BackendKind, DeviceMap};
pub use config::Config;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use packager::{ImageFormat, UploadPacket};
pub use reply::ChatReply;
pub use router::{AttachmentRef, Command, Invocation, Router};
pub use service::DreamBot;

use image::DynamicImage;

/// A source image for img2img, with the fraction of the schedule to re-noise.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImage {
    pub image: DynamicImage,
    pub strength: f64,
}

/// One prompt's worth of work for the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub count: u32,
    pub width: u32,
    pub height: u32,
    pub guidance: f64,
    pub seed: Option<u64>,
    pub steps: usize,
    pub source: Option<SourceImage>,
    pub requester: String,
}

impl GenerationRequest {
    pub const MAX_COUNT: u32 = 10;

    /// A request with the default sampling parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            count: 1,
            width: 512,
            height: 512,
            guidance: 7.5,
            seed: None,
            steps: 50,
            source: None,
            requester: String::new(),
        }
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Checks the bounds every request must satisfy before reaching a model.
    pub fn validate(&self, max_pixels: u64) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }
        if !(1..=Self::MAX_COUNT).contains(&self.count) {
            return Err(Error::validation(format!(
                "n must be between 1 and {} inclusive",
                Self::MAX_COUNT
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::validation("width and height must be positive"));
        }
        if self.pixels() > max_pixels {
            return Err(Error::validation(format!(
                "{}x{} is {} pixels, the limit is {}",
                self.width,
                self.height,
                self.pixels(),
                max_pixels
            )));
        }
        if !self.guidance.is_finite() {
            return Err(Error::validation(format!(
                "guidance scale must be a finite number, got {}",
                self.guidance
            )));
        }
        if self.steps == 0 {
            return Err(Error::validation("steps must be at least 1"));
        }
        if let Some(source) = &self.source {
            if !(source.strength > 0.0 && source.strength < 1.0) {
                return Err(Error::validation(format!(
                    "strength must be strictly between 0 and 1, got {}",
                    source.strength
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub image: DynamicImage,
    pub seed: u64,
}

/// Output of one request, in seed order.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub images: Vec<GeneratedImage>,
    pub elapsed: Duration,
}

impl GenerationResult {
    pub fn seeds(&self) -> Vec<u64> {
        self.images.iter().map(|img| img.seed).collect()
    }
}

/// A loaded image model. Holds exclusive device state, hence `&mut self`.
///
/// `generate` is blocking and produces exactly one image for the given seed.
pub trait ImageModel: Send {
    fn generate(&mut self, request: &GenerationRequest, seed: u64) -> anyhow::Result<DynamicImage>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let req = GenerationRequest::new("a lighthouse at dusk");
        assert_eq!((req.count, req.width, req.height, req.steps), (1, 512, 512, 50));
        assert_eq!(req.guidance, 7.5);
        req.validate(512 * 512).unwrap();
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut req = GenerationRequest::new("x");
        req.count = 11;
        assert!(matches!(req.validate(u64::MAX), Err(Error::Validation(_))));

        let mut req = GenerationRequest::new("x");
        req.width = 1024;
        assert!(matches!(req.validate(512 * 512), Err(Error::Validation(_))));

        let mut req = GenerationRequest::new("x");
        req.source = Some(SourceImage {
            image: DynamicImage::new_rgb8(8, 8),
            strength: 1.0,
        });
        assert!(matches!(req.validate(u64::MAX), Err(Error::Validation(_))));

        assert!(GenerationRequest::new("   ").validate(u64::MAX).is_err());

        for guidance in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut req = GenerationRequest::new("x");
            req.guidance = guidance;
            assert!(matches!(req.validate(u64::MAX), Err(Error::Validation(_))));
        }
    }
}
