//! Image model backends and the factory that picks one by name.

#[cfg(feature = "flux")]
mod flux;
mod remote;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::config::ModelConfig;
use crate::ImageModel;

#[cfg(feature = "flux")]
pub use flux::{FluxLoader, FluxModel};
pub use remote::RemoteModel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    pub fn from_config(config: &ModelConfig) -> Self {
        if config.cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(config.device)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    pub fn repo(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "black-forest-labs/FLUX.1-schnell",
            FluxVariant::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    pub fn weights_file(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
        }
    }
}

/// Which backend a configured model name refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Flux(FluxVariant),
    /// Base URL of a generation server
    Remote(String),
}

impl BackendKind {
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name = model_name.trim();
        if name.starts_with("http://") || name.starts_with("https://") {
            return Some(BackendKind::Remote(name.trim_end_matches('/').to_string()));
        }

        let name_upper = name.to_uppercase();
        if name_upper.contains("FLUX") {
            Some(BackendKind::Flux(if name_upper.contains("DEV") {
                FluxVariant::Dev
            } else {
                // schnell unless asked otherwise
                FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Load the configured backend.
pub async fn load_backend(config: &ModelConfig) -> Result<Box<dyn ImageModel>> {
    let kind = BackendKind::from_name(&config.backend)
        .ok_or_else(|| anyhow!("Unsupported model backend: {}", config.backend))?;

    info!("Loading model backend {} ({:?})", config.backend, kind);

    match kind {
        BackendKind::Remote(url) => Ok(Box::new(RemoteModel::new(&url)?)),
        #[cfg(feature = "flux")]
        BackendKind::Flux(variant) => {
            let api = hf_hub::api::tokio::Api::new()?;
            let model = FluxLoader::load(variant, api, DeviceMap::from_config(config)).await?;
            Ok(Box::new(model))
        }
        #[cfg(not(feature = "flux"))]
        BackendKind::Flux(variant) => Err(anyhow!(
            "{:?} needs the `flux` feature, which this build does not have",
            variant
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_name() {
        assert_eq!(
            BackendKind::from_name("flux-schnell"),
            Some(BackendKind::Flux(FluxVariant::Schnell))
        );
        assert_eq!(
            BackendKind::from_name("black-forest-labs/FLUX.1-dev"),
            Some(BackendKind::Flux(FluxVariant::Dev))
        );
        assert_eq!(
            BackendKind::from_name("http://127.0.0.1:8000/"),
            Some(BackendKind::Remote("http://127.0.0.1:8000".into()))
        );
        assert_eq!(BackendKind::from_name("sd-1.4"), None);
    }

    #[test]
    fn test_device_map_from_config() {
        let mut config = ModelConfig::default();
        assert_eq!(DeviceMap::from_config(&config), DeviceMap::Ordinal(0));
        config.cpu = true;
        assert_eq!(DeviceMap::from_config(&config), DeviceMap::ForceCpu);
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_to_load() {
        let config = ModelConfig {
            backend: "dalle".into(),
            ..ModelConfig::default()
        };
        assert!(load_backend(&config).await.is_err());
    }
}
