//! Bot configuration
//!
//! Layered with figment: built-in defaults, then a TOML file, then
//! `DREAMBOT_`-prefixed environment variables (`__` separates sections, e.g.
//! `DREAMBOT_AUTH__TOKEN`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "dreambot.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub auth: AuthConfig,
    pub options: OptionsConfig,
    pub files: FilesConfig,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Chat platform bot token
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsConfig {
    pub command_prefix: String,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            command_prefix: "!".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Where downloaded source images are written
    pub download_path: PathBuf,
    /// When set, every generated image is also saved here
    pub output_dir: Option<PathBuf>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("downloads"),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `flux-schnell`, `flux-dev`, or the base URL of a generation server
    pub backend: String,
    pub cpu: bool,
    pub device: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "flux-schnell".to_string(),
            cpu: false,
            device: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest width * height a request may ask for
    pub max_pixels: u64,
    /// Largest attachment the chat platform accepts, in bytes
    pub upload_ceiling: usize,
    pub queue_timeout_secs: u64,
    pub generation_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pixels: 1024 * 1024,
            upload_ceiling: 8_000_000,
            queue_timeout_secs: 600,
            generation_timeout_secs: 600,
        }
    }
}

impl LimitsConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

impl Config {
    /// Loads defaults, then `path` (if it exists), then the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = Self::figment(path.as_ref()).extract()?;
        config.check()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DREAMBOT_").split("__"))
    }

    /// Rejects settings the bot cannot run with. `load` calls this; call it
    /// again after applying overrides.
    pub fn check(&self) -> Result<()> {
        if self.options.command_prefix.is_empty() {
            return Err(Error::validation("options.command_prefix must not be empty"));
        }
        if self.limits.max_pixels == 0 || self.limits.upload_ceiling == 0 {
            return Err(Error::validation(
                "limits.max_pixels and limits.upload_ceiling must be positive",
            ));
        }
        Ok(())
    }

    /// The bot token, which is only needed once we connect.
    pub fn token(&self) -> Result<&str> {
        self.auth
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::validation("auth.token is not set"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.options.command_prefix, "!");
        assert_eq!(config.limits.upload_ceiling, 8_000_000);
        assert_eq!(config.model.backend, "flux-schnell");
        assert!(config.token().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[auth]
token = "abc123"

[options]
command_prefix = "/"

[files]
download_path = "dl"
output_dir = "out"

[limits]
max_pixels = 262144
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.token().unwrap(), "abc123");
        assert_eq!(config.options.command_prefix, "/");
        assert_eq!(config.files.download_path, PathBuf::from("dl"));
        assert_eq!(config.files.output_dir, Some(PathBuf::from("out")));
        assert_eq!(config.limits.max_pixels, 262144);
        // untouched sections keep their defaults
        assert_eq!(config.limits.queue_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_bad_value_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits]\nmax_pixels = \"lots\"").unwrap();
        assert!(matches!(Config::load(file.path()), Err(Error::Config(_))));
    }
}
