//! Layered configuration loading.
//!
//! Sources are merged in this order, later ones winning:
//!
//! ```text
//! ZincConfig::default()
//!   < ConfigLoader::merge(..)
//!   < zinc.<profile>.toml
//!   < zinc.toml
//!   < ZINC_* environment
//! ```
//!
//! File formats follow the crate features: `toml-config` (on by default)
//! looks for `zinc.toml` and `config.toml`, `yaml-config` for the `.yaml`
//! and `.yml` spellings of the same names. The environment uses `__` for
//! nesting, so `ZINC_ADAPTERS__ONEBOT__URL` sets `adapters.onebot.url`.
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .profile("prod")
//!     .file("deploy/zinc.toml")
//!     .load()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::ZincConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ZINC_";

/// Selects `zinc.<profile>.toml` overrides. Read from `ZINC_PROFILE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn from_env() -> Self {
        match std::env::var("ZINC_PROFILE") {
            Ok(name) => name.parse().unwrap_or_default(),
            Err(_) => Profile::default(),
        }
    }
}

impl FromStr for Profile {
    type Err = std::convert::Infallible;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.to_ascii_lowercase();
        Ok(match name.as_str() {
            "dev" | "development" => Profile::Development,
            "prod" | "production" => Profile::Production,
            _ => Profile::Custom(name),
        })
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Development => f.write_str("development"),
            Profile::Production => f.write_str("production"),
            Profile::Custom(name) => f.write_str(name),
        }
    }
}

/// File names tried in every search directory, most preferred first.
const CANDIDATES: &[&str] = &[
    #[cfg(feature = "toml-config")]
    "zinc.toml",
    #[cfg(feature = "toml-config")]
    "config.toml",
    #[cfg(feature = "yaml-config")]
    "zinc.yaml",
    #[cfg(feature = "yaml-config")]
    "zinc.yml",
    #[cfg(feature = "yaml-config")]
    "config.yaml",
    #[cfg(feature = "yaml-config")]
    "config.yml",
];

/// Builds a [`ZincConfig`] from defaults, files and the environment.
pub struct ConfigLoader {
    overrides: Figment,
    profile: Profile,
    dirs: Vec<PathBuf>,
    explicit: Option<PathBuf>,
    env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader {
            overrides: Figment::new(),
            profile: Profile::from_env(),
            dirs: Vec::new(),
            explicit: None,
            env: true,
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        let name: String = profile.into();
        self.profile = name.parse().unwrap_or_default();
        self
    }

    /// Adds a directory to look for configuration files in.
    pub fn search_path<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.dirs.push(dir.as_ref().to_owned());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    /// Adds `<user config dir>/zinc` to the search paths.
    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join("zinc")),
            None => self,
        }
    }

    /// Reads exactly this file instead of searching.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit = Some(path.as_ref().to_owned());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.env = false;
        self
    }

    /// Merges configuration programmatically, below files and environment.
    pub fn merge(mut self, config: ZincConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    pub fn load(self) -> ConfigResult<ZincConfig> {
        let profile = self.profile.clone();
        let config: ZincConfig = self.into_figment()?.extract()?;
        debug!(
            %profile,
            level = %config.logging.level,
            plugins = config.plugins.len(),
            adapters = config.adapters.len(),
            "Configuration ready"
        );
        Ok(config)
    }

    fn into_figment(self) -> ConfigResult<Figment> {
        let mut figment =
            Figment::from(Serialized::defaults(ZincConfig::default())).merge(self.overrides.clone());

        match &self.explicit {
            Some(path) if !path.exists() => return Err(ConfigError::FileNotFound(path.clone())),
            Some(path) => {
                info!(path = %path.display(), "Reading configuration");
                figment = merge_file(figment, path)?;
            }
            None => figment = self.discover(figment)?,
        }

        if self.env {
            trace!(prefix = ENV_PREFIX, "Merging environment");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment)
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        if !self.dirs.is_empty() {
            return self.dirs.clone();
        }
        std::env::current_dir()
            .ok()
            .into_iter()
            .chain(dirs::config_dir().map(|dir| dir.join("zinc")))
            .collect()
    }

    /// Merges the first candidate found, preceded by its profile variant
    /// when that exists next to it.
    fn discover(&self, mut figment: Figment) -> ConfigResult<Figment> {
        let dirs = self.search_dirs();
        for dir in &dirs {
            for name in CANDIDATES {
                let Some((stem, ext)) = name.rsplit_once('.') else {
                    continue;
                };
                let variant = dir.join(format!("{stem}.{}.{ext}", self.profile));
                if variant.exists() {
                    debug!(path = %variant.display(), "Reading profile configuration");
                    figment = merge_file(figment, &variant)?;
                }
                let base = dir.join(name);
                if base.exists() {
                    info!(path = %base.display(), "Reading configuration");
                    return merge_file(figment, &base);
                }
            }
        }
        warn!(dirs = ?dirs, "No configuration file found, using defaults");
        Ok(figment)
    }
}

/// Merges `path` with the provider matching its extension.
fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Loads configuration from the current directory, the user config
/// directory and the environment.
pub fn load_config() -> ConfigResult<ZincConfig> {
    ConfigLoader::new()
        .with_current_dir()
        .with_user_config_dir()
        .load()
}

/// Loads one file plus the environment.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<ZincConfig> {
    ConfigLoader::new().file(path).load()
}
