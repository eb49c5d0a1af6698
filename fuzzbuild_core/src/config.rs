use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Which build layout detection should produce.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutSelection {
    /// Prepackaged bundle if its variable is set, local checkout otherwise.
    #[default]
    Auto,
    Bundle,
    Local,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DetectSettings {
    #[serde(default = "default_bundle_dir_var")]
    pub bundle_dir_var: String,
    #[serde(default = "default_root_dir_var")]
    pub root_dir_var: String,
    #[serde(default = "default_root")]
    pub default_root: PathBuf,
    #[serde(default)]
    pub layout: LayoutSelection,
}

/// Set by the ClusterFuzz build manager when it unpacks a build bundle.
pub fn default_bundle_dir_var() -> String {
    "FUCHSIA_RESOURCES_DIR".to_string()
}

pub fn default_root_dir_var() -> String {
    "FUCHSIA_DIR".to_string()
}

pub fn default_root() -> PathBuf {
    PathBuf::from("../..")
}

impl Default for DetectSettings {
    fn default() -> Self {
        Self {
            bundle_dir_var: default_bundle_dir_var(),
            root_dir_var: default_root_dir_var(),
            default_root: default_root(),
            layout: LayoutSelection::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SymbolizerSettings {
    /// Searched after the layout's own build-id directories.
    #[serde(default)]
    pub extra_build_id_dirs: Vec<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

pub fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzBuildConfig {
    #[serde(default)]
    pub detect: DetectSettings,
    #[serde(default)]
    pub symbolizer: SymbolizerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl FuzzBuildConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
