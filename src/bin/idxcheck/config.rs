use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use idxcheck::verify::CheckOptions;
use serde::Deserialize;
use thiserror::Error;

use super::ui::Theme;
use super::OutputFormat;

/// Settings read from the optional TOML file. Command-line flags win.
#[derive(Debug, Default)]
pub struct CliConfig {
    pub path: Option<PathBuf>,
    pub check: CheckOptions,
    pub format: Option<OutputFormat>,
    pub theme: Option<Theme>,
}

impl CliConfig {
    /// Loads `explicit`, or the default path when it exists. A missing
    /// default file is not an error; a missing explicit one is.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let (path, data) = match explicit {
            Some(path) => {
                let data = read_file(&path)?;
                (Some(path), data)
            }
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    let data = read_file(&path)?;
                    (Some(path), data)
                }
                _ => (None, RawConfig::default()),
            },
        };
        let format = data
            .output
            .format
            .as_deref()
            .map(|value| {
                OutputFormat::from_str(value, true).map_err(|_| ConfigError::InvalidValue {
                    key: "output.format",
                    value: value.to_string(),
                })
            })
            .transpose()?;
        let theme = data
            .output
            .theme
            .as_deref()
            .map(|value| {
                Theme::from_str(value, true).map_err(|_| ConfigError::InvalidValue {
                    key: "output.theme",
                    value: value.to_string(),
                })
            })
            .transpose()?;
        Ok(Self {
            path,
            check: data.check,
            format,
            theme,
        })
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    check: CheckOptions,
    #[serde(default)]
    output: OutputSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputSection {
    format: Option<String>,
    theme: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config value '{value}' is invalid for {key}")]
    InvalidValue { key: &'static str, value: String },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("idxcheck").join("config.toml"))
}
