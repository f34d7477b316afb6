//! Configuration loading helpers.

mod vars;

pub use vars::{Interpolated, interpolate};

use serde::de::DeserializeOwned;
use snafu::prelude::*;
use std::path::Path;

use crate::error::{
    ConfigError, EnvInterpolationSnafu, ReadFileSnafu, UnsupportedFormatSnafu, YamlParseSnafu,
};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Interpolate environment variables into `text` and parse the result as YAML.
pub fn parse_yaml<T: DeserializeOwned>(text: &str) -> Result<T, ConfigError> {
    let interpolated = interpolate(text);
    ensure!(
        interpolated.is_ok(),
        EnvInterpolationSnafu {
            message: interpolated.errors.join("\n"),
        }
    );
    serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)
}

/// Read a YAML file from disk and parse it with [`parse_yaml`].
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    ensure!(
        is_yaml_file(path),
        UnsupportedFormatSnafu {
            path: path.to_path_buf()
        }
    );
    let text = std::fs::read_to_string(path).context(ReadFileSnafu {
        path: path.to_path_buf(),
    })?;
    parse_yaml(&text)
}
