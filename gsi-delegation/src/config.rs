// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

#[cfg(feature = "cli")]
use std::{env, path::PathBuf};

#[cfg(feature = "cli")]
use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use crate::storage::StorageConfig;

/// Configuration for the delegation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The size, in bits, of the RSA keys generated for each certificate request.
    ///
    /// Defaults to 2048 if not set.
    #[serde(default = "default_key_size")]
    pub key_size: u32,

    /// The smallest RSA key size, in bits, the service will ever generate.
    ///
    /// If `key_size` is smaller than this, this size is used instead. Defaults to 1024.
    #[serde(default = "default_minimum_key_size")]
    pub minimum_key_size: u32,

    /// Where pending requests and delegated credentials are stored.
    ///
    /// Stored private keys are not encrypted, so the storage must only be accessible to the
    /// service.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_size: default_key_size(),
            minimum_key_size: default_minimum_key_size(),
            storage: StorageConfig::default(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_key_size() -> u32 {
    2048
}

fn default_minimum_key_size() -> u32 {
    crate::crypto::DEFAULT_MINIMUM_KEY_SIZE
}

/// Read and parse the configuration file at `path`.
///
/// On a parse error, the default configuration is printed so the operator can compare.
#[cfg(feature = "cli")]
fn read_config_file<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read the configuration file {}", path.display()))?;
    toml::from_str(&contents)
        .inspect_err(|error| {
            eprintln!("{} is not a valid configuration:\n{error}", path.display());
            eprintln!("The default configuration is:\n\n{}", T::default());
        })
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// Find and load the service configuration.
///
/// An explicit `path` is always used. Otherwise `default` is looked up relative to
/// `$CONFIGURATION_DIRECTORY`, which systemd sets for the service, and if there's no such file
/// the built-in defaults apply.
///
/// # Errors
///
/// Fails if the chosen file can't be read or doesn't parse.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let path = path.or_else(|| {
        let directory = env::var_os("CONFIGURATION_DIRECTORY")?;
        Some(PathBuf::from(directory).join(default)).filter(|path| path.is_file())
    });

    match path {
        Some(path) => {
            let config = read_config_file(&path)?;
            tracing::info!(path = %path.display(), "Loaded configuration");
            Ok(config)
        }
        None => {
            tracing::info!(
                default = %default.display(),
                "No configuration file; using the built-in defaults"
            );
            Ok(T::default())
        }
    }
}
