// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Section-based TOML configuration shared by the binaries.
//!
//! All binaries read one `rfx.toml`; each owns a `[<section>]` table.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),
}

pub const CONFIG_FILE_NAME: &str = "rfx.toml";

/// `./rfx.toml`, then the XDG config dir, then `/etc/rfx`.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("rfx").join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from("/etc/rfx").join(CONFIG_FILE_NAME));
    paths
}

/// Parse one table out of a TOML document.
///
/// `Ok(None)` means the section is absent. The section is re-serialized
/// before deserializing so `#[serde(default)]` applies to every field.
pub fn parse_section<T: DeserializeOwned>(
    content: &str,
    key: &str,
    origin: &Path,
) -> Result<Option<T>, ConfigError> {
    let parse_err = |e: String| ConfigError::ParseError(origin.to_path_buf(), e);
    let table: toml::Table = toml::from_str(content).map_err(|e| parse_err(e.to_string()))?;
    let Some(section) = table.get(key) else {
        return Ok(None);
    };
    let section_toml = toml::to_string(section).map_err(|e| parse_err(e.to_string()))?;
    toml::from_str::<T>(&section_toml)
        .map(Some)
        .map_err(|e| parse_err(e.to_string()))
}

fn load_section_from_file<T: DeserializeOwned>(
    path: &Path,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;
    parse_section(&content, key, path)
}

pub trait ConfigFile: Sized + Default + DeserializeOwned {
    /// Table name in `rfx.toml`, e.g. `"rfx-server"`.
    fn section_key() -> &'static str;

    /// Load from an explicit path; the section must be present.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        load_section_from_file::<Self>(path, Self::section_key())?.ok_or_else(|| {
            ConfigError::ParseError(
                path.to_path_buf(),
                format!("missing [{}] section", Self::section_key()),
            )
        })
    }

    /// First default path holding the section, or defaults and `None`.
    fn load_from_default_paths() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in config_search_paths() {
            if !path.exists() {
                continue;
            }
            if let Some(cfg) = load_section_from_file::<Self>(&path, Self::section_key())? {
                return Ok((cfg, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        vials: u32,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "rfx".to_string(),
                vials: 7,
            }
        }
    }

    impl ConfigFile for Sample {
        fn section_key() -> &'static str {
            "sample"
        }
    }

    #[test]
    fn test_parse_section_applies_defaults() {
        let content = "[sample]\nvials = 3\n\n[other]\nx = 1\n";
        let parsed: Option<Sample> = parse_section(content, "sample", Path::new("rfx.toml")).unwrap();
        assert_eq!(
            parsed,
            Some(Sample {
                name: "rfx".to_string(),
                vials: 3
            })
        );
    }

    #[test]
    fn test_missing_section_is_none() {
        let parsed: Option<Sample> = parse_section("[other]\n", "sample", Path::new("x")).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let err = parse_section::<Sample>("[sample", "sample", Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_load_from_file_requires_section() {
        let path = std::env::temp_dir().join(format!("rfx-config-test-{}.toml", std::process::id()));
        std::fs::write(&path, "[other]\nx = 1\n").unwrap();
        let err = Sample::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("missing [sample] section"));
        std::fs::write(&path, "[sample]\nname = \"lab\"\n").unwrap();
        let cfg = Sample::load_from_file(&path).unwrap();
        assert_eq!(cfg.name, "lab");
        assert_eq!(cfg.vials, 7);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unreadable_file() {
        let err = Sample::load_from_file(Path::new("/nonexistent/rfx.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_, _)));
    }
}
