use std::path::{Path, PathBuf};

use log::{info, warn};
use toml_edit::{DocumentMut, Item, Table};

use crate::config::Config;

pub const CONFIG_FILE_NAME: &str = "spotlight.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config directory is available on this platform")]
    NoConfigDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("failed to serialize config: {0}")]
    Serialize(String),
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

/// Copies every value of `source` into `destination`, keeping the comments and
/// formatting already attached to keys that exist in both.
fn merge_table_preserving_decor(destination: &mut Table, source: &Table) {
    for (key, source_item) in source.iter() {
        match source_item {
            Item::Table(source_table) => {
                if !destination.get(key).is_some_and(Item::is_table) {
                    destination.insert(key, Item::Table(Table::new()));
                }
                if let Some(destination_table) =
                    destination.get_mut(key).and_then(Item::as_table_mut)
                {
                    merge_table_preserving_decor(destination_table, source_table);
                }
            }
            _ => {
                set_table_value_preserving_decor(destination, key, source_item.clone());
            }
        }
    }
}

pub fn serialize_config_with_preserved_comments(
    existing_text: &str,
    config: &Config,
) -> Result<String, ConfigError> {
    let next_text =
        toml::to_string(config).map_err(|err| ConfigError::Serialize(err.to_string()))?;
    let next_document = next_text
        .parse::<DocumentMut>()
        .map_err(|err| ConfigError::Serialize(err.to_string()))?;
    let mut existing_document = existing_text
        .parse::<DocumentMut>()
        .map_err(|err| ConfigError::Serialize(err.to_string()))?;
    merge_table_preserving_decor(existing_document.as_table_mut(), next_document.as_table());
    Ok(existing_document.to_string())
}

/// Writes `config` to `path`, keeping the user's comments when the file already
/// exists and is valid TOML.
pub fn persist_config_file(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let config_text = match std::fs::read_to_string(path) {
        Ok(existing_text) => {
            match serialize_config_with_preserved_comments(&existing_text, config) {
                Ok(updated_text) => updated_text,
                Err(err) => {
                    warn!(
                        "Failed to preserve config comments for {} ({}). Falling back to plain serialization.",
                        path.display(),
                        err
                    );
                    toml::to_string(config).map_err(|err| ConfigError::Serialize(err.to_string()))?
                }
            }
        }
        Err(_) => toml::to_string(config).map_err(|err| ConfigError::Serialize(err.to_string()))?,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, config_text).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the config at `path`, creating it with defaults when missing. Keys the
/// file does not mention yet are backfilled with their defaults on disk.
pub fn load_or_create_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        let config = Config::default();
        persist_config_file(&config, path)?;
        return Ok(config);
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str::<Config>(&content).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    match serialize_config_with_preserved_comments(&content, &config) {
        Ok(updated) if updated != content => {
            info!("Backfilling new config defaults into {}", path.display());
            if let Err(err) = std::fs::write(path, updated) {
                warn!("Failed to backfill config {}: {}", path.display(), err);
            }
        }
        Ok(_) => {}
        Err(err) => warn!("Failed to backfill config {}: {}", path.display(), err),
    }
    Ok(config)
}
