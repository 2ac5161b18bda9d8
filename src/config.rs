//! Configuration management for the OSS server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::upload::{
    UploadSettings, DEFAULT_MAX_CHUNKS, DEFAULT_MAX_FILE_SIZE, DEFAULT_SESSION_TTL_SECS,
};

/// Longest accepted session TTL: one year
pub const MAX_SESSION_TTL_SECS: i64 = 365 * 24 * 60 * 60;

/// Request body bytes reserved for multipart framing around a chunk
const MULTIPART_OVERHEAD_BYTES: u64 = 4 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, in bytes
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory; chunks live under `uploads/`, artifacts under
    /// `files/`, merges in progress under `staging/`
    pub root: PathBuf,
    /// Prefix of published file URLs; empty for relative URLs
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub session_ttl_secs: i64,
    pub cleanup_interval_secs: u64,
    pub max_file_size: u64,
    pub max_chunks: usize,
    /// Checksum index entries loaded into memory at startup
    pub checksum_cache_preload: usize,
}

impl StorageConfig {
    pub fn chunk_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn object_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }
}

impl UploadConfig {
    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl Config {
    /// Settings handed to the upload coordinator
    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            session_ttl: chrono::Duration::seconds(
                self.upload.session_ttl_secs.clamp(1, MAX_SESSION_TTL_SECS),
            ),
            max_file_size: self.upload.max_file_size,
            max_chunks: self.upload.max_chunks.max(1),
            max_chunk_size: (self.server.max_body_bytes as u64)
                .saturating_sub(MULTIPART_OVERHEAD_BYTES),
            public_base_url: self.storage.public_base_url.clone(),
            staging_dir: self.storage.staging_dir(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                max_body_bytes: 50 * 1024 * 1024,
            },
            storage: StorageConfig {
                root: PathBuf::from("./data"),
                public_base_url: String::new(),
            },
            database: DatabaseConfig {
                url: "sqlite:./data/oss.db".to_string(),
            },
            upload: UploadConfig {
                session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
                cleanup_interval_secs: 300,
                max_file_size: DEFAULT_MAX_FILE_SIZE,
                max_chunks: DEFAULT_MAX_CHUNKS,
                checksum_cache_preload: 1000,
            },
        }
    }
}

/// Error raised for a malformed environment variable
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {name}: {value:?}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

impl Config {
    /// Build a configuration from the environment, falling back to defaults
    /// for unset variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
                max_body_bytes: parse_var("MAX_REQUEST_BODY_BYTES", defaults.server.max_body_bytes)?,
            },
            storage: StorageConfig {
                root: env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.root),
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.storage.public_base_url),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                session_ttl_secs: parse_ranged_var(
                    "UPLOAD_SESSION_TTL_SECS",
                    defaults.upload.session_ttl_secs,
                    1..=MAX_SESSION_TTL_SECS,
                )?,
                cleanup_interval_secs: parse_var(
                    "UPLOAD_CLEANUP_INTERVAL_SECS",
                    defaults.upload.cleanup_interval_secs,
                )?,
                max_file_size: parse_var("MAX_FILE_SIZE_BYTES", defaults.upload.max_file_size)?,
                max_chunks: parse_ranged_var(
                    "UPLOAD_MAX_CHUNKS",
                    defaults.upload.max_chunks,
                    1..=usize::MAX,
                )?,
                checksum_cache_preload: parse_var(
                    "CHECKSUM_CACHE_PRELOAD",
                    defaults.upload.checksum_cache_preload,
                )?,
            },
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError { name, value }),
        _ => Ok(default),
    }
}

/// Like `parse_var`, but the value must also fall inside `range`
fn parse_ranged_var<T>(
    name: &'static str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + ToString,
{
    let value = parse_var(name, default)?;
    if !range.contains(&value) {
        return Err(ConfigError {
            name,
            value: value.to_string(),
        });
    }
    Ok(value)
}
