use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sha/config.toml";

#[derive(Debug, Clone)]
pub struct CloudStackConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub domain: String,
    pub zone: String,
}

/// Either backing a `StateStore` can run against. Only two implementations
/// exist — in-memory for the local developer loop, and Postgres for
/// production — so an absent `postgres_url` means in-memory, not an error.
#[derive(Debug, Clone)]
pub enum StoreLocation {
    Memory,
    Postgres(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tunnel_endpoint: String,
    pub cloudstack: CloudStackConfig,
    pub control_api_token: String,
    pub store: StoreLocation,
    pub device_observer_poll_interval_ms: u64,
    pub debug: bool,
}

/// Loads the file at `path` (or `DEFAULT_CONFIG_PATH` / `$SHA_CONFIG` if
/// `path` is `None`), then overlays environment variables for the fields
/// operators rotate most often. File values are defaults; env values win.
/// A missing file is not an error if every required field is supplied by
/// the environment instead.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let resolved_path = path
        .map(PathBuf::from)
        .or_else(|| std::env::var("SHA_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let raw = match std::fs::read_to_string(&resolved_path) {
        Ok(content) => {
            debug!(path = %resolved_path.display(), "loading config file");
            toml::from_str::<RawConfig>(&content).map_err(|e| ConfigError::TomlParse {
                path: resolved_path.display().to_string(),
                source: e,
            })?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %resolved_path.display(), "no config file found, relying on environment");
            RawConfig::default()
        }
        Err(e) => {
            return Err(ConfigError::Io { path: resolved_path.display().to_string(), source: e });
        }
    };

    build_config(raw)
}

fn env_overlay(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &str, env_var: &str) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingField { field: field.to_string(), env_var: env_var.to_string() })
}

fn build_config(raw: RawConfig) -> Result<Config, ConfigError> {
    let tunnel_endpoint = required(
        env_overlay("SHA_TUNNEL_ENDPOINT").or(raw.tunnel_endpoint),
        "tunnel_endpoint",
        "SHA_TUNNEL_ENDPOINT",
    )?;

    let control_api_token = required(
        env_overlay("SHA_CONTROL_API_TOKEN").or(raw.control_api_token),
        "control_api_token",
        "SHA_CONTROL_API_TOKEN",
    )?;

    let cloudstack = CloudStackConfig {
        api_url: required(
            env_overlay("SHA_CLOUDSTACK_API_URL").or(raw.cloudstack.api_url),
            "cloudstack.api_url",
            "SHA_CLOUDSTACK_API_URL",
        )?,
        api_key: required(
            env_overlay("SHA_CLOUDSTACK_API_KEY").or(raw.cloudstack.api_key),
            "cloudstack.api_key",
            "SHA_CLOUDSTACK_API_KEY",
        )?,
        secret_key: required(
            env_overlay("SHA_CLOUDSTACK_SECRET_KEY").or(raw.cloudstack.secret_key),
            "cloudstack.secret_key",
            "SHA_CLOUDSTACK_SECRET_KEY",
        )?,
        domain: required(
            env_overlay("SHA_CLOUDSTACK_DOMAIN").or(raw.cloudstack.domain),
            "cloudstack.domain",
            "SHA_CLOUDSTACK_DOMAIN",
        )?,
        zone: required(
            env_overlay("SHA_CLOUDSTACK_ZONE").or(raw.cloudstack.zone),
            "cloudstack.zone",
            "SHA_CLOUDSTACK_ZONE",
        )?,
    };

    let store = match env_overlay("SHA_STORE_POSTGRES_URL").or(raw.postgres_url) {
        Some(url) => StoreLocation::Postgres(url),
        None => StoreLocation::Memory,
    };

    let device_observer_poll_interval_ms = env_overlay("SHA_DEVICE_OBSERVER_POLL_INTERVAL_MS")
        .and_then(|v| v.parse().ok())
        .or(raw.device_observer_poll_interval_ms)
        .unwrap_or(2_000);

    let debug = env_overlay("SHA_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .or(raw.debug)
        .unwrap_or(false);

    Ok(Config { tunnel_endpoint, cloudstack, control_api_token, store, device_observer_poll_interval_ms, debug })
}
