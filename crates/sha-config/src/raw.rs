use serde::Deserialize;

/// Mirrors the on-disk TOML layout exactly; `loader` converts this into
/// `Config` and applies the environment overlay. Every field is optional
/// here so a partially-specified file plus a complete set of env vars is
/// still a valid configuration.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub tunnel_endpoint: Option<String>,
    pub control_api_token: Option<String>,
    pub postgres_url: Option<String>,
    pub device_observer_poll_interval_ms: Option<u64>,
    pub debug: Option<bool>,
    #[serde(default)]
    pub cloudstack: RawCloudStack,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawCloudStack {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub domain: Option<String>,
    pub zone: Option<String>,
}
