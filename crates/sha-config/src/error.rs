use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("toml parse error in {path}: {source}")]
    TomlParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required config field '{field}' (set it in the config file or via {env_var})")]
    MissingField { field: String, env_var: String },

    #[error("invalid value for '{field}': {message}")]
    Invalid { field: String, message: String },
}
