#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("handle not found: {0}")]
    HandleNotFound(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
