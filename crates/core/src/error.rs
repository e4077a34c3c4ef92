use crate::config::ConfigError;

/// Failure to start a [`DocumentSession`](crate::DocumentSession)
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start decode workers: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}
