use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntelError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("entity not found: {0}")]
    EntityNotFound(u64),

    #[error("a run is already active: {0}")]
    RunConflict(String),

    #[error("module '{module}' timed out after {timeout:?}")]
    ModuleTimeout { module: String, timeout: Duration },

    #[error("module '{module}' failed: {message}")]
    ModuleExecution { module: String, message: String },

    #[error("state store error: {0}")]
    Store(String),

    #[error("no executor configured for module: {0}")]
    MissingExecutor(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IntelError>;
