pub mod chanmap;
pub mod command;
pub mod config;
pub mod countermap;
pub mod metrics;
pub mod payload;
pub mod server;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Exec(String),
    #[error("{0}")]
    Signal(String),
    #[error("unknown alertmanager message status: {0}")]
    UnknownStatus(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
