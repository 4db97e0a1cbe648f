//! Core error types

use thiserror::Error;
use vpcflow_cloud::{ResourceKind, Scope};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{kind} '{name}' already exists in {scope}")]
    Conflict {
        kind: ResourceKind,
        scope: Scope,
        name: String,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for {record}: {from} -> {to}")]
    InvalidTransition {
        record: String,
        from: String,
        to: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
