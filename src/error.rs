use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::proto::InterceptError;

/// Coarse classification used to decide how a failure is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    #[default]
    Unknown,
    User,
    Config,
    NoDaemonLogs,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::User => "user",
            Self::Config => "config",
            Self::NoDaemonLogs => "no_daemon_logs",
        }
    }
}

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("{0}")]
    User(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("{resource} is not ready: {detail}")]
    NotReady { resource: String, detail: String },
    #[error("{message}")]
    Remote {
        message: String,
        category: ErrorCategory,
    },
    #[error("{message}")]
    Intercept {
        code: InterceptError,
        message: String,
        category: ErrorCategory,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("command `{command}` exited with status {code}")]
    ExitStatus { command: String, code: i32 },
    #[error("process error: {0}")]
    Process(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TetherError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::User(_) => ErrorCategory::User,
            Self::Config(_) | Self::Yaml(_) => ErrorCategory::Config,
            Self::Remote { category, .. } | Self::Intercept { category, .. } => *category,
            Self::Cancelled | Self::ExitStatus { .. } => ErrorCategory::User,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn is_user_error(&self) -> bool {
        self.category() == ErrorCategory::User
    }

    /// Exit code the binary should terminate with when this error escapes.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ExitStatus { code, .. } => *code,
            Self::Cancelled => 130,
            _ => 1,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::User(_) => "user_error",
            Self::Config(_) | Self::Yaml(_) => "config_error",
            Self::NotReady { .. } => "not_ready",
            Self::Remote { .. } => "remote_error",
            Self::Intercept { code, .. } => code.as_str(),
            Self::Cancelled => "cancelled",
            Self::ExitStatus { .. } => "command_failed",
            Self::Process(_) => "process_error",
            Self::Rpc(_) => "rpc_error",
            Self::Io(_) => "io_error",
            Self::Prompt(_) => "prompt_error",
            Self::Json(_) => "json_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetails {
    pub error_code: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ErrorDetails {
    pub fn from_error(err: &TetherError) -> Self {
        let hint = if err.is_user_error() {
            None
        } else {
            Some("rerun with --verbose (or RUST_LOG=tether=debug) for details".to_string())
        };
        let exit_code = match err {
            TetherError::ExitStatus { code, .. } => Some(*code),
            _ => None,
        };
        Self {
            error_code: err.error_code().to_string(),
            category: err.category().as_str().to_string(),
            hint,
            exit_code,
        }
    }
}
