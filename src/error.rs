use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::config::LineMode;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unsupported line: {line}{}", in_mode(.mode))]
    UnsupportedLine { line: u32, mode: Option<LineMode> },
    #[error("Already allocated: line {line} is in use")]
    AlreadyAllocated { line: u32 },
    #[error("Mode mismatch: cannot {op} line {line} in {mode} mode")]
    ModeMismatch {
        line: u32,
        op: &'static str,
        mode: LineMode,
    },
    #[error("Invalid value: {op} on line {line} rejected {value}, must be 0 or 1")]
    InvalidValue {
        line: u32,
        op: &'static str,
        value: String,
    },
    #[error("Handle closed: cannot {op} line {line}")]
    HandleClosed { line: u32, op: &'static str },
    #[error("PWM period out of range on line {line}: requested {requested} ns, allowed {min}-{max} ns")]
    PeriodOutOfRange {
        line: u32,
        requested: u64,
        min: u64,
        max: u64,
    },
    #[error("PWM init failed on line {line}: {reason}")]
    PwmInitFailed { line: u32, reason: String },
    #[error("PWM not ready: cannot {op} line {line} before it is exported and enabled")]
    NotReady { line: u32, op: &'static str },
    #[error("Invalid percent: duty {requested}% on line {line} is outside 0-100")]
    InvalidPercent { line: u32, requested: f64 },
    #[error("Unsupported edge: '{edge}' on line {line}")]
    UnsupportedEdge { line: u32, edge: String },
    #[error("External command failed: {program}{}: {reason}", for_line(.line))]
    ExternalCommandFailed {
        program: String,
        line: Option<u32>,
        reason: String,
    },
    #[error("File write failed: {path}: {reason}")]
    FileWrite { path: String, reason: String },
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unsupported system: {0}")]
    UnsupportedSystem(String),
}

impl AppError {
    /// Attributes a tool failure to the line it was run for.
    pub fn on_line(self, line: u32) -> Self {
        match self {
            AppError::ExternalCommandFailed {
                program, reason, ..
            } => AppError::ExternalCommandFailed {
                program,
                line: Some(line),
                reason,
            },
            other => other,
        }
    }
}

fn for_line(line: &Option<u32>) -> String {
    line.map(|l| format!(" for line {l}")).unwrap_or_default()
}

fn in_mode(mode: &Option<LineMode>) -> String {
    mode.map(|m| format!(" cannot be used in {m} mode"))
        .unwrap_or_default()
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::UnsupportedLine { .. } => StatusCode::NOT_FOUND,
            AppError::AlreadyAllocated { .. } | AppError::NotReady { .. } => StatusCode::CONFLICT,
            AppError::HandleClosed { .. } => StatusCode::GONE,
            AppError::ModeMismatch { .. }
            | AppError::InvalidValue { .. }
            | AppError::PeriodOutOfRange { .. }
            | AppError::InvalidPercent { .. }
            | AppError::UnsupportedEdge { .. }
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PwmInitFailed { .. }
            | AppError::ExternalCommandFailed { .. }
            | AppError::FileWrite { .. }
            | AppError::Config(_)
            | AppError::UnsupportedSystem(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_failures_name_the_line() {
        let err = AppError::ExternalCommandFailed {
            program: "gpioget".into(),
            line: None,
            reason: "exited with exit status: 1".into(),
        }
        .on_line(17);
        assert_eq!(
            err.to_string(),
            "External command failed: gpioget for line 17: exited with exit status: 1"
        );
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unresolvable_system_is_a_server_error() {
        let err = AppError::UnsupportedSystem("no gpiod tools".into());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Unsupported system: no gpiod tools");
    }
}
