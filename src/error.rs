//! Error types for the invoice insight evaluator.

use crate::eval::{JudgeFailure, JudgeKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, InsightEvalError>;

/// Errors that can occur outside the judge panel.
#[derive(Error, Debug)]
pub enum InsightEvalError {
    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The image could not be used as extraction input.
    #[error("Invalid invoice image '{path}': {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    /// The stored record does not exist.
    #[error("Record not found at '{0}'")]
    RecordNotFound(PathBuf),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// LLM API error.
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// LLM response parsing error.
    #[error("Failed to parse LLM response: {0}")]
    LlmParse(String),

    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Configuration file error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The extractor produced no usable invoice.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// The generator produced no usable insight text.
    #[error("Generation error: {0}")]
    Generation(String),
}

impl InsightEvalError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for InsightEvalError {
    fn from(err: reqwest::Error) -> Self {
        InsightEvalError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for InsightEvalError {
    fn from(err: serde_json::Error) -> Self {
        InsightEvalError::LlmParse(err.to_string())
    }
}

/// A single judge's failure. Absorbed by the panel, never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JudgeError {
    /// The model call errored or timed out.
    #[error("{judge} judge unavailable: {reason}")]
    Unavailable { judge: JudgeKind, reason: String },

    /// The model answered but the answer could not be turned into a score.
    #[error("{judge} judge returned a malformed response: {reason}")]
    MalformedResponse { judge: JudgeKind, reason: String },
}

impl JudgeError {
    pub fn unavailable(judge: JudgeKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            judge,
            reason: reason.into(),
        }
    }

    pub fn malformed(judge: JudgeKind, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            judge,
            reason: reason.into(),
        }
    }

    /// The judge this error belongs to.
    pub fn judge(&self) -> JudgeKind {
        match self {
            Self::Unavailable { judge, .. } | Self::MalformedResponse { judge, .. } => *judge,
        }
    }
}

/// Every configured judge failed, so there is nothing to aggregate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("panel exhausted: all {} judges failed", failures.len())]
pub struct PanelExhausted {
    pub failures: Vec<JudgeFailure>,
}
