//! Classified failures for registration, composition and execution.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkillError {
    #[error("Skill '{0}' not found")]
    NotFound(String),

    #[error("Failed to register skill '{name}': {reason}")]
    Registration { name: String, reason: String },

    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("Maximum call depth of {max_depth} exceeded: {}", chain.join(" -> "))]
    MaxDepthExceeded { max_depth: usize, chain: Vec<String> },

    #[error("Skill execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Skill exceeded its resource limit: {0}")]
    ResourceExceeded(String),

    #[error("Skill '{skill}' raised: {message}")]
    Runtime { skill: String, message: String },

    #[error("Skill execution was cancelled")]
    Cancelled,

    #[error("Skill store error: {0}")]
    Storage(String),
}

impl SkillError {
    pub fn registration(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Registration {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn runtime(skill: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Runtime {
            skill: skill.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-readable label, used in logs and protocol error data.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Registration { .. } => "registration",
            Self::CircularDependency(_) => "circular_dependency",
            Self::MaxDepthExceeded { .. } => "max_depth_exceeded",
            Self::Timeout(_) => "timeout",
            Self::ResourceExceeded(_) => "resource_exceeded",
            Self::Runtime { .. } => "runtime",
            Self::Cancelled => "cancelled",
            Self::Storage(_) => "storage",
        }
    }

    /// Recover a classified error from an `anyhow` chain, e.g. one that
    /// crossed a wasmtime host-function boundary.
    pub fn from_anyhow(err: &anyhow::Error) -> Option<Self> {
        err.downcast_ref::<SkillError>()
            .or_else(|| {
                err.chain()
                    .find_map(|cause| cause.downcast_ref::<SkillError>())
            })
            .cloned()
    }
}

impl From<rusqlite::Error> for SkillError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SkillError>;
