// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for VisionFlow.
//!
//! Every fallible operation of the object model returns [`VisionError`]. The
//! variants follow the condition that caused the failure rather than the
//! object that reported it, so callers can match on them programmatically.
//! [`VisionError::status`] flattens an error into a plain [`Status`] value,
//! which is what graphs record as their error status and what the context's
//! error objects are keyed by.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for VisionFlow operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VisionError {
    /// Wrong object type, stale handle, or an object that was already released.
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Bad enum, size or count supplied by the caller.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// A value is out of its accepted range (e.g. parameter index).
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Kernel signature type and reference type disagree.
    #[error("Invalid type: {0}")]
    InvalidType(String),

    /// Image format mismatch found during verification.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Shape mismatch found during verification.
    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),

    /// A virtual object used outside of the graph that owns it.
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Cyclic graph, graph not verified, or execution mode mismatch.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Node is not in a state that allows the operation.
    #[error("Invalid node: {0}")]
    InvalidNode(String),

    /// More than one node writes the same storage.
    #[error("Multiple writers: {0}")]
    MultipleWriters(String),

    /// A required parameter was never supplied.
    #[error("Not sufficient: {0}")]
    NotSufficient(String),

    /// Memory or slot allocation failed.
    #[error("No resources: {0}")]
    NoResources(String),

    /// Unimplemented attribute, directive or target.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Attempt to touch a virtual object outside kernel execution.
    #[error("Optimized away: {0}")]
    OptimizedAway(String),

    /// A node callback asked the graph to stop.
    #[error("Graph abandoned: {0}")]
    GraphAbandoned(String),

    /// A bounded wait elapsed before completion.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A kernel's run function reported failure.
    #[error("Kernel '{node}' failed: {message}")]
    Kernel { node: String, message: String },

    /// Generic runtime failure.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Convenience type alias for Results using `VisionError`.
pub type Result<T> = std::result::Result<T, VisionError>;

/// Flat status code, one per error condition plus `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failure,
    InvalidReference,
    InvalidParameters,
    InvalidValue,
    InvalidType,
    InvalidFormat,
    InvalidDimension,
    InvalidScope,
    InvalidGraph,
    InvalidNode,
    MultipleWriters,
    NotSufficient,
    NoResources,
    NotSupported,
    OptimizedAway,
    GraphAbandoned,
    Timeout,
}

impl Status {
    /// Every error status, in declaration order. `Success` is not included.
    pub const ERRORS: [Self; 17] = [
        Self::Failure,
        Self::InvalidReference,
        Self::InvalidParameters,
        Self::InvalidValue,
        Self::InvalidType,
        Self::InvalidFormat,
        Self::InvalidDimension,
        Self::InvalidScope,
        Self::InvalidGraph,
        Self::InvalidNode,
        Self::MultipleWriters,
        Self::NotSufficient,
        Self::NoResources,
        Self::NotSupported,
        Self::OptimizedAway,
        Self::GraphAbandoned,
        Self::Timeout,
    ];

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl VisionError {
    /// The status code this error reports as.
    pub const fn status(&self) -> Status {
        match self {
            Self::InvalidReference(_) => Status::InvalidReference,
            Self::InvalidParameters(_) => Status::InvalidParameters,
            Self::InvalidValue(_) => Status::InvalidValue,
            Self::InvalidType(_) => Status::InvalidType,
            Self::InvalidFormat(_) => Status::InvalidFormat,
            Self::InvalidDimension(_) => Status::InvalidDimension,
            Self::InvalidScope(_) => Status::InvalidScope,
            Self::InvalidGraph(_) => Status::InvalidGraph,
            Self::InvalidNode(_) => Status::InvalidNode,
            Self::MultipleWriters(_) => Status::MultipleWriters,
            Self::NotSufficient(_) => Status::NotSufficient,
            Self::NoResources(_) => Status::NoResources,
            Self::NotSupported(_) => Status::NotSupported,
            Self::OptimizedAway(_) => Status::OptimizedAway,
            Self::GraphAbandoned(_) => Status::GraphAbandoned,
            Self::Timeout(_) => Status::Timeout,
            Self::Kernel { .. } | Self::Runtime(_) => Status::Failure,
        }
    }

    pub fn kernel(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kernel { node: node.into(), message: message.into() }
    }
}

impl From<VisionError> for String {
    fn from(err: VisionError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to Runtime.
impl From<String> for VisionError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for VisionError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
