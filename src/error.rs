//! Error handling for scopeflow
//!
//! This module defines the error taxonomy shared by buffers, the filter
//! graph, the scheduler and instrument collaborators, plus a `Result` alias.
//!
//! Filters return these errors from `refresh`; the scheduler records them as
//! node-local strings and nulls the node's outputs. Only
//! [`ScopeError::OutOfMemory`] gets special treatment (memory-pressure retry).

use crate::graph::NodeId;
use thiserror::Error;

/// Which kind of memory an allocation was targeting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Host memory (pinned or pageable)
    Host,
    /// Device memory of a compute device
    Device,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryKind::Host => write!(f, "host"),
            MemoryKind::Device => write!(f, "device"),
        }
    }
}

/// Main error type for scopeflow operations
#[derive(Error, Debug)]
pub enum ScopeError {
    /// An input slot has nothing connected, or its stream carries no data
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// An input has the wrong sample type or X-axis unit
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A parameter value or combination the filter cannot handle
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Allocation failed
    #[error("Out of {kind} memory ({requested_bytes} bytes requested)")]
    OutOfMemory {
        kind: MemoryKind,
        requested_bytes: usize,
    },

    /// The compute device lacks a capability, or no device exists
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Errors surfaced by an instrument driver or its transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wiring an input would create a cycle
    #[error("Connecting {from} -> {to} would create a cycle")]
    CycleDetected { from: NodeId, to: NodeId },

    /// No node with the given id
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    /// No stream at the given index on a node
    #[error("Node {node} has no stream {stream}")]
    UnknownStream { node: NodeId, stream: usize },

    /// No filter registered under the given name
    #[error("Unknown filter class '{0}'")]
    UnknownFilter(String),

    /// Errors parsing text input (units, Touchstone files, ...)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ScopeError>,
    },
}

impl ScopeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ScopeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error (or the error it wraps) is an allocation failure
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            ScopeError::OutOfMemory { .. } => true,
            ScopeError::WithContext { source, .. } => source.is_out_of_memory(),
            _ => false,
        }
    }

    /// Details of the allocation failure, if this is one
    pub fn out_of_memory_details(&self) -> Option<(MemoryKind, usize)> {
        match self {
            ScopeError::OutOfMemory {
                kind,
                requested_bytes,
            } => Some((*kind, *requested_bytes)),
            ScopeError::WithContext { source, .. } => source.out_of_memory_details(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ScopeError {
    fn from(e: serde_json::Error) -> Self {
        ScopeError::Serialization(e.to_string())
    }
}

/// Result type alias for scopeflow operations
pub type Result<T> = std::result::Result<T, ScopeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
