//! Error types for the tiling engine

use std::{io::Error as IoError, path::PathBuf};
use thiserror::Error;

use crate::node::NodeId;

/// Errors raised while running a concurrent build
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Another build is already running (admission not granted within {0} ms)")]
    AdmissionTimeout(u64),

    #[error("Admission semaphore closed")]
    AdmissionClosed,

    #[error("Cannot settle while a build is running")]
    BuildInProgress,

    #[error("Invalid pool size: {pool} must be at least 1")]
    InvalidPoolSize { pool: &'static str },

    #[error("{pool} task failed: {reason}")]
    TaskFailed { pool: &'static str, reason: String },

    #[error("Build finished with {0} bags left in the rework collection")]
    ReworkNotDrained(usize),

    #[error("Build finished with {0} batches left in the work queue")]
    QueueNotDrained(usize),
}

/// Errors raised while inserting a single object
#[derive(Debug, Error)]
pub enum InsertError {
    #[error("Node {0} is not registered in this tree")]
    UnknownNode(NodeId),

    #[error("No child of node {node} matches object {object}")]
    NoMatchingChild { node: NodeId, object: String },
}

/// Errors raised while writing tree and content files
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to create directory {0}: {1}")]
    DirectoryCreate(PathBuf, IoError),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, IoError),

    #[error("Failed to serialize {0}: {1}")]
    Serialization(PathBuf, serde_json::Error),

    #[error("Node {0} has no sparse bag; sparsify before exporting sparse content")]
    MissingSparseBag(NodeId),
}

/// Errors raised by the tree cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to read tree file {0}: {1}")]
    FileRead(PathBuf, IoError),

    #[error("Failed to parse tree file {0}: {1}")]
    Deserialization(PathBuf, serde_json::Error),

    #[error("Asset {0} has no tree")]
    NotFound(String),

    #[error("Node {node} in tree file has {children} children, expected 4")]
    MalformedTree { node: NodeId, children: usize },
}

/// Errors raised while reading graph input
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read input {0}: {1}")]
    FileRead(PathBuf, IoError),

    #[error("Failed to parse input {0}: {1}")]
    Deserialization(PathBuf, serde_json::Error),

    #[error("Input contains no nodes")]
    EmptyGraph,

    #[error("Node {0} has a non-finite position")]
    InvalidPosition(String),
}

/// Settings validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors raised by the end-to-end tiling pipeline
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Invalid settings: {0}")]
    Config(#[from] ConfigError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Blocking task failed: {0}")]
    TaskFailed(String),
}

pub type BuildResult<T> = Result<T, BuildError>;
pub type InsertResult<T> = Result<T, InsertError>;
pub type ExportResult<T> = Result<T, ExportError>;
pub type CacheResult<T> = Result<T, CacheError>;
pub type SourceResult<T> = Result<T, SourceError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ProcessResult<T> = Result<T, ProcessError>;
