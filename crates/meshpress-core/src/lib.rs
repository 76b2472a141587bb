//! Meshpress Core - glTF Binary Asset Optimization
//!
//! This library provides the optimization pipeline core of a 3D asset
//! processing service:
//! - Parsing and serializing glTF 2.0 binary (`.glb`) containers
//! - A two-phase geometry sanitizer bracketing every run
//! - Resource pruning, primitive merging, mesh simplification
//! - Vertex quantization, Draco geometry compression, KTX2 texture compression
//! - A sequential pipeline scheduler with per-step statistics and progress events

pub mod clean;
pub mod document;
pub mod draco;
pub mod glb;
pub mod merge;
pub mod pipeline;
pub mod quantize;
pub mod sanitize;
pub mod simplify;
pub mod texture;

pub use clean::{CleanOptions, CleanStats};
pub use document::{Document, Semantic};
pub use draco::{DracoOptions, DracoStats};
pub use merge::{MergeOptions, MergeStats};
pub use pipeline::{
    execute, execute_with_control, CancelToken, OptimizeOptions, PipelineControl, PipelineReport,
    Preset, ProgressEvent, ProgressStatus, StepResult,
};
pub use quantize::{QuantizeOptions, QuantizeStats};
pub use sanitize::GeometryFixResult;
pub use simplify::{SimplifyOptions, SimplifyStats};
pub use texture::{TextureMode, TextureOptions, TextureStats};

use thiserror::Error;

/// Maximum accepted input file size: 100 MiB
pub const MAX_INPUT_SIZE: u64 = 100 * 1024 * 1024;

/// Errors that can occur during asset optimization
#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Invalid option {field}: expected {expected}, got {received}")]
    InvalidOptions {
        field: &'static str,
        expected: &'static str,
        received: String,
    },

    #[error("Optimization step {step} failed: {message}")]
    OptimizationFailed { step: &'static str, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OptimizeError {
    /// Stable error kind identifier, matching the service's wire taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            OptimizeError::InvalidFile(_) | OptimizeError::FileTooLarge { .. } => "InvalidFile",
            OptimizeError::InvalidOptions { .. } => "InvalidOptions",
            OptimizeError::OptimizationFailed { .. } => "OptimizationFailed",
            OptimizeError::WriteFailed(_) => "WriteFailed",
            OptimizeError::Cancelled => "Cancelled",
            OptimizeError::Json(_) => "InvalidFile",
            OptimizeError::Io(_) | OptimizeError::Internal(_) => "Internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, OptimizeError>;
