//! Error types for fixture generation.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// One or more required executables could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing required tools: {}", .missing.join(", "))]
pub struct MissingToolsError {
    pub missing: Vec<String>,
}

/// Failure of a single external tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {}: {stderr}", exit_label(.code))]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} did not finish within {:.1}s", .limit.as_secs_f64())]
    TimedOut { program: String, limit: Duration },

    #[error("{program} was terminated after the run was aborted")]
    Cancelled { program: String },

    #[error("I/O error while supervising tool: {0}")]
    Io(#[from] io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// The converter failed or did not produce every expected file.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error(transparent)]
    Tool(ToolError),

    #[error("expected output missing: {}", display_paths(.paths))]
    MissingOutput { paths: Vec<PathBuf> },
}

/// The compressor failed.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tool(ToolError),
}

/// Everything that can stop a single fixture.
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("pattern generation failed: {0}")]
    Generation(String),

    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("{program} timed out after {:.1}s", .limit.as_secs_f64())]
    Timeout { program: String, limit: Duration },

    #[error("cancelled after another fixture failed")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FixtureError {
    /// Classify a converter invocation failure.
    pub(crate) fn from_conversion_tool(err: ToolError) -> Self {
        match err {
            ToolError::TimedOut { program, limit } => FixtureError::Timeout { program, limit },
            ToolError::Cancelled { .. } => FixtureError::Cancelled,
            other => FixtureError::Conversion(ConversionError::Tool(other)),
        }
    }

    /// Classify a compressor invocation failure.
    pub(crate) fn from_compression_tool(err: ToolError) -> Self {
        match err {
            ToolError::TimedOut { program, limit } => FixtureError::Timeout { program, limit },
            ToolError::Cancelled { .. } => FixtureError::Cancelled,
            other => FixtureError::Compression(CompressionError::Tool(other)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FixtureError::Cancelled)
    }
}

/// Invalid fixture matrix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatrixError {
    #[error("fixture '{0}' has size 0")]
    ZeroSize(String),

    #[error("fixture name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("fixture name '{0}' is not a valid file stem")]
    InvalidName(String),

    #[error("family '{0}' has no fixtures")]
    EmptyFamily(String),

    #[error("fixture '{other}' would be treated as an extent of '{stem}'")]
    StemCollision { stem: String, other: String },

    #[error("fixture '{fixture}' would overwrite reserved file {path}")]
    Reserved { fixture: String, path: String },
}

/// Pipeline stage a fixture was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    InjectHole,
    Materialize,
    Convert,
    Compress,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Generate => "generate",
            Stage::InjectHole => "inject-hole",
            Stage::Materialize => "materialize",
            Stage::Convert => "convert",
            Stage::Compress => "compress",
        };
        f.write_str(name)
    }
}

/// A fixture that aborted the run.
#[derive(Debug, thiserror::Error)]
#[error("fixture '{family}/{fixture}' failed during {stage}: {error}")]
pub struct FixtureFailure {
    pub family: String,
    pub fixture: String,
    pub stage: Stage,
    #[source]
    pub error: FixtureError,
}

/// Run-level outcome when the matrix did not complete.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Environment(#[from] MissingToolsError),

    #[error("invalid fixture matrix: {0}")]
    InvalidMatrix(#[from] MatrixError),

    #[error("failed to prepare output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Aborted(Box<FixtureFailure>),
}

impl From<FixtureFailure> for RunError {
    fn from(failure: FixtureFailure) -> Self {
        RunError::Aborted(Box::new(failure))
    }
}

impl RunError {
    /// The failed fixture, when the run aborted mid-matrix.
    pub fn failure(&self) -> Option<&FixtureFailure> {
        match self {
            RunError::Aborted(failure) => Some(failure.as_ref()),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
