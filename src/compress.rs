//! Gzip compression of finished artifacts.
//!
//! Output is staged in a hidden temporary file next to the destination and
//! renamed into place only once the stream is complete, so an interrupted run
//! never leaves a truncated `.gz` behind.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flate2::{Compression, GzBuilder};
use log::{debug, info};
use tempfile::NamedTempFile;

use crate::convert::Artifact;
use crate::error::{CompressionError, FixtureError};
use crate::process::run_tool;

const STREAM_BUFFER: usize = 1024 * 1024;

/// `path` with `.gz` appended.
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".gz");
    PathBuf::from(name)
}

/// A streaming compressor producing `<path>.gz`.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    /// External executable this compressor needs, if any.
    fn required_tool(&self) -> Option<&str> {
        None
    }

    /// Compress `source` into `<source>.gz`, returning the new path.
    fn compress_file(&self, source: &Path, cancel: &AtomicBool) -> Result<PathBuf, FixtureError>;
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FixtureError + '_ {
    move |source| {
        CompressionError::Io {
            path: path.to_path_buf(),
            source,
        }
        .into()
    }
}

/// Hidden staging file in the destination's directory.
fn staging_file(destination: &Path) -> io::Result<NamedTempFile> {
    let dir = match destination.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".")
        .suffix(".partial")
        .tempfile_in(dir)
}

fn publish(staged: NamedTempFile, destination: &Path) -> Result<(), FixtureError> {
    staged
        .persist(destination)
        .map_err(|e| io_error(destination)(e.error))?;
    Ok(())
}

/// In-process gzip encoder.
#[derive(Debug, Clone, Copy)]
pub struct GzipStream {
    level: Compression,
}

impl GzipStream {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipStream {
    fn default() -> Self {
        Self::new(9)
    }
}

impl Compressor for GzipStream {
    fn name(&self) -> &str {
        "gzip (builtin)"
    }

    fn compress_file(&self, source: &Path, cancel: &AtomicBool) -> Result<PathBuf, FixtureError> {
        let destination = compressed_path(source);
        let mut input = File::open(source).map_err(io_error(source))?;
        let staged = staging_file(&destination).map_err(io_error(&destination))?;

        // No file name or mtime in the header, so output depends on content only.
        let mut encoder = GzBuilder::new()
            .mtime(0)
            .write(BufWriter::new(staged), self.level);

        let mut buf = vec![0u8; STREAM_BUFFER];
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(FixtureError::Cancelled);
            }
            let n = input.read(&mut buf).map_err(io_error(source))?;
            if n == 0 {
                break;
            }
            encoder.write_all(&buf[..n]).map_err(io_error(&destination))?;
        }

        let staged = encoder
            .finish()
            .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
            .map_err(io_error(&destination))?;
        publish(staged, &destination)?;

        Ok(destination)
    }
}

/// External `gzip` binary.
#[derive(Debug, Clone)]
pub struct ExternalGzip {
    program: String,
    level: u32,
    limit: Option<Duration>,
}

impl ExternalGzip {
    /// `gzip` has no level 0; it is raised to 1.
    pub fn new(program: impl Into<String>, level: u32, limit: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            level: level.clamp(1, 9),
            limit,
        }
    }
}

impl Compressor for ExternalGzip {
    fn name(&self) -> &str {
        &self.program
    }

    fn required_tool(&self) -> Option<&str> {
        Some(&self.program)
    }

    fn compress_file(&self, source: &Path, cancel: &AtomicBool) -> Result<PathBuf, FixtureError> {
        let destination = compressed_path(source);
        let staged = staging_file(&destination).map_err(io_error(&destination))?;
        let sink = staged.reopen().map_err(io_error(&destination))?;

        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg("-n")
            .arg(format!("-{}", self.level))
            .arg("--")
            .arg(source)
            .stdout(Stdio::from(sink));

        run_tool(command, self.limit, cancel).map_err(FixtureError::from_compression_tool)?;
        publish(staged, &destination)?;

        Ok(destination)
    }
}

/// Compress one artifact, dropping the source unless `keep_source` is set.
pub fn compress_artifact(
    compressor: &dyn Compressor,
    artifact: &Artifact,
    keep_source: bool,
    cancel: &AtomicBool,
) -> Result<Artifact, FixtureError> {
    let original_size = fs::metadata(&artifact.path)
        .map_err(io_error(&artifact.path))?
        .len();
    let path = compressor.compress_file(&artifact.path, cancel)?;
    let compressed_size = fs::metadata(&path).map_err(io_error(&path))?.len();

    info!(
        "Compressed {:?}: {} -> {} bytes",
        artifact.path.file_name().unwrap_or_default(),
        original_size,
        compressed_size
    );

    if !keep_source {
        debug!("Removing uncompressed {:?}", artifact.path);
        fs::remove_file(&artifact.path).map_err(io_error(&artifact.path))?;
    }

    Ok(Artifact {
        path,
        compressed: true,
        ..artifact.clone()
    })
}
