//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::compress::{Compressor, ExternalGzip, GzipStream};
use crate::convert::FormatConverter;

/// Where the fixture tree is written unless told otherwise.
pub const DEFAULT_OUTPUT_DIR: &str = "tests/_data/disk";

/// Which gzip implementation compresses artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CompressorKind {
    /// In-process encoder.
    Builtin,
    /// The `gzip` executable.
    External,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratorConfig {
    pub output_root: PathBuf,
    pub converter: String,
    pub compressor: CompressorKind,
    pub gzip_program: String,
    pub compression_level: u32,
    /// Bound on each external invocation; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Fixtures processed at once; 0 means one per CPU.
    pub jobs: usize,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from(DEFAULT_OUTPUT_DIR),
            converter: "qemu-img".to_string(),
            compressor: CompressorKind::Builtin,
            gzip_program: "gzip".to_string(),
            compression_level: 9,
            timeout: None,
            jobs: 1,
            scratch_dir: None,
        }
    }
}

impl GeneratorConfig {
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_converter(mut self, program: impl Into<String>) -> Self {
        self.converter = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Effective worker count.
    pub fn workers(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs
        }
    }

    pub fn build_converter(&self) -> FormatConverter {
        FormatConverter::new(self.converter.clone(), self.timeout)
    }

    pub fn build_compressor(&self) -> Box<dyn Compressor> {
        match self.compressor {
            CompressorKind::Builtin => Box::new(GzipStream::new(self.compression_level)),
            CompressorKind::External => Box::new(ExternalGzip::new(
                self.gzip_program.clone(),
                self.compression_level,
                self.timeout,
            )),
        }
    }
}
