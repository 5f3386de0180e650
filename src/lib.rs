//! Deterministic disk-image fixtures for parser test suites.
//!
//! A fixed matrix of container variants (sparse, flat, split, stream-optimized)
//! is produced from one reproducible raw pattern with a zeroed 1 MiB hole at
//! the start. Conversion is delegated to `qemu-img`, compression to gzip.

pub mod compress;
pub mod config;
pub mod convert;
pub mod driver;
pub mod error;
pub mod materialize;
pub mod matrix;
pub mod pattern;
pub mod pipeline;
pub mod process;
pub mod tools;

pub use config::{CompressorKind, GeneratorConfig};
pub use convert::{Artifact, ArtifactRole};
pub use driver::{FixtureMatrixDriver, PlannedFixture, RunSummary};
pub use error::{FixtureError, FixtureFailure, MatrixError, MissingToolsError, RunError, Stage};
pub use matrix::{default_matrix, CompressionPolicy, FixtureFamily, FixtureMatrix, FixtureSpec};
pub use pattern::{generate, inject_hole, verify_pattern, BLOCK_SIZE, HOLE_SIZE};
pub use pipeline::{FixtureOutcome, FixtureState};
