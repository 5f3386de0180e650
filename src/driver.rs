//! Runs the fixture matrix: tool check, output directories, then every fixture.
//!
//! The run is fail-fast. The first fixture that fails stops the matrix and is
//! reported; nothing after it in matrix order is left on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::compress::{compressed_path, Compressor};
use crate::config::GeneratorConfig;
use crate::convert::{describe, expected_artifacts, Artifact, FormatConverter};
use crate::error::{FixtureFailure, RunError};
use crate::matrix::{CompressionPolicy, FixtureJob, FixtureMatrix};
use crate::pipeline::{FixtureOutcome, FixturePipeline};
use crate::tools::check_tools;

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output_root: PathBuf,
    pub fixtures: Vec<FixtureOutcome>,
    #[serde(skip)]
    pub duration_ms: u128,
}

impl RunSummary {
    pub fn artifact_count(&self) -> usize {
        self.fixtures.iter().map(|f| f.artifacts.len()).sum()
    }

    /// Copy of the summary with artifact paths relative to the output root.
    pub fn relative(&self) -> RunSummary {
        let mut summary = self.clone();
        for fixture in &mut summary.fixtures {
            for artifact in &mut fixture.artifacts {
                if let Ok(rel) = artifact.path.strip_prefix(&self.output_root) {
                    artifact.path = rel.to_path_buf();
                }
            }
        }
        summary.output_root = PathBuf::from(".");
        summary
    }

    /// Write the summary as pretty JSON, replacing `path` atomically.
    pub fn write_manifest(&self, path: &Path) -> std::io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut staged = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut staged, &self.relative())?;
        staged.persist(path).map_err(|e| e.error)?;
        info!("Wrote manifest {:?}", path);
        Ok(())
    }
}

/// Expected layout of one fixture, computed without running anything.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedFixture {
    pub family: String,
    pub fixture: String,
    pub command: Vec<String>,
    pub artifacts: Vec<Artifact>,
}

pub struct FixtureMatrixDriver {
    config: GeneratorConfig,
    converter: FormatConverter,
    compressor: Box<dyn Compressor>,
}

impl FixtureMatrixDriver {
    pub fn new(config: GeneratorConfig) -> Self {
        let converter = config.build_converter();
        let compressor = config.build_compressor();
        Self {
            config,
            converter,
            compressor,
        }
    }

    /// Executables `matrix` needs with the configured tools.
    pub fn required_tools(&self, matrix: &FixtureMatrix) -> Vec<String> {
        let mut tools = vec![self.converter.program().to_string()];
        let compresses = matrix.families().iter().any(|f| f.compression.compresses());
        if let (true, Some(tool)) = (compresses, self.compressor.required_tool()) {
            tools.push(tool.to_string());
        }
        tools
    }

    /// Artifact layout of every fixture, in matrix order.
    pub fn plan(&self, matrix: &FixtureMatrix) -> Vec<PlannedFixture> {
        let cancel = AtomicBool::new(false);
        let pipeline = self.pipeline(&cancel);

        matrix
            .jobs()
            .iter()
            .map(|job| {
                let output = pipeline.output_path(job);
                let raw = self
                    .config
                    .scratch_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("fixture-XXXXXX.raw");
                let command = self.converter.command(
                    &raw,
                    &job.family.format,
                    &job.spec.format_options,
                    &output,
                );

                let mut artifacts = expected_artifacts(
                    &output,
                    &job.family.format,
                    &job.spec.format_options,
                    job.spec.size_bytes,
                );
                if let CompressionPolicy::Gzip { keep_source } = job.family.compression {
                    let gz: Vec<Artifact> = artifacts
                        .iter()
                        .map(|a| Artifact {
                            path: compressed_path(&a.path),
                            compressed: true,
                            ..a.clone()
                        })
                        .collect();
                    if keep_source {
                        artifacts.extend(gz);
                    } else {
                        artifacts = gz;
                    }
                }

                PlannedFixture {
                    family: job.family.name.clone(),
                    fixture: job.spec.name.clone(),
                    command: describe(&command)
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                    artifacts,
                }
            })
            .collect()
    }

    /// Run the whole matrix.
    pub fn run(&self, matrix: &FixtureMatrix) -> Result<RunSummary, RunError> {
        let started = Instant::now();

        check_tools(self.required_tools(matrix).as_slice())?;
        self.prepare_output_dirs(matrix)?;

        let jobs = matrix.jobs();
        let workers = self.config.workers().min(jobs.len().max(1));
        info!(
            "Generating {} fixture(s) in {} family(ies) under {:?} ({} worker(s), compressor: {})",
            jobs.len(),
            matrix.families().len(),
            self.config.output_root,
            workers,
            self.compressor.name()
        );

        let fixtures = if workers <= 1 {
            self.run_sequential(&jobs)?
        } else {
            self.run_parallel(&jobs, workers)?
        };

        let summary = RunSummary {
            output_root: self.config.output_root.clone(),
            fixtures,
            duration_ms: started.elapsed().as_millis(),
        };
        info!(
            "✅ {} fixture(s), {} artifact(s) in {}ms",
            summary.fixtures.len(),
            summary.artifact_count(),
            summary.duration_ms
        );
        Ok(summary)
    }

    fn pipeline<'a>(&'a self, cancel: &'a AtomicBool) -> FixturePipeline<'a> {
        FixturePipeline {
            output_root: &self.config.output_root,
            converter: &self.converter,
            compressor: self.compressor.as_ref(),
            scratch_dir: self.config.scratch_dir.as_deref(),
            cancel,
        }
    }

    fn prepare_output_dirs(&self, matrix: &FixtureMatrix) -> Result<(), RunError> {
        let mut dirs = vec![];
        if let Some(scratch) = &self.config.scratch_dir {
            dirs.push(scratch.clone());
        }
        dirs.extend(
            matrix
                .families()
                .iter()
                .map(|family| self.config.output_root.join(&family.name)),
        );

        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| RunError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn run_sequential(&self, jobs: &[FixtureJob<'_>]) -> Result<Vec<FixtureOutcome>, RunError> {
        let cancel = AtomicBool::new(false);
        let pipeline = self.pipeline(&cancel);
        let mut outcomes = Vec::with_capacity(jobs.len());

        for job in jobs {
            match pipeline.run(job) {
                Ok(outcome) => outcomes.push(outcome),
                Err(failure) => {
                    report_abort(&failure, not_generated(jobs.len(), outcomes.len()));
                    return Err(failure.into());
                }
            }
        }
        Ok(outcomes)
    }

    fn run_parallel(
        &self,
        jobs: &[FixtureJob<'_>],
        workers: usize,
    ) -> Result<Vec<FixtureOutcome>, RunError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("fixture-worker-{}", i))
            .build()?;

        let cancel = AtomicBool::new(false);
        let pipeline = self.pipeline(&cancel);

        let results: Vec<JobResult> = pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    if cancel.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = pipeline.run(job);
                    if let Err(failure) = &result {
                        if !failure.error.is_cancelled() {
                            cancel.store(true, Ordering::SeqCst);
                        }
                    }
                    Some(result)
                })
                .collect()
        });

        match settle(results) {
            Settled::Complete(outcomes) => Ok(outcomes),
            Settled::Aborted {
                failure,
                rolled_back,
                not_generated,
            } => {
                for outcome in &rolled_back {
                    outcome.remove_artifacts();
                }
                if !rolled_back.is_empty() {
                    warn!(
                        "Removed artifacts of {} fixture(s) that finished after the failing one",
                        rolled_back.len()
                    );
                }
                report_abort(&failure, not_generated);
                Err(failure.into())
            }
        }
    }
}

type JobResult = Option<Result<FixtureOutcome, FixtureFailure>>;

/// Parallel results sorted into what stays on disk and what must go.
#[derive(Debug)]
enum Settled {
    Complete(Vec<FixtureOutcome>),
    Aborted {
        failure: FixtureFailure,
        /// Finished after the failing fixture in matrix order.
        rolled_back: Vec<FixtureOutcome>,
        not_generated: usize,
    },
}

/// `None` marks a job skipped after cancellation.
fn settle(results: Vec<JobResult>) -> Settled {
    let total = results.len();
    let mut finished = Vec::with_capacity(total);
    let mut failure: Option<(usize, FixtureFailure)> = None;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Some(Ok(outcome)) => finished.push((index, outcome)),
            Some(Err(f)) if failure.is_none() && !f.error.is_cancelled() => {
                failure = Some((index, f));
            }
            _ => {}
        }
    }

    let Some((failed_at, failure)) = failure else {
        return Settled::Complete(finished.into_iter().map(|(_, outcome)| outcome).collect());
    };

    let (kept, rolled_back): (Vec<_>, Vec<_>) = finished
        .into_iter()
        .partition(|(index, _)| *index < failed_at);
    Settled::Aborted {
        failure,
        rolled_back: rolled_back.into_iter().map(|(_, outcome)| outcome).collect(),
        not_generated: not_generated(total, kept.len()),
    }
}

/// Fixtures missing from disk after an abort, the failing one excluded.
fn not_generated(total: usize, kept: usize) -> usize {
    total.saturating_sub(kept + 1)
}

fn report_abort(failure: &FixtureFailure, remaining: usize) {
    error!("{}", failure);
    if remaining > 0 {
        error!("Aborting run, {} other fixture(s) were not generated", remaining);
    }
}
