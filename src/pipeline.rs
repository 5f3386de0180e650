//! Per-fixture pipeline: generate, inject hole, materialize, convert, compress.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::compress::{compress_artifact, Compressor};
use crate::convert::{remove_paths, Artifact, FormatConverter};
use crate::error::{FixtureError, FixtureFailure, Stage};
use crate::materialize::materialize;
use crate::matrix::{CompressionPolicy, FixtureJob};
use crate::pattern::{HoledStream, PatternStream, HOLE_SIZE};

/// Progress of one fixture through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureState {
    Pending,
    PatternGenerated,
    HoleInjected,
    Materialized,
    Converted,
    CompressionSkipped,
    Compressed,
    Done,
    Aborted,
}

impl FixtureState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FixtureState::Done | FixtureState::Aborted)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: FixtureState) -> bool {
        use FixtureState::*;

        if next == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, PatternGenerated)
                | (PatternGenerated, HoleInjected)
                | (HoleInjected, Materialized)
                | (Materialized, Converted)
                | (Converted, CompressionSkipped)
                | (Converted, Compressed)
                | (CompressionSkipped, Done)
                | (Compressed, Done)
        )
    }

    /// Stage that runs next from this state.
    pub fn next_stage(self) -> Option<Stage> {
        match self {
            FixtureState::Pending => Some(Stage::Generate),
            FixtureState::PatternGenerated => Some(Stage::InjectHole),
            FixtureState::HoleInjected => Some(Stage::Materialize),
            FixtureState::Materialized => Some(Stage::Convert),
            FixtureState::Converted => Some(Stage::Compress),
            _ => None,
        }
    }
}

/// Drives one fixture's state and turns errors into failure reports.
struct Tracker<'a> {
    job: &'a FixtureJob<'a>,
    state: FixtureState,
}

impl<'a> Tracker<'a> {
    fn new(job: &'a FixtureJob<'a>) -> Self {
        Self {
            job,
            state: FixtureState::Pending,
        }
    }

    fn advance(&mut self, next: FixtureState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("{}: {:?} -> {:?}", self.job.spec.name, self.state, next);
        self.state = next;
    }

    fn abort(&mut self, error: FixtureError) -> FixtureFailure {
        let stage = self.state.next_stage().unwrap_or(Stage::Compress);
        self.advance(FixtureState::Aborted);
        FixtureFailure {
            family: self.job.family.name.clone(),
            fixture: self.job.spec.name.clone(),
            stage,
            error,
        }
    }

    fn check_cancelled(&mut self, cancel: &AtomicBool) -> Result<(), FixtureFailure> {
        if cancel.load(Ordering::SeqCst) {
            return Err(self.abort(FixtureError::Cancelled));
        }
        Ok(())
    }
}

/// Result of a fixture that reached `Done`.
#[derive(Debug, Clone, Serialize)]
pub struct FixtureOutcome {
    pub family: String,
    pub fixture: String,
    pub artifacts: Vec<Artifact>,
    pub state: FixtureState,
    #[serde(skip)]
    pub duration_ms: u128,
}

impl FixtureOutcome {
    /// Delete every artifact this fixture produced.
    pub fn remove_artifacts(&self) {
        remove_paths(self.artifacts.iter().map(|a| a.path.as_path()));
    }
}

/// Shared, read-only inputs of every fixture pipeline in a run.
pub struct FixturePipeline<'a> {
    pub output_root: &'a Path,
    pub converter: &'a FormatConverter,
    pub compressor: &'a dyn Compressor,
    pub scratch_dir: Option<&'a Path>,
    pub cancel: &'a AtomicBool,
}

impl<'a> FixturePipeline<'a> {
    /// Final path of the primary artifact for `job`.
    pub fn output_path(&self, job: &FixtureJob<'_>) -> PathBuf {
        self.output_root
            .join(&job.family.name)
            .join(format!("{}.{}", job.spec.name, job.family.extension()))
    }

    pub fn run(&self, job: &FixtureJob<'_>) -> Result<FixtureOutcome, FixtureFailure> {
        let started = Instant::now();
        let spec = job.spec;
        let family = job.family;
        let mut tracker = Tracker::new(job);

        info!(
            "[{}/{}] {} ({} bytes, {})",
            family.name,
            spec.name,
            family.format,
            spec.size_bytes,
            spec.subformat().unwrap_or("default layout")
        );

        tracker.check_cancelled(self.cancel)?;
        let pattern = PatternStream::new(spec.size_bytes).map_err(|e| tracker.abort(e))?;
        tracker.advance(FixtureState::PatternGenerated);

        let holed = HoledStream::new(pattern, HOLE_SIZE);
        tracker.advance(FixtureState::HoleInjected);

        let raw = materialize(holed, self.scratch_dir).map_err(|e| tracker.abort(e.into()))?;
        tracker.advance(FixtureState::Materialized);

        tracker.check_cancelled(self.cancel)?;
        let output = self.output_path(job);
        let artifacts = self
            .converter
            .convert(
                raw.path(),
                &family.format,
                &spec.format_options,
                &output,
                self.cancel,
            )
            .map_err(|e| tracker.abort(e))?;
        if let Err(e) = raw.close() {
            warn!("Failed to remove scratch image for {}: {}", spec.name, e);
        }
        tracker.advance(FixtureState::Converted);

        let artifacts = match family.compression {
            CompressionPolicy::Skip => {
                tracker.advance(FixtureState::CompressionSkipped);
                artifacts
            }
            CompressionPolicy::Gzip { keep_source } => {
                let compressed = self
                    .compress_all(&artifacts, keep_source)
                    .map_err(|e| tracker.abort(e))?;
                tracker.advance(FixtureState::Compressed);
                compressed
            }
        };

        tracker.advance(FixtureState::Done);
        let duration_ms = started.elapsed().as_millis();
        info!(
            "✓ {}/{}: {} artifact(s) in {}ms",
            family.name,
            spec.name,
            artifacts.len(),
            duration_ms
        );

        Ok(FixtureOutcome {
            family: family.name.clone(),
            fixture: spec.name.clone(),
            artifacts,
            state: tracker.state,
            duration_ms,
        })
    }

    /// Compress every artifact; on failure nothing of this fixture survives.
    fn compress_all(
        &self,
        artifacts: &[Artifact],
        keep_source: bool,
    ) -> Result<Vec<Artifact>, FixtureError> {
        let mut done: Vec<Artifact> = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            match compress_artifact(self.compressor, artifact, keep_source, self.cancel) {
                Ok(compressed) => done.push(compressed),
                Err(e) => {
                    remove_paths(
                        artifacts
                            .iter()
                            .chain(done.iter())
                            .map(|a| a.path.as_path()),
                    );
                    return Err(e);
                }
            }
        }

        if keep_source {
            let mut all = artifacts.to_vec();
            all.extend(done);
            return Ok(all);
        }
        Ok(done)
    }
}
