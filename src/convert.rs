//! Raw-to-container conversion through an external converter (`qemu-img`).

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{ConversionError, FixtureError};
use crate::process::run_tool;

/// VMDK split variants cap each extent at 2 GiB.
pub const VMDK_SPLIT_EXTENT_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Option key selecting the on-disk layout.
pub const SUBFORMAT_KEY: &str = "subformat";

/// What a file contributes to a logical disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    /// Self-contained image file.
    Image,
    /// Text descriptor referencing extent files.
    Descriptor,
    /// One data file of a split image.
    Extent,
}

/// A file produced for a fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub format: String,
    pub subformat: Option<String>,
    pub role: ArtifactRole,
    pub compressed: bool,
}

impl Artifact {
    fn new(path: PathBuf, format: &str, subformat: Option<&str>, role: ArtifactRole) -> Self {
        Self {
            path,
            format: format.to_string(),
            subformat: subformat.map(str::to_string),
            role,
            compressed: false,
        }
    }

    /// Whether the file holds raw disk bytes that can be checked directly.
    pub fn holds_raw_data(&self) -> bool {
        match self.role {
            ArtifactRole::Extent => matches!(
                self.subformat.as_deref(),
                Some("monolithicFlat") | Some("vmfs") | Some("twoGbMaxExtentFlat")
            ),
            _ => false,
        }
    }
}

/// File extension used for `format`.
pub fn container_extension(format: &str) -> &str {
    match format {
        "vpc" => "vhd",
        "parallels" => "hdd",
        other => other,
    }
}

/// The `subformat` entry of an option list, if any.
pub fn subformat(options: &[(String, String)]) -> Option<&str> {
    options
        .iter()
        .find(|(key, _)| key == SUBFORMAT_KEY)
        .map(|(_, value)| value.as_str())
}

/// Render options in the converter's `-o key=value,...` syntax.
///
/// Values are passed through untouched except that commas are doubled, which
/// is how the converter escapes them.
pub fn encode_options(options: &[(String, String)]) -> Option<String> {
    if options.is_empty() {
        return None;
    }

    let encoded = options
        .iter()
        .map(|(key, value)| format!("{}={}", key, value.replace(',', ",,")))
        .collect::<Vec<_>>()
        .join(",");
    Some(encoded)
}

/// Files the converter is expected to produce for `output`.
///
/// The first entry is always `output` itself.
pub fn expected_artifacts(
    output: &Path,
    format: &str,
    options: &[(String, String)],
    disk_size: u64,
) -> Vec<Artifact> {
    let sub = subformat(options);

    if format != "vmdk" {
        return vec![Artifact::new(output.to_path_buf(), format, sub, ArtifactRole::Image)];
    }

    let extents: Vec<PathBuf> = match sub {
        Some("monolithicFlat") | Some("vmfs") => vec![sibling(output, "flat")],
        Some("twoGbMaxExtentSparse") => (1..=split_extent_count(disk_size))
            .map(|i| sibling(output, &format!("s{:03}", i)))
            .collect(),
        Some("twoGbMaxExtentFlat") => (1..=split_extent_count(disk_size))
            .map(|i| sibling(output, &format!("f{:03}", i)))
            .collect(),
        _ => Vec::new(),
    };

    if extents.is_empty() {
        return vec![Artifact::new(output.to_path_buf(), format, sub, ArtifactRole::Image)];
    }

    let mut artifacts = vec![Artifact::new(
        output.to_path_buf(),
        format,
        sub,
        ArtifactRole::Descriptor,
    )];
    artifacts.extend(
        extents
            .into_iter()
            .map(|path| Artifact::new(path, format, sub, ArtifactRole::Extent)),
    );
    artifacts
}

fn split_extent_count(disk_size: u64) -> u64 {
    disk_size.div_ceil(VMDK_SPLIT_EXTENT_SIZE).max(1)
}

/// `dir/stem.ext` -> `dir/stem-suffix.ext`
fn sibling(output: &Path, suffix: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{}-{}", stem, suffix);
    if let Some(ext) = output.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    output.with_file_name(name)
}

/// Whether `file_name` belongs to the artifact set of `stem`.
///
/// Matches `stem.ext`, `stem-flat.ext`, `stem-sNNN.ext`, `stem-fNNN.ext` and
/// the `.gz` of each.
pub fn is_stem_sibling(file_name: &str, stem: &str, ext: &str) -> bool {
    let name = file_name.strip_suffix(".gz").unwrap_or(file_name);
    let Some(base) = name
        .strip_suffix(ext)
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };

    if base == stem {
        return true;
    }

    let Some(suffix) = base
        .strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('-'))
    else {
        return false;
    };

    if suffix == "flat" {
        return true;
    }
    let mut chars = suffix.chars();
    matches!(chars.next(), Some('s') | Some('f'))
        && suffix.len() == 4
        && chars.all(|c| c.is_ascii_digit())
}

/// Remove everything a previous run produced for `stem` in `dir`.
pub fn remove_stale_outputs(dir: &Path, stem: &str, ext: &str) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if entry.file_type()?.is_file() && is_stem_sibling(name, stem, ext) {
            debug!("Removing stale artifact {:?}", entry.path());
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove `paths`, ignoring files that are already gone.
pub(crate) fn remove_paths<'a, I>(paths: I)
where
    I: IntoIterator<Item = &'a Path>,
{
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed partial output {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial output {:?}: {}", path, e),
        }
    }
}

/// Driver for the external converter.
#[derive(Debug, Clone)]
pub struct FormatConverter {
    program: String,
    limit: Option<Duration>,
}

impl FormatConverter {
    pub fn new(program: impl Into<String>, limit: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            limit,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Command line converting `raw` into `output`.
    pub fn command(
        &self,
        raw: &Path,
        format: &str,
        options: &[(String, String)],
        output: &Path,
    ) -> Command {
        let mut command = Command::new(&self.program);
        command.args(["convert", "-q", "-f", "raw", "-O", format]);
        if let Some(encoded) = encode_options(options) {
            command.arg("-o").arg(encoded);
        }
        command.arg(raw).arg(output);
        command.stdout(Stdio::null());
        command
    }

    /// Convert `raw` into `output` (plus any sibling extents).
    ///
    /// Prior artifacts of the same stem are removed first. On failure nothing
    /// the converter may have written is left behind.
    pub fn convert(
        &self,
        raw: &Path,
        format: &str,
        options: &[(String, String)],
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<Vec<Artifact>, FixtureError> {
        let disk_size = fs::metadata(raw)?.len();
        let artifacts = expected_artifacts(output, format, options, disk_size);

        if let (Some(dir), Some(stem)) = (output.parent(), output.file_stem()) {
            let stem = stem.to_string_lossy();
            let removed = remove_stale_outputs(dir, &stem, container_extension(format))?;
            if removed > 0 {
                info!("Replaced {} stale file(s) for {}", removed, stem);
            }
        }

        let command = self.command(raw, format, options, output);
        if let Err(e) = run_tool(command, self.limit, cancel) {
            remove_paths(artifacts.iter().map(|a| a.path.as_path()));
            return Err(FixtureError::from_conversion_tool(e));
        }

        let missing: Vec<PathBuf> = artifacts
            .iter()
            .filter(|a| !a.path.is_file())
            .map(|a| a.path.clone())
            .collect();
        if !missing.is_empty() {
            remove_paths(artifacts.iter().map(|a| a.path.as_path()));
            return Err(ConversionError::MissingOutput { paths: missing }.into());
        }

        Ok(artifacts)
    }
}

impl Default for FormatConverter {
    fn default() -> Self {
        Self::new("qemu-img", None)
    }
}

/// Command line as a printable list, for diagnostics.
pub fn describe(command: &Command) -> Vec<OsString> {
    std::iter::once(command.get_program().to_os_string())
        .chain(command.get_args().map(|a| a.to_os_string()))
        .collect()
}
