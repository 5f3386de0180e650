//! Fixture definitions and the built-in matrix.

use std::collections::HashSet;

use serde::Serialize;

use crate::convert::{container_extension, is_stem_sibling, subformat};
use crate::error::MatrixError;

/// 10 MiB, the size every built-in fixture uses.
pub const DEFAULT_FIXTURE_SIZE: u64 = 10 * 1024 * 1024;

/// Files under the fixture tree that come from real hypervisors.
///
/// Paths are relative to the output root. No fixture may own one of these,
/// or a run would delete it as a stale artifact and overwrite it.
pub const RESERVED_PATHS: &[&str] = &[
    "vhd/dynamic.vhd.gz",
    "vhd/fixed.vhd.gz",
    "vhdx/dynamic.vhdx.gz",
    "vhdx/fixed.vhdx.gz",
    "vhdx/differencing.avhdx.gz",
    "vmdk/sesparse.vmdk.gz",
    "hdd/plain.hdd",
    "hdd/expanding.hdd",
    "hdd/split.hdd",
];

/// Reserved path that `stem` in `family` would claim, if any.
fn reserved_by(family: &FixtureFamily, stem: &str) -> Option<&'static str> {
    let ext = family.extension();
    RESERVED_PATHS.iter().copied().find(|reserved| {
        reserved
            .split_once('/')
            .is_some_and(|(dir, file)| dir == family.name && is_stem_sibling(file, stem, ext))
    })
}

/// One fixture: an output stem, a disk size and converter options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixtureSpec {
    pub name: String,
    pub size_bytes: u64,
    /// Passed to the converter as-is, in order.
    pub format_options: Vec<(String, String)>,
}

impl FixtureSpec {
    pub fn new(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            format_options: Vec::new(),
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.format_options.push((key.into(), value.into()));
        self
    }

    pub fn subformat(&self) -> Option<&str> {
        subformat(&self.format_options)
    }
}

/// What happens to a family's artifacts after conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CompressionPolicy {
    Skip,
    Gzip { keep_source: bool },
}

impl CompressionPolicy {
    pub fn compresses(&self) -> bool {
        matches!(self, CompressionPolicy::Gzip { .. })
    }
}

/// Fixtures sharing a container format and an output subdirectory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixtureFamily {
    /// Output subdirectory name.
    pub name: String,
    /// Converter target format.
    pub format: String,
    pub compression: CompressionPolicy,
    pub fixtures: Vec<FixtureSpec>,
}

impl FixtureFamily {
    pub fn new(
        name: impl Into<String>,
        format: impl Into<String>,
        compression: CompressionPolicy,
        fixtures: Vec<FixtureSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            compression,
            fixtures,
        }
    }

    pub fn extension(&self) -> &str {
        container_extension(&self.format)
    }
}

/// One fixture together with the family it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct FixtureJob<'a> {
    /// Position in matrix order.
    pub index: usize,
    pub family: &'a FixtureFamily,
    pub spec: &'a FixtureSpec,
}

/// The ordered, validated set of fixtures for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixtureMatrix {
    families: Vec<FixtureFamily>,
}

impl FixtureMatrix {
    pub fn new(families: Vec<FixtureFamily>) -> Result<Self, MatrixError> {
        let mut names = HashSet::new();

        for family in &families {
            if !is_valid_stem(&family.name) {
                return Err(MatrixError::InvalidName(family.name.clone()));
            }
            if family.fixtures.is_empty() {
                return Err(MatrixError::EmptyFamily(family.name.clone()));
            }

            for spec in &family.fixtures {
                if !is_valid_stem(&spec.name) {
                    return Err(MatrixError::InvalidName(spec.name.clone()));
                }
                if spec.size_bytes == 0 {
                    return Err(MatrixError::ZeroSize(spec.name.clone()));
                }
                if !names.insert(spec.name.as_str()) {
                    return Err(MatrixError::DuplicateName(spec.name.clone()));
                }
                if let Some(path) = reserved_by(family, &spec.name) {
                    return Err(MatrixError::Reserved {
                        fixture: spec.name.clone(),
                        path: path.to_string(),
                    });
                }
            }

            // A stem must not look like a split sibling of another stem, or
            // replacing one fixture would delete the other.
            let ext = family.extension();
            for a in &family.fixtures {
                for b in &family.fixtures {
                    let other = format!("{}.{}", b.name, ext);
                    if a.name != b.name && is_stem_sibling(&other, &a.name, ext) {
                        return Err(MatrixError::StemCollision {
                            stem: a.name.clone(),
                            other: b.name.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self { families })
    }

    pub fn families(&self) -> &[FixtureFamily] {
        &self.families
    }

    /// Every fixture in matrix order.
    pub fn jobs(&self) -> Vec<FixtureJob<'_>> {
        self.families
            .iter()
            .flat_map(|family| family.fixtures.iter().map(move |spec| (family, spec)))
            .enumerate()
            .map(|(index, (family, spec))| FixtureJob {
                index,
                family,
                spec,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.families.iter().map(|f| f.fixtures.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_valid_stem(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
}

/// The fixture set shipped with the parser's test suite.
pub fn default_matrix() -> FixtureMatrix {
    let size = DEFAULT_FIXTURE_SIZE;
    let gzip = CompressionPolicy::Gzip { keep_source: false };

    let families = vec![
        FixtureFamily::new(
            "vmdk",
            "vmdk",
            gzip,
            vec![
                FixtureSpec::new("sparse", size).option("subformat", "monolithicSparse"),
                FixtureSpec::new("flat", size).option("subformat", "monolithicFlat"),
                FixtureSpec::new("split-sparse", size).option("subformat", "twoGbMaxExtentSparse"),
                FixtureSpec::new("split-flat", size).option("subformat", "twoGbMaxExtentFlat"),
                FixtureSpec::new("stream-optimized", size).option("subformat", "streamOptimized"),
            ],
        ),
        FixtureFamily::new(
            "vdi",
            "vdi",
            gzip,
            vec![
                FixtureSpec::new("basic", size),
                FixtureSpec::new("static", size).option("static", "on"),
            ],
        ),
        FixtureFamily::new(
            "vhdx",
            "vhdx",
            gzip,
            vec![
                FixtureSpec::new("vhdx-dynamic", size).option("subformat", "dynamic"),
                FixtureSpec::new("vhdx-fixed", size).option("subformat", "fixed"),
            ],
        ),
        FixtureFamily::new(
            "vhd",
            "vpc",
            gzip,
            vec![
                FixtureSpec::new("vhd-dynamic", size).option("subformat", "dynamic"),
                FixtureSpec::new("vhd-fixed", size).option("subformat", "fixed"),
            ],
        ),
        FixtureFamily::new(
            "qcow2",
            "qcow2",
            CompressionPolicy::Skip,
            vec![FixtureSpec::new("qcow2-basic", size)],
        ),
    ];

    // validated by test_default_matrix_is_valid
    FixtureMatrix { families }
}
