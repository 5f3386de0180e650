// Shared test utilities: fake external tools and fixture helpers
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use disk_fixtures::{CompressionPolicy, FixtureFamily, FixtureMatrix, FixtureSpec, GeneratorConfig};
use tempfile::TempDir;

/// Stand-in for `qemu-img convert`.
///
/// Behaviour is picked from the output file name so one script serves every
/// test: `fail*` exits 1, `hang*` sleeps, `ghost*` exits 0 without writing.
/// Flat and split VMDK subformats get a descriptor plus raw extent files;
/// everything else is a byte copy of the raw input.
const FAKE_CONVERTER: &str = r#"#!/bin/sh
opts=""
prev=""
src=""
dst=""
for arg in "$@"; do
    if [ "$prev" = "-o" ]; then opts="$arg"; fi
    prev="$arg"
    src="$dst"
    dst="$arg"
done

case "$(basename "$dst")" in
    fail*) echo "fake converter: cannot convert $dst" >&2; exit 1 ;;
    hang*) exec sleep 30 ;;
    ghost*) exit 0 ;;
esac

stem="${dst%.*}"
case "$opts" in
    *subformat=monolithicFlat*)
        echo "RW 20480 FLAT \"$(basename "$stem")-flat.vmdk\" 0" > "$dst"
        cp "$src" "$stem-flat.vmdk" ;;
    *subformat=twoGbMaxExtentFlat*)
        echo "RW 20480 FLAT \"$(basename "$stem")-f001.vmdk\" 0" > "$dst"
        cp "$src" "$stem-f001.vmdk" ;;
    *subformat=twoGbMaxExtentSparse*)
        echo "RW 20480 SPARSE \"$(basename "$stem")-s001.vmdk\"" > "$dst"
        cp "$src" "$stem-s001.vmdk" ;;
    *)
        exec cp "$src" "$dst" ;;
esac
"#;

/// Converter that writes only the descriptor of split layouts.
const HALF_CONVERTER: &str = r#"#!/bin/sh
for arg in "$@"; do dst="$arg"; done
echo "descriptor only" > "$dst"
"#;

/// Gzip that emits part of a stream, then fails.
const BROKEN_GZIP: &str = r#"#!/bin/sh
echo partial
echo "fake gzip: no space left on device" >&2
exit 1
"#;

/// Gzip that emits part of a stream, then never finishes.
const HUNG_GZIP: &str = r#"#!/bin/sh
echo partial
exec sleep 30
"#;

struct FakeTools {
    _dir: TempDir,
    converter: PathBuf,
    half_converter: PathBuf,
    broken_gzip: PathBuf,
    hung_gzip: PathBuf,
}

static TOOLS: OnceLock<FakeTools> = OnceLock::new();

fn install(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("Failed to write fake tool");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to mark fake tool executable");
    }
    path
}

// Scripts are written once, before any test spawns them, so no script is
// ever open for writing while another thread forks.
fn tools() -> &'static FakeTools {
    TOOLS.get_or_init(|| {
        // under target/ rather than /tmp, which may be mounted noexec
        let dir = tempfile::tempdir_in(env!("CARGO_TARGET_TMPDIR"))
            .expect("Failed to create tool directory");
        let converter = install(dir.path(), "fake-qemu-img", FAKE_CONVERTER);
        let half_converter = install(dir.path(), "half-qemu-img", HALF_CONVERTER);
        let broken_gzip = install(dir.path(), "broken-gzip", BROKEN_GZIP);
        let hung_gzip = install(dir.path(), "hung-gzip", HUNG_GZIP);
        FakeTools {
            _dir: dir,
            converter,
            half_converter,
            broken_gzip,
            hung_gzip,
        }
    })
}

pub fn fake_converter() -> String {
    tools().converter.to_string_lossy().into_owned()
}

pub fn half_converter() -> String {
    tools().half_converter.to_string_lossy().into_owned()
}

pub fn broken_gzip() -> String {
    tools().broken_gzip.to_string_lossy().into_owned()
}

pub fn hung_gzip() -> String {
    tools().hung_gzip.to_string_lossy().into_owned()
}

/// Config writing into `out` with the fake converter.
pub fn fake_config(out: &Path) -> GeneratorConfig {
    GeneratorConfig::default()
        .with_output_root(out)
        .with_converter(fake_converter())
}

pub const MIB: u64 = 1024 * 1024;

/// Single vmdk family without compression.
pub fn vmdk_matrix(fixtures: Vec<FixtureSpec>) -> FixtureMatrix {
    FixtureMatrix::new(vec![FixtureFamily::new(
        "vmdk",
        "vmdk",
        CompressionPolicy::Skip,
        fixtures,
    )])
    .expect("Invalid test matrix")
}

/// Sorted file names directly under `dir`.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.expect("Failed to read entry").file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Every file under `root` with its contents, keyed by relative path.
pub fn snapshot_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).expect("Failed to read dir") {
            let path = entry.expect("Failed to read entry").path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                files.push((rel, fs::read(&path).expect("Failed to read artifact")));
            }
        }
    }
    files.sort();
    files
}

pub fn qemu_img_available() -> bool {
    disk_fixtures::tools::resolve_program("qemu-img").is_some()
}
