//! Scratch raw images fed to the converter.

use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;

const WRITE_BUFFER: usize = 1024 * 1024;

/// A raw image on disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct RawImage {
    file: NamedTempFile,
    size: u64,
}

impl RawImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Delete the scratch file now, reporting any error.
    pub fn close(self) -> io::Result<()> {
        self.file.close()
    }
}

/// Stream `source` into a uniquely named `fixture-*.raw` file.
///
/// The file lives in `scratch_dir` when given, otherwise in the system
/// temporary directory.
pub fn materialize<R: Read>(mut source: R, scratch_dir: Option<&Path>) -> io::Result<RawImage> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("fixture-").suffix(".raw");

    let file = match scratch_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };

    let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
    let size = io::copy(&mut source, &mut writer)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;

    debug!("Materialized {} bytes at {:?}", size, file.path());
    Ok(RawImage { file, size })
}
