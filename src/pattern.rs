//! Deterministic fill pattern for synthetic disk images.
//!
//! Every 4 KiB block holds a single repeated byte: block `n` is filled with
//! `n mod 256`. The first [`HOLE_SIZE`] bytes of each fixture are zeroed so
//! parsers can be tested against a known unallocated region.

use std::cmp;
use std::io::{self, Read, Seek, SeekFrom};

use crate::error::FixtureError;

/// Length of one run of identical bytes.
pub const BLOCK_SIZE: u64 = 4096;

/// Size of the zeroed region at the start of every fixture.
pub const HOLE_SIZE: u64 = 1024 * 1024;

/// Byte at `offset` before hole injection.
#[inline]
pub fn pattern_byte(offset: u64) -> u8 {
    ((offset / BLOCK_SIZE) % 256) as u8
}

/// Byte at `offset` after a hole of `hole_size` bytes was injected.
#[inline]
pub fn expected_byte(offset: u64, hole_size: u64) -> u8 {
    if offset < hole_size {
        0
    } else {
        pattern_byte(offset)
    }
}

/// Restartable reader over the first `size` bytes of the pattern.
#[derive(Debug, Clone)]
pub struct PatternStream {
    size: u64,
    position: u64,
}

impl PatternStream {
    pub fn new(size: u64) -> Result<Self, FixtureError> {
        if size == 0 {
            return Err(FixtureError::Generation(
                "pattern size must be positive".to_string(),
            ));
        }
        Ok(Self { size, position: 0 })
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for PatternStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0usize;

        while filled < buf.len() && self.position < self.size {
            let remaining_in_block = BLOCK_SIZE - self.position % BLOCK_SIZE;
            let remaining_in_stream = self.size - self.position;
            let run = cmp::min(remaining_in_block, remaining_in_stream)
                .min((buf.len() - filled) as u64) as usize;

            buf[filled..filled + run].fill(pattern_byte(self.position));
            filled += run;
            self.position += run as u64;
        }

        Ok(filled)
    }
}

impl Seek for PatternStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match target {
            Some(offset) => {
                self.position = offset;
                Ok(offset)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

/// Generate the full pattern of `size` bytes in memory.
pub fn generate(size: u64) -> Result<Vec<u8>, FixtureError> {
    let mut stream = PatternStream::new(size)?;
    let capacity = usize::try_from(size)
        .map_err(|_| FixtureError::Generation(format!("{} bytes do not fit in memory", size)))?;

    let mut pattern = Vec::with_capacity(capacity);
    stream.read_to_end(&mut pattern)?;
    Ok(pattern)
}

/// Zero `[0, hole_size)` of `pattern`, clamped to its length.
pub fn inject_hole(pattern: &mut [u8], hole_size: u64) {
    let end = cmp::min(hole_size, pattern.len() as u64) as usize;
    pattern[..end].fill(0);
}

/// Reader adapter that zeroes everything before `hole_size`.
#[derive(Debug)]
pub struct HoledStream<R> {
    inner: R,
    position: u64,
    hole_size: u64,
}

impl<R: Read> HoledStream<R> {
    pub fn new(inner: R, hole_size: u64) -> Self {
        Self {
            inner,
            position: 0,
            hole_size,
        }
    }
}

impl<R: Read> Read for HoledStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;

        if self.position < self.hole_size {
            let zeroed = cmp::min(self.hole_size - self.position, n as u64) as usize;
            buf[..zeroed].fill(0);
        }

        self.position += n as u64;
        Ok(n)
    }
}

/// Ways an image can deviate from the expected pattern.
#[derive(Debug, thiserror::Error)]
pub enum PatternMismatch {
    #[error("byte at offset {offset:#x} is {found:#04x}, expected {expected:#04x}")]
    Byte { offset: u64, expected: u8, found: u8 },

    #[error("image ends after {found} bytes, expected {expected}")]
    Truncated { expected: u64, found: u64 },

    #[error("image has data beyond the expected {expected} bytes")]
    TrailingData { expected: u64 },

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Check that `reader` yields exactly the holed pattern of `size` bytes.
pub fn verify_pattern<R: Read>(
    mut reader: R,
    size: u64,
    hole_size: u64,
) -> Result<(), PatternMismatch> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;

    while offset < size {
        let want = cmp::min(buf.len() as u64, size - offset) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(PatternMismatch::Truncated {
                expected: size,
                found: offset,
            });
        }

        for (i, &found) in buf[..n].iter().enumerate() {
            let at = offset + i as u64;
            let expected = expected_byte(at, hole_size);
            if found != expected {
                return Err(PatternMismatch::Byte {
                    offset: at,
                    expected,
                    found,
                });
            }
        }
        offset += n as u64;
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe)? != 0 {
        return Err(PatternMismatch::TrailingData { expected: size });
    }

    Ok(())
}
