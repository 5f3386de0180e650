use std::io::{Read, Seek, SeekFrom};

use disk_fixtures::pattern::{expected_byte, pattern_byte, HoledStream, PatternMismatch, PatternStream};
use disk_fixtures::{
    default_matrix, generate, inject_hole, verify_pattern, CompressionPolicy, FixtureFamily,
    FixtureMatrix, FixtureSpec, MatrixError, BLOCK_SIZE, HOLE_SIZE,
};
use proptest::prelude::*;

const MIB: u64 = 1024 * 1024;

// ============================================================================
// Pattern Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_generate_has_requested_length(size in 1u64..=3 * MIB) {
        prop_assert_eq!(generate(size).unwrap().len() as u64, size);
    }

    #[test]
    fn prop_every_byte_follows_block_index(size in 1u64..=2 * MIB, probes in prop::collection::vec(any::<u64>(), 16)) {
        let pattern = generate(size).unwrap();
        for probe in probes {
            let offset = probe % size;
            prop_assert_eq!(pattern[offset as usize], ((offset / BLOCK_SIZE) % 256) as u8);
        }
    }

    #[test]
    fn prop_hole_is_zero_and_rest_untouched(size in 1u64..=3 * MIB) {
        let mut pattern = generate(size).unwrap();
        inject_hole(&mut pattern, HOLE_SIZE);

        let hole_end = HOLE_SIZE.min(size) as usize;
        prop_assert!(pattern[..hole_end].iter().all(|&b| b == 0));
        for (i, &b) in pattern.iter().enumerate().skip(hole_end).step_by(4093) {
            prop_assert_eq!(b, pattern_byte(i as u64));
        }
    }

    #[test]
    fn prop_holed_stream_matches_inject_hole(size in 1u64..=3 * MIB, chunk in 1usize..70_000) {
        let mut expected = generate(size).unwrap();
        inject_hole(&mut expected, HOLE_SIZE);

        let mut stream = HoledStream::new(PatternStream::new(size).unwrap(), HOLE_SIZE);
        let mut collected = Vec::with_capacity(size as usize);
        let mut buf = vec![0u8; chunk];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        prop_assert!(collected == expected);
    }

    #[test]
    fn prop_seek_then_read_matches_pattern(size in 1u64..=2 * MIB, at in any::<u64>()) {
        let at = at % size;
        let mut stream = PatternStream::new(size).unwrap();
        stream.seek(SeekFrom::Start(at)).unwrap();

        let mut byte = [0u8; 1];
        prop_assert_eq!(stream.read(&mut byte).unwrap(), 1);
        prop_assert_eq!(byte[0], pattern_byte(at));
    }
}

#[test]
fn test_generation_is_deterministic() {
    assert_eq!(generate(3 * MIB).unwrap(), generate(3 * MIB).unwrap());
}

#[test]
fn test_stream_restarts_after_rewind() {
    let mut stream = PatternStream::new(2 * MIB).unwrap();
    let mut first = Vec::new();
    stream.read_to_end(&mut first).unwrap();

    stream.rewind().unwrap();
    let mut second = Vec::new();
    stream.read_to_end(&mut second).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, generate(2 * MIB).unwrap());
}

#[test]
fn test_hole_larger_than_image_zeroes_everything() {
    let mut pattern = generate(BLOCK_SIZE * 3).unwrap();
    inject_hole(&mut pattern, HOLE_SIZE);
    assert!(pattern.iter().all(|&b| b == 0));
}

#[test]
fn test_first_block_after_hole() {
    let mut pattern = generate(10 * MIB).unwrap();
    inject_hole(&mut pattern, HOLE_SIZE);

    // 1 MiB is block 256, which wraps to 0
    assert_eq!(pattern[HOLE_SIZE as usize], 0);
    assert_eq!(pattern[(HOLE_SIZE + BLOCK_SIZE) as usize], 1);
    assert_eq!(pattern[(HOLE_SIZE + 255 * BLOCK_SIZE) as usize], 255);
    assert_eq!(expected_byte(HOLE_SIZE - 1, HOLE_SIZE), 0);
}

// ============================================================================
// Verification
// ============================================================================

#[test]
fn test_verify_accepts_holed_pattern() {
    let mut pattern = generate(2 * MIB).unwrap();
    inject_hole(&mut pattern, HOLE_SIZE);
    assert!(verify_pattern(&pattern[..], 2 * MIB, HOLE_SIZE).is_ok());
}

#[test]
fn test_verify_rejects_unholed_pattern() {
    let pattern = generate(2 * MIB).unwrap();
    let err = verify_pattern(&pattern[..], 2 * MIB, HOLE_SIZE).unwrap_err();
    match err {
        PatternMismatch::Byte { offset, expected, found } => {
            assert_eq!(offset, BLOCK_SIZE);
            assert_eq!(expected, 0);
            assert_eq!(found, 1);
        }
        other => panic!("unexpected mismatch: {}", other),
    }
}

#[test]
fn test_verify_reports_truncation_and_trailing_data() {
    let mut pattern = generate(2 * MIB).unwrap();
    inject_hole(&mut pattern, HOLE_SIZE);

    let short = &pattern[..(MIB + 10) as usize];
    assert!(matches!(
        verify_pattern(short, 2 * MIB, HOLE_SIZE),
        Err(PatternMismatch::Truncated { found, .. }) if found == MIB + 10
    ));

    assert!(matches!(
        verify_pattern(&pattern[..], MIB, HOLE_SIZE),
        Err(PatternMismatch::TrailingData { .. })
    ));
}

// ============================================================================
// Matrix Validation
// ============================================================================

#[test]
fn test_default_matrix_layout() {
    let matrix = default_matrix();
    let families: Vec<&str> = matrix.families().iter().map(|f| f.name.as_str()).collect();
    assert_eq!(families, vec!["vmdk", "vdi", "vhdx", "vhd", "qcow2"]);
    assert_eq!(matrix.len(), 12);

    let vhd = &matrix.families()[3];
    assert_eq!(vhd.format, "vpc");
    assert_eq!(vhd.extension(), "vhd");

    let qcow2 = &matrix.families()[4];
    assert_eq!(qcow2.compression, CompressionPolicy::Skip);
}

#[test]
fn test_matrix_rejects_zero_size() {
    let err = FixtureMatrix::new(vec![FixtureFamily::new(
        "vdi",
        "vdi",
        CompressionPolicy::Skip,
        vec![FixtureSpec::new("empty", 0)],
    )])
    .unwrap_err();
    assert_eq!(err, MatrixError::ZeroSize("empty".to_string()));
}

#[test]
fn test_matrix_rejects_duplicate_names_across_families() {
    let err = FixtureMatrix::new(vec![
        FixtureFamily::new("vdi", "vdi", CompressionPolicy::Skip, vec![FixtureSpec::new("basic", MIB)]),
        FixtureFamily::new("vhdx", "vhdx", CompressionPolicy::Skip, vec![FixtureSpec::new("basic", MIB)]),
    ])
    .unwrap_err();
    assert_eq!(err, MatrixError::DuplicateName("basic".to_string()));
}
