//! Integration-level scenarios exercising `Trace` end to end via the
//! public `synth` fixture writer, rather than `mm-core`'s internal types.

use mm_core::synth::TraceBuilder;
use mm_core::{NoopProgress, Trace};

fn open(bytes: Vec<u8>) -> Trace {
    let dir = std::env::temp_dir();
    let path = dir.join(format!(
        "mm-core-it-{}-{:?}.dump",
        std::process::id(),
        std::thread::current().id()
    ));
    std::fs::write(&path, &bytes).unwrap();
    let trace = Trace::open(&path, NoopProgress).unwrap();
    std::fs::remove_file(&path).ok();
    trace
}

/// S2: live set after malloc, malloc, free.
#[test]
fn s2_basic_sequence_live_set() {
    let bytes = TraceBuilder::new("s2", "/bin/s2", 1)
        .malloc(0, 16, 0x1000, &[0x10])
        .malloc(1, 32, 0x2000, &[0x10])
        .free(2, 0x1000, &[])
        .finish();
    let mut trace = open(bytes);
    let snap = trace.snapshot_at(2);
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].ptr, 0x2000);
    assert_eq!(snap[0].size, 32);
}

/// S3: realloc shrink then free.
#[test]
fn s3_realloc_then_free() {
    let bytes = TraceBuilder::new("s3", "/bin/s3", 1)
        .malloc(0, 64, 0x4000, &[])
        .realloc(1, 0x4000, 8, 0x4000, &[])
        .free(2, 0x4000, &[])
        .finish();
    let mut trace = open(bytes);
    assert!(trace.snapshot_at(1).iter().any(|e| e.ptr == 0x4000 && e.size == 8));
    assert!(trace.snapshot_at(2).is_empty());
}

/// S4: shared outermost frame is deduplicated in the callstack trie.
#[test]
fn s4_shared_outermost_frame_deduplicates() {
    let bytes = TraceBuilder::new("s4", "/bin/s4", 1)
        .malloc(0, 8, 0x1000, &[0xCC, 0xBB, 0xAA])
        .malloc(1, 8, 0x2000, &[0xCC, 0xDD, 0xAA])
        .finish();
    let trace = open(bytes);
    assert_eq!(trace.trie().total_frames(), 6);
    assert_eq!(trace.trie().unique_frames(), 5);
}

/// S5: a torn trailing record does not take down the whole parse.
#[test]
fn s5_torn_trailing_record_is_dropped() {
    let mut builder = TraceBuilder::new("s5", "/bin/s5", 1);
    builder.malloc(0, 8, 0x1000, &[]);
    let mut bytes = builder.finish();
    // Strip the GOODBYE byte and append a truncated tag+timestamp with no payload.
    bytes.pop();
    bytes.push(2); // MALLOC tag
    bytes.extend_from_slice(&[0, 0]); // incomplete timestamp

    let trace = open(bytes);
    assert_eq!(trace.operation_count(), 1);
}

/// Universal invariant: unique_frames never exceeds total_frames.
#[test]
fn unique_frames_bounded_by_total_across_many_stacks() {
    let mut builder = TraceBuilder::new("inv", "/bin/inv", 1);
    for i in 0..40u64 {
        builder.malloc(i as u32, 8, 0x8000 + i, &[0xAA, i, 0xCC]);
    }
    let bytes = builder.finish();
    let trace = open(bytes);
    assert!(trace.trie().total_frames() >= trace.trie().unique_frames());
}

/// Header fields round-trip through a big-endian, narrow-pointer producer.
#[test]
fn header_round_trips_big_endian_narrow_pointers() {
    let bytes = TraceBuilder::with_format("be", "/bin/be", 55, true, 4)
        .malloc(0, 4, 0x1234, &[])
        .finish();
    let trace = open(bytes);
    assert!(trace.header().producer_is_bigendian());
    assert!(trace.header().pointer_width_is_narrow());
    assert_eq!(trace.header().process_id(), 55);
    assert_eq!(trace.operation_count(), 1);
}
