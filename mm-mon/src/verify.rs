//! Runnable check that replaying the operation log forward from any
//! snapshot agrees with replaying it from index 0. Gives users a command
//! to run this check against a real capture file instead of only a unit
//! test.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use mm_core::{Op, Trace};

/// Replays operations `0..=k` independently of `Trace`'s own seeker, using
/// only the public `Op` accessor, and returns the live set sorted by `ptr`.
fn replay_from_scratch(trace: &Trace, k: usize) -> Vec<(u64, u64)> {
    let mut live: BTreeMap<u64, u64> = BTreeMap::new();
    for i in 0..=k {
        match trace.operation(i) {
            Op::Malloc { result, size, .. } | Op::Memalign { result, size, .. } => {
                if result != 0 {
                    live.insert(result, size);
                }
            }
            Op::Realloc { old_ptr, size, result, .. } => {
                if result == 0 {
                    if old_ptr != 0 {
                        live.remove(&old_ptr);
                    }
                } else if old_ptr == result && size > 0 {
                    live.insert(result, size);
                } else {
                    if old_ptr != 0 {
                        live.remove(&old_ptr);
                    }
                    if size > 0 {
                        live.insert(result, size);
                    }
                }
            }
            Op::Free { ptr, .. } => {
                live.remove(&ptr);
            }
        }
    }
    live.into_iter().collect()
}

pub fn run(mut trace: Trace) -> Result<()> {
    let count = trace.operation_count();
    if count == 0 {
        println!("trace has no operations; nothing to verify");
        return Ok(());
    }

    let checkpoints: Vec<usize> = [0usize, count / 4, count / 2, (3 * count) / 4, count - 1]
        .into_iter()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut failures = 0;

    for &k in &checkpoints {
        let expected = replay_from_scratch(&trace, k);
        let seeked: Vec<(u64, u64)> = trace.snapshot_at(k).iter().map(|e| (e.ptr, e.size)).collect();

        if seeked == expected {
            println!("OK    k={k}: {} live allocations", seeked.len());
        } else {
            println!(
                "FAIL  k={k}: seek produced {} entries, forward replay produced {}",
                seeked.len(),
                expected.len()
            );
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} checkpoint(s) failed verification");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_core::synth::TraceBuilder;
    use mm_core::NoopProgress;

    #[test]
    fn replay_matches_seek_on_a_small_synthetic_trace() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mm-mon-verify-unit-{}.dump", std::process::id()));
        TraceBuilder::new("v", "/bin/v", 1)
            .malloc(0, 8, 0x1000, &[])
            .malloc(1, 8, 0x2000, &[])
            .free(2, 0x1000, &[])
            .write_to(&path)
            .unwrap();

        let mut trace = Trace::open(&path, NoopProgress).unwrap();
        std::fs::remove_file(&path).ok();

        let expected = replay_from_scratch(&trace, 2);
        let seeked: Vec<(u64, u64)> = trace.snapshot_at(2).iter().map(|e| (e.ptr, e.size)).collect();
        assert_eq!(seeked, expected);
    }
}
