//! S6: random-access seeks are order-independent. For any operation log,
//! querying `snapshot_at` in any order of indices must agree with
//! replaying forward from index 0 up to each index.

use mm_core::synth::TraceBuilder;
use mm_core::{NoopProgress, Trace};
use proptest::prelude::*;

fn build_trace(ptrs: &[u64]) -> (Vec<u8>, Vec<u64>) {
    let mut builder = TraceBuilder::new("seek-prop", "/bin/seek-prop", 1);
    let mut live = Vec::new();
    for (i, &p) in ptrs.iter().enumerate() {
        let addr = 0x1000 + p;
        if i % 3 == 2 && !live.is_empty() {
            let victim = live.remove(i % live.len());
            builder.free(i as u32, victim, &[]);
        } else {
            builder.malloc(i as u32, 8, addr, &[]);
            live.push(addr);
        }
    }
    (builder.finish(), ptrs.to_vec())
}

fn open(bytes: &[u8]) -> Trace {
    let dir = std::env::temp_dir();
    let path = dir.join(format!(
        "mm-core-seekprop-{}-{:?}.dump",
        std::process::id(),
        std::thread::current().id()
    ));
    std::fs::write(&path, bytes).unwrap();
    let trace = Trace::open(&path, NoopProgress).unwrap();
    std::fs::remove_file(&path).ok();
    trace
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn seeks_in_any_order_agree_with_forward_replay(
        ptrs in prop::collection::vec(0u64..500, 1..300),
        seek_order in prop::collection::vec(0usize..300, 1..20),
    ) {
        let (bytes, _) = build_trace(&ptrs);
        let mut trace = open(&bytes);
        let n = trace.operation_count();
        if n == 0 {
            return Ok(());
        }

        for &raw_k in &seek_order {
            let k = raw_k % n;
            let out_of_order = trace.snapshot_at(k).to_vec();

            // Rebuild fresh and replay forward to the same index for comparison.
            let mut fresh = open(&bytes);
            let forward = fresh.snapshot_at(k).to_vec();

            prop_assert_eq!(out_of_order, forward);
        }
    }
}
