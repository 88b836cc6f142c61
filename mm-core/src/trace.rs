//! The facade: owns everything a [`decoder`](crate::decoder) produces and
//! serves read-only queries against it.

use std::path::Path;

use crate::callstack::{CallstackTrie, StackId};
use crate::decoder;
use crate::error::Result;
use crate::fragindex::{BucketStats, Entry, FragmentIndex, SNAPSHOT_THRESHOLD};
use crate::header::Header;
use crate::op::Op;
use crate::progress::ProgressSink;

/// Tunables overriding the defaults [`Trace::open`] uses, exposed so a
/// caller (e.g. the CLI's `--snapshot-threshold`/`--frame-cap` flags) can
/// trade memory for seek latency or loosen the frame-count ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOptions {
    /// Reject any record whose callstack claims at least this many frames.
    pub frame_cap: u32,
    /// Materialize an automatic snapshot every this many operations.
    pub snapshot_threshold: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        TraceOptions {
            frame_cap: decoder::DEFAULT_FRAME_CAP,
            snapshot_threshold: SNAPSHOT_THRESHOLD,
        }
    }
}

/// A fully parsed capture file: header metadata, the operation stream in
/// recording order, the deduplicated callstack tree, and the fragmentation
/// seeker. Built once by [`Trace::open`]; nothing mutates afterward except
/// the fragmentation seeker's internal working table, which `snapshot_at`
/// rebuilds on each call.
#[derive(Debug)]
pub struct Trace {
    header: Header,
    operations: Vec<Op>,
    stacks: Vec<StackId>,
    trie: CallstackTrie,
    fragindex: FragmentIndex,
}

impl Trace {
    /// Parse `path` end to end, reporting progress through `progress`.
    ///
    /// `progress` is polled periodically during the read; it must return
    /// quickly and must not call back into the `Trace` under construction
    /// (there is none yet to call back into).
    pub fn open(path: impl AsRef<Path>, progress: impl ProgressSink) -> Result<Trace> {
        Self::open_with_options(path, progress, TraceOptions::default())
    }

    /// Like [`Trace::open`], but with [`TraceOptions`] overriding the
    /// frame-count ceiling and the automatic-snapshot cadence.
    pub fn open_with_options(
        path: impl AsRef<Path>,
        progress: impl ProgressSink,
        options: TraceOptions,
    ) -> Result<Trace> {
        let (header, records) = decoder::decode_with_frame_cap(path.as_ref(), progress, options.frame_cap)?;

        let mut trie = CallstackTrie::new();
        let mut operations = Vec::with_capacity(records.len());
        let mut stacks = Vec::with_capacity(records.len());
        let mut fragindex = FragmentIndex::with_threshold(options.snapshot_threshold);

        for (i, record) in records.into_iter().enumerate() {
            let stack_id = trie.intern(&record.frames);
            fragindex.apply(i, &record.op);
            operations.push(record.op);
            stacks.push(stack_id);
        }
        if !operations.is_empty() {
            fragindex.finish(operations.len() - 1);
        }

        tracing::debug!(
            operations = operations.len(),
            unique_frames = trie.unique_frames(),
            total_frames = trie.total_frames(),
            "finished parsing capture file"
        );

        Ok(Trace {
            header,
            operations,
            stacks,
            trie,
            fragindex,
        })
    }

    /// The capture file's header metadata.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// How many operations were retained from the capture stream.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// The `i`th operation in recording order.
    pub fn operation(&self, i: usize) -> Op {
        self.operations[i]
    }

    /// The deduplicated callstack id recorded alongside operation `i`.
    pub fn callstack_for(&self, i: usize) -> StackId {
        self.stacks[i]
    }

    /// Write operation `i`'s callstack frames (innermost-first) into `out`.
    /// `out` must have room for at least `self.trie().depth(id)` entries.
    pub fn reify_callstack(&self, i: usize, out: &mut [u64]) {
        self.trie.reify(self.stacks[i], out);
    }

    /// The callstack deduplicator, for depth/reify queries keyed by id.
    pub fn trie(&self) -> &CallstackTrie {
        &self.trie
    }

    /// The live-allocation set immediately after operation `k` has been
    /// applied, sorted by `ptr` ascending. `k` beyond the last operation
    /// clamps to the last operation. An empty trace always returns `&[]`.
    pub fn snapshot_at(&mut self, k: usize) -> &[Entry] {
        self.fragindex.snapshot_at(k, &self.operations)
    }

    /// Hash-table occupancy for the live set as of the last ingested
    /// operation (or whatever `snapshot_at` call most recently rebuilt the
    /// working table, if any seeks have happened since).
    pub fn bucket_stats(&self) -> BucketStats {
        self.fragindex.bucket_stats()
    }
}
