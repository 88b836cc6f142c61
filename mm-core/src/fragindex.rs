//! The fragmentation seeker: a snapshot-indexed hash map of currently-live
//! allocations that reconstructs the live-block set at arbitrary operation
//! indices with work bounded by the distance to the nearest snapshot.

use crate::op::Op;

/// Number of buckets in the working hash table. Must be a power of two —
/// the hash folds the address space into exactly this many buckets.
const BUCKET_COUNT: usize = 65_536;
static_assertions::const_assert!(BUCKET_COUNT.is_power_of_two());

/// How many operations pass between automatic snapshot materializations.
pub const SNAPSHOT_THRESHOLD: usize = 1000;

/// A single live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub ptr: u64,
    pub size: u64,
}

/// An immutable, address-ascending view of every live allocation at the
/// operation index it was taken at.
#[derive(Debug, Clone)]
struct Snapshot {
    operation_index: usize,
    entries: Vec<Entry>,
}

/// A node in a bucket's singly linked chain. The pool doubles as both the
/// live chain (via `next`) and the free chain (the same field, repurposed)
/// so that steady-state operation never allocates or frees an individual
/// node once the pool has grown to the trace's high-water mark.
#[derive(Debug, Clone, Copy)]
struct Slot {
    ptr: u64,
    size: u64,
    next: Option<u32>,
}

fn hash(ptr: u64) -> usize {
    let lo = (ptr & 0xFFFF) as u16;
    let hi = ((ptr >> 16) & 0xFFFF) as u16;
    (lo ^ hi) as usize
}

/// Maintains the currently-live allocation set during ingestion and
/// answers random-access "what was live at operation k" queries afterward.
///
/// `snapshot_at` needs the full operation log to replay a range between
/// snapshots; `FragmentIndex` does not own that log (the [`crate::Trace`]
/// facade does), so it is passed in at query time.
#[derive(Debug, Clone)]
pub struct FragmentIndex {
    buckets: Vec<Option<u32>>,
    slots: Vec<Slot>,
    free_head: Option<u32>,
    live_count: usize,
    current_index: usize,
    ops_since_snapshot: usize,
    snapshot_threshold: usize,
    snapshots: Vec<Snapshot>,
}

impl Default for FragmentIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Occupancy of the working hash table, computed once from whatever live
/// set the table currently holds (ordinarily the full live set as of the
/// last ingested operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    pub bucket_count: usize,
    pub live_count: usize,
    pub occupied_buckets: usize,
    pub max_chain_len: usize,
}

impl FragmentIndex {
    pub fn new() -> Self {
        Self::with_threshold(SNAPSHOT_THRESHOLD)
    }

    /// Like [`FragmentIndex::new`], but materializing automatic snapshots
    /// every `threshold` operations instead of every [`SNAPSHOT_THRESHOLD`].
    /// A `threshold` of `0` is treated as `1` (snapshot after every op).
    pub fn with_threshold(threshold: usize) -> Self {
        FragmentIndex {
            buckets: vec![None; BUCKET_COUNT],
            slots: Vec::new(),
            free_head: None,
            live_count: 0,
            current_index: 0,
            ops_since_snapshot: 0,
            snapshot_threshold: threshold.max(1),
            snapshots: Vec::new(),
        }
    }

    /// Occupancy of the working hash table in its current state.
    pub fn bucket_stats(&self) -> BucketStats {
        let mut occupied_buckets = 0;
        let mut max_chain_len = 0;
        for head in &self.buckets {
            let mut len = 0;
            let mut cur = *head;
            while let Some(idx) = cur {
                len += 1;
                cur = self.slots[idx as usize].next;
            }
            if len > 0 {
                occupied_buckets += 1;
            }
            max_chain_len = max_chain_len.max(len);
        }
        BucketStats {
            bucket_count: self.buckets.len(),
            live_count: self.live_count,
            occupied_buckets,
            max_chain_len,
        }
    }

    fn alloc_slot(&mut self, ptr: u64, size: u64) -> u32 {
        if let Some(idx) = self.free_head {
            self.free_head = self.slots[idx as usize].next;
            self.slots[idx as usize] = Slot { ptr, size, next: None };
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot { ptr, size, next: None });
            idx
        }
    }

    fn insert(&mut self, ptr: u64, size: u64) {
        let bucket = hash(ptr);
        let head = self.buckets[bucket];
        let idx = self.alloc_slot(ptr, size);
        self.slots[idx as usize].next = head;
        self.buckets[bucket] = Some(idx);
        self.live_count += 1;
    }

    fn update_size(&mut self, ptr: u64, size: u64) {
        let bucket = hash(ptr);
        let mut cur = self.buckets[bucket];
        while let Some(idx) = cur {
            if self.slots[idx as usize].ptr == ptr {
                self.slots[idx as usize].size = size;
                return;
            }
            cur = self.slots[idx as usize].next;
        }
        // Not currently live: fall back to the remove-then-insert this is
        // an optimization of, so it agrees with a from-scratch replay.
        self.insert(ptr, size);
    }

    fn remove(&mut self, ptr: u64) {
        let bucket = hash(ptr);
        let mut cur = self.buckets[bucket];
        let mut prev: Option<u32> = None;
        while let Some(idx) = cur {
            if self.slots[idx as usize].ptr == ptr {
                let next = self.slots[idx as usize].next;
                match prev {
                    Some(p) => self.slots[p as usize].next = next,
                    None => self.buckets[bucket] = next,
                }
                self.slots[idx as usize].next = self.free_head;
                self.free_head = Some(idx);
                self.live_count -= 1;
                return;
            }
            prev = Some(idx);
            cur = self.slots[idx as usize].next;
        }
        // Unknown ptr: double-free and foreign-free are tolerated silently.
    }

    fn clear(&mut self) {
        for b in &mut self.buckets {
            *b = None;
        }
        self.slots.clear();
        self.free_head = None;
        self.live_count = 0;
    }

    /// Apply one operation's effect on the live set, without touching the
    /// snapshot bookkeeping. Shared by forward ingestion and replay.
    fn mutate(&mut self, op: &Op) {
        match *op {
            Op::Malloc { result, size, .. } => {
                if result != 0 {
                    self.insert(result, size);
                }
            }
            Op::Memalign { result, size, .. } => {
                if result != 0 {
                    self.insert(result, size);
                }
            }
            Op::Realloc {
                old_ptr,
                size,
                result,
                ..
            } => {
                if result == 0 {
                    if old_ptr != 0 {
                        self.remove(old_ptr);
                    }
                } else if old_ptr == result && size > 0 {
                    self.update_size(result, size);
                } else {
                    if old_ptr != 0 {
                        self.remove(old_ptr);
                    }
                    if size > 0 {
                        self.insert(result, size);
                    }
                }
            }
            Op::Free { ptr, .. } => {
                self.remove(ptr);
            }
        }
    }

    /// Apply the operation at `index` during the initial forward pass,
    /// materializing an automatic snapshot every [`SNAPSHOT_THRESHOLD`] ops.
    pub(crate) fn apply(&mut self, index: usize, op: &Op) {
        self.mutate(op);
        self.current_index = index;
        self.ops_since_snapshot += 1;
        if self.ops_since_snapshot >= self.snapshot_threshold {
            self.take_snapshot();
            self.ops_since_snapshot = 0;
        }
    }

    /// Materialize a snapshot at the end of ingestion, tagged at
    /// `last_index` (the index of the final retained operation). Always
    /// taken, even if the threshold was just hit, so a trace whose
    /// operation count isn't a multiple of the threshold still has a
    /// snapshot at its very last operation.
    pub(crate) fn finish(&mut self, last_index: usize) {
        self.current_index = last_index;
        self.take_snapshot();
    }

    fn take_snapshot(&mut self) {
        let mut entries = Vec::with_capacity(self.live_count);
        for head in &self.buckets {
            let mut cur = *head;
            while let Some(idx) = cur {
                let slot = self.slots[idx as usize];
                entries.push(Entry {
                    ptr: slot.ptr,
                    size: slot.size,
                });
                cur = slot.next;
            }
        }
        introsort(&mut entries);
        self.insert_snapshot(Snapshot {
            operation_index: self.current_index,
            entries,
        });
    }

    /// Insert a freshly materialized snapshot, replacing the next-higher
    /// snapshot already in the sequence (if any) so that repeated random
    /// access near the same region stays cheap.
    fn insert_snapshot(&mut self, fresh: Snapshot) {
        match self
            .snapshots
            .binary_search_by(|s| s.operation_index.cmp(&fresh.operation_index))
        {
            Ok(pos) => self.snapshots[pos] = fresh,
            Err(pos) if pos < self.snapshots.len() => self.snapshots[pos] = fresh,
            Err(_) => self.snapshots.push(fresh),
        }
    }

    /// The live-allocation set immediately after the operation at index
    /// `k` has been applied, sorted by `ptr` ascending. `k` beyond the
    /// last operation clamps to the last operation rather than erroring.
    ///
    /// `ops` must be the same operation log this index was built from.
    pub fn snapshot_at(&mut self, k: usize, ops: &[Op]) -> &[Entry] {
        if ops.is_empty() {
            return &[];
        }
        let k = k.min(ops.len() - 1);

        let pos = self
            .snapshots
            .binary_search_by(|s| s.operation_index.cmp(&k));

        let start_pos = match pos {
            Ok(exact) => {
                return &self.snapshots[exact].entries;
            }
            Err(0) => None,
            Err(p) => Some(p - 1),
        };

        self.clear();
        let replay_from = match start_pos {
            Some(p) => {
                for e in &self.snapshots[p].entries {
                    self.insert(e.ptr, e.size);
                }
                self.snapshots[p].operation_index + 1
            }
            None => 0,
        };

        for (i, op) in ops.iter().enumerate().take(k + 1).skip(replay_from) {
            self.mutate(op);
            let _ = i;
        }
        self.current_index = k;
        self.take_snapshot();

        match self
            .snapshots
            .binary_search_by(|s| s.operation_index.cmp(&k))
        {
            Ok(pos) => &self.snapshots[pos].entries,
            Err(_) => unreachable!("snapshot for k was just inserted"),
        }
    }
}

/// Quicksort with a median-of-three pivot, falling back to a bubble sort
/// below four elements.
fn introsort(entries: &mut [Entry]) {
    fn cmp(a: &Entry, b: &Entry) -> std::cmp::Ordering {
        a.ptr.cmp(&b.ptr)
    }

    fn bubble_sort(a: &mut [Entry]) {
        let mut sorted = false;
        while !sorted {
            sorted = true;
            for i in 0..a.len().saturating_sub(1) {
                if cmp(&a[i], &a[i + 1]) == std::cmp::Ordering::Greater {
                    a.swap(i, i + 1);
                    sorted = false;
                }
            }
        }
    }

    fn quick_sort(a: &mut [Entry]) {
        if a.len() <= 4 {
            bubble_sort(a);
            return;
        }
        let lo = 0;
        let hi = a.len() - 1;
        let mid = (lo + hi) / 2;
        if cmp(&a[lo], &a[mid]) == std::cmp::Ordering::Greater {
            a.swap(lo, mid);
        }
        if cmp(&a[lo], &a[hi]) == std::cmp::Ordering::Greater {
            a.swap(lo, hi);
        }
        if cmp(&a[mid], &a[hi]) == std::cmp::Ordering::Greater {
            a.swap(mid, hi);
        }
        let pivot_idx = hi - 1;
        a.swap(mid, pivot_idx);

        let mut i = lo;
        let mut j = pivot_idx;
        loop {
            loop {
                i += 1;
                if cmp(&a[i], &a[pivot_idx]) != std::cmp::Ordering::Less {
                    break;
                }
            }
            loop {
                j -= 1;
                if cmp(&a[j], &a[pivot_idx]) != std::cmp::Ordering::Greater {
                    break;
                }
            }
            if j < i {
                break;
            }
            a.swap(i, j);
        }
        a.swap(i, pivot_idx);

        quick_sort(&mut a[..i]);
        quick_sort(&mut a[i + 1..]);
    }

    if entries.len() > 1 {
        quick_sort(entries);
    }
}
