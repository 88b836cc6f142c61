//! The progress-reporting surface presented to a hypothetical caller (e.g.
//! a GUI). `Trace::open` invokes it periodically while parsing; it is never
//! invoked concurrently and must never call back into the `Trace` being
//! constructed.

/// A capability with one operation: report that parsing has reached some
/// percentage of the capture file, along with a short human-readable status.
pub trait ProgressSink {
    /// `percent` is monotonically non-decreasing across calls and lies in `0..=100`.
    fn update(&mut self, status: &str, percent: u8);
}

/// A sink that does nothing. Satisfies the same contract as any other sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn update(&mut self, _status: &str, _percent: u8) {}
}

impl<F: FnMut(&str, u8)> ProgressSink for F {
    fn update(&mut self, status: &str, percent: u8) {
        self(status, percent)
    }
}
