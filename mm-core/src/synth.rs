//! A byte-exact capture-file writer for tests.
//!
//! Plays the producer's role well enough to build a valid header and
//! operation stream, modeled on `malloc_monitor_client.c`'s
//! `daemon_write_operation`/`MALLOCMONITOR_put_*` family. Not a production
//! transport client — there is no socket here, only a byte buffer that
//! [`TraceBuilder::write_to`] hands to a file.

use std::io::{self, Write};

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

const SIGNATURE: &[u8; 16] = b"Malloc Monitor!\0";

/// Builds a capture file byte buffer one operation at a time.
pub struct TraceBuilder {
    buf: Vec<u8>,
    big_endian: bool,
    narrow: bool,
}

impl TraceBuilder {
    /// Start a new little-endian, 8-byte-pointer capture with the given
    /// producer id, binary path, and pid.
    pub fn new(id: &str, binary_path: &str, pid: u32) -> Self {
        Self::with_format(id, binary_path, pid, false, 8)
    }

    /// Start a capture with an explicit byte order and pointer width
    /// (`4` or `8`), for tests that exercise byte-swap or zero-extension
    /// paths.
    pub fn with_format(id: &str, binary_path: &str, pid: u32, big_endian: bool, pointer_width: u8) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(SIGNATURE);
        buf.write_u8(1).unwrap();
        buf.write_u8(if big_endian { 1 } else { 0 }).unwrap();
        buf.write_u8(pointer_width).unwrap();
        buf.write_all(id.as_bytes()).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_all(binary_path.as_bytes()).unwrap();
        buf.write_u8(0).unwrap();
        write_u32(&mut buf, big_endian, pid);
        TraceBuilder {
            buf,
            big_endian,
            narrow: pointer_width == 4,
        }
    }

    fn write_ptr(&mut self, v: u64) {
        let (buf, big_endian, narrow) = (&mut self.buf, self.big_endian, self.narrow);
        if narrow {
            write_u32(buf, big_endian, v as u32);
        } else if big_endian {
            buf.write_u64::<BigEndian>(v).unwrap();
        } else {
            buf.write_u64::<LittleEndian>(v).unwrap();
        }
    }

    fn write_callstack(&mut self, frames: &[u64]) {
        write_u32(&mut self.buf, self.big_endian, frames.len() as u32);
        for &f in frames {
            self.write_ptr(f);
        }
    }

    /// Append a `MALLOC(size)` record that returned `result`.
    pub fn malloc(&mut self, timestamp: u32, size: u64, result: u64, frames: &[u64]) -> &mut Self {
        self.buf.write_u8(2).unwrap();
        write_u32(&mut self.buf, self.big_endian, timestamp);
        self.write_ptr(size);
        self.write_ptr(result);
        self.write_callstack(frames);
        self
    }

    /// Append a `REALLOC(old_ptr, size)` record that returned `result`.
    pub fn realloc(&mut self, timestamp: u32, old_ptr: u64, size: u64, result: u64, frames: &[u64]) -> &mut Self {
        self.buf.write_u8(3).unwrap();
        write_u32(&mut self.buf, self.big_endian, timestamp);
        self.write_ptr(old_ptr);
        self.write_ptr(size);
        self.write_ptr(result);
        self.write_callstack(frames);
        self
    }

    /// Append a `MEMALIGN(boundary, size)` record that returned `result`.
    pub fn memalign(&mut self, timestamp: u32, boundary: u64, size: u64, result: u64, frames: &[u64]) -> &mut Self {
        self.buf.write_u8(4).unwrap();
        write_u32(&mut self.buf, self.big_endian, timestamp);
        self.write_ptr(boundary);
        self.write_ptr(size);
        self.write_ptr(result);
        self.write_callstack(frames);
        self
    }

    /// Append a `FREE(ptr)` record.
    pub fn free(&mut self, timestamp: u32, ptr: u64, frames: &[u64]) -> &mut Self {
        self.buf.write_u8(5).unwrap();
        write_u32(&mut self.buf, self.big_endian, timestamp);
        self.write_ptr(ptr);
        self.write_callstack(frames);
        self
    }

    /// Append a `NOOP` record, which the decoder skips.
    pub fn noop(&mut self) -> &mut Self {
        self.buf.write_u8(0).unwrap();
        self
    }

    /// Finish the stream with `GOODBYE` and return the raw bytes.
    pub fn finish(&mut self) -> Vec<u8> {
        self.buf.write_u8(1).unwrap();
        std::mem::take(&mut self.buf)
    }

    /// Finish the stream with `GOODBYE` and write it to `path`.
    pub fn write_to(&mut self, path: &std::path::Path) -> io::Result<()> {
        let bytes = self.finish();
        std::fs::write(path, bytes)
    }
}

fn write_u32(buf: &mut Vec<u8>, big_endian: bool, v: u32) {
    if big_endian {
        buf.write_u32::<BigEndian>(v).unwrap();
    } else {
        buf.write_u32::<LittleEndian>(v).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::Trace;

    #[test]
    fn builder_output_is_openable_as_a_trace() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mm-synth-test-{}.dump", std::process::id()));
        let mut builder = TraceBuilder::new("synth-id", "/bin/synth", 99);
        builder
            .malloc(1, 16, 0x1000, &[0xAAAA, 0xBBBB])
            .free(2, 0x1000, &[]);
        builder.write_to(&path).unwrap();

        let mut trace = Trace::open(&path, NoopProgress).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(trace.header().id(), "synth-id");
        assert_eq!(trace.operation_count(), 2);
        assert_eq!(trace.snapshot_at(1), &[] as &[crate::fragindex::Entry]);
    }
}
