//! Parses a capture file's header and operation stream.
//!
//! Mirrors the reference `DumpFile::parse`: validate the fixed header, then
//! stream tagged records until `GOODBYE`, end of file, or a short read on a
//! record that was only partially written by a producer that crashed or was
//! killed mid-write.

use std::fs::File;
use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::error::{Result, TraceError};
use crate::header::Header;
use crate::op::{Op, Tag};
use crate::progress::ProgressSink;

const SIGNATURE: &[u8; 16] = b"Malloc Monitor!\0";
const PROTOCOL_VERSION: u8 = 1;
const STRING_CAP: usize = 1024;
pub const DEFAULT_FRAME_CAP: u32 = 1024;

/// A decoded record plus the raw frame addresses of its callstack,
/// innermost-first, ready to be interned by a [`crate::CallstackTrie`].
pub(crate) struct Record {
    pub op: Op,
    pub frames: Vec<u64>,
}

/// Reads a capture file end to end, calling `progress` periodically, using
/// [`DEFAULT_FRAME_CAP`] as the per-record frame-count ceiling.
///
/// On success, returns the validated header and every record retained
/// before `GOODBYE`, end of file, or a torn trailing record.
pub(crate) fn decode(path: &std::path::Path, progress: impl ProgressSink) -> Result<(Header, Vec<Record>)> {
    decode_with_frame_cap(path, progress, DEFAULT_FRAME_CAP)
}

/// Like [`decode`], but rejecting any record whose callstack claims
/// `frame_count >= frame_cap` as [`TraceError::Overflow`].
pub(crate) fn decode_with_frame_cap(
    path: &std::path::Path,
    mut progress: impl ProgressSink,
    frame_cap: u32,
) -> Result<(Header, Vec<Record>)> {
    let mut file = File::open(path)?;
    let raw_len = file.metadata()?.len();
    if raw_len == 0 {
        return Err(TraceError::IoError(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "capture file is empty",
        )));
    }
    let file_len = raw_len.max(1);

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut cursor = io::Cursor::new(&buf[..]);

    let header = read_header(&mut cursor)?;
    let big_endian = header.producer_is_bigendian();
    let narrow_ptr = header.pointer_width_is_narrow();

    let mut records = Vec::new();
    loop {
        let pos_before = cursor.position();
        let tag_byte = match cursor.read_u8() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!("capture stream ended without a GOODBYE record");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        let tag = match Tag::from_u8(tag_byte) {
            Some(t) => t,
            None => return Err(TraceError::Corrupt(tag_byte)),
        };

        if tag == Tag::Goodbye {
            break;
        }
        if tag == Tag::Noop {
            continue;
        }

        match read_record(&mut cursor, tag, big_endian, narrow_ptr, frame_cap) {
            Ok(record) => records.push(record),
            Err(TraceError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!("discarding torn trailing record");
                cursor.set_position(pos_before);
                break;
            }
            Err(other) => return Err(other),
        }

        let percent = ((cursor.position() as f64 / file_len as f64) * 100.0) as u8;
        progress.update("Parsing raw data", percent.min(100));
    }

    progress.update("Parsing raw data", 100);
    Ok((header, records))
}

fn read_header(cur: &mut io::Cursor<&[u8]>) -> Result<Header> {
    let mut sig = [0u8; 16];
    cur.read_exact(&mut sig)?;
    if &sig != SIGNATURE {
        return Err(TraceError::BadSignature);
    }

    let protocol_version = cur.read_u8()?;
    if protocol_version != PROTOCOL_VERSION {
        return Err(TraceError::UnsupportedVersion(protocol_version));
    }

    let byte_order = cur.read_u8()?;
    let producer_is_bigendian = byte_order != 0;

    let pointer_width = cur.read_u8()?;
    if pointer_width != 4 && pointer_width != 8 {
        return Err(TraceError::IncompatiblePointerWidth(pointer_width));
    }

    let id = read_asciz(cur)?;
    let binary_path = read_asciz(cur)?;

    let producer_pid = read_u32(cur, producer_is_bigendian)?;

    Ok(Header {
        protocol_version,
        producer_is_bigendian,
        pointer_width,
        id,
        binary_path,
        producer_pid,
    })
}

fn read_asciz(cur: &mut io::Cursor<&[u8]>) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        if bytes.len() >= STRING_CAP {
            return Err(TraceError::Overflow {
                field: "id_or_binary_path",
                cap: STRING_CAP,
            });
        }
        let b = cur.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_u32(cur: &mut io::Cursor<&[u8]>, big_endian: bool) -> Result<u32> {
    let mut buf = [0u8; 4];
    cur.read_exact(&mut buf)?;
    Ok(if big_endian {
        BigEndian::read_u32(&buf)
    } else {
        LittleEndian::read_u32(&buf)
    })
}

fn read_u64(cur: &mut io::Cursor<&[u8]>, big_endian: bool) -> Result<u64> {
    let mut buf = [0u8; 8];
    cur.read_exact(&mut buf)?;
    Ok(if big_endian {
        BigEndian::read_u64(&buf)
    } else {
        LittleEndian::read_u64(&buf)
    })
}

/// Reads a producer-width pointer/size field, zero-extended to 64 bits.
fn read_ptr(cur: &mut io::Cursor<&[u8]>, big_endian: bool, narrow: bool) -> Result<u64> {
    if narrow {
        Ok(read_u32(cur, big_endian)? as u64)
    } else {
        read_u64(cur, big_endian)
    }
}

fn read_callstack(cur: &mut io::Cursor<&[u8]>, big_endian: bool, narrow: bool, frame_cap: u32) -> Result<Vec<u64>> {
    let count = read_u32(cur, big_endian)?;
    if count >= frame_cap {
        return Err(TraceError::Overflow {
            field: "frame_count",
            cap: frame_cap as usize,
        });
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        frames.push(read_ptr(cur, big_endian, narrow)?);
    }
    Ok(frames)
}

fn read_record(
    cur: &mut io::Cursor<&[u8]>,
    tag: Tag,
    big_endian: bool,
    narrow: bool,
    frame_cap: u32,
) -> Result<Record> {
    let timestamp = read_u32(cur, big_endian)?;

    let op = match tag {
        Tag::Malloc => {
            let size = read_ptr(cur, big_endian, narrow)?;
            let result = read_ptr(cur, big_endian, narrow)?;
            Op::Malloc {
                timestamp,
                size,
                result,
            }
        }
        Tag::Realloc => {
            let old_ptr = read_ptr(cur, big_endian, narrow)?;
            let size = read_ptr(cur, big_endian, narrow)?;
            let result = read_ptr(cur, big_endian, narrow)?;
            Op::Realloc {
                timestamp,
                old_ptr,
                size,
                result,
            }
        }
        Tag::Memalign => {
            let boundary = read_ptr(cur, big_endian, narrow)?;
            let size = read_ptr(cur, big_endian, narrow)?;
            let result = read_ptr(cur, big_endian, narrow)?;
            Op::Memalign {
                timestamp,
                boundary,
                size,
                result,
            }
        }
        Tag::Free => {
            let ptr = read_ptr(cur, big_endian, narrow)?;
            Op::Free { timestamp, ptr }
        }
        Tag::Noop | Tag::Goodbye => unreachable!("handled by the caller before dispatch"),
    };

    let frames = read_callstack(cur, big_endian, narrow, frame_cap)?;
    Ok(Record { op, frames })
}
