//! Byte-level capture encoding: varints, the textual header, and the
//! `(tag, length, payload)` record framing.
//!
//! The format is little-endian throughout. Every integer outside the
//! one-byte record tag is an unsigned LEB128 varint; signed line deltas are
//! zigzag-mapped first. The header is textual `key=value` lines terminated
//! by a single NUL so captures stay grep-able, and it is never compressed
//! even when the record body is.

use std::{
    fmt,
    io::{self, Read, Write},
    str::FromStr,
};

use crate::records::{
    AggregatedAllocationRecord, AllocationRecord, AllocatorKind, CaptureHeader, CodeDescriptor, CodeId, FileFormat,
    FILE_MAGIC, FILE_VERSION, MemorySnapshot, NativeFrameRecord, NativeStackId, Record, RecordTag, ShadowFrame, StackId, ThreadId,
};

/// Longest legal varint for a `u64`: 10 bytes of 7 payload bits each.
const MAX_VARINT_LEN: usize = 10;

/// Width of the header fields that are patched in place at close time.
/// 20 digits is enough for any `u64`, so a rewrite never moves the body.
const PATCHED_FIELD_WIDTH: usize = 20;

/// A structural problem inside a single record or the header.
///
/// The reader wraps this with the stream offset of the offending record;
/// see `ReadError` in [`crate::error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A tag byte that no known record uses.
    UnknownTag(u8),
    /// A varint ran past its maximum length or past the payload end.
    BadVarint,
    /// A value did not fit the field it was decoded into.
    ValueOutOfRange(&'static str),
    /// A string field held invalid UTF-8.
    BadUtf8,
    /// An enum byte with no corresponding variant.
    BadEnum { field: &'static str, value: u64 },
    /// The payload was shorter or longer than its fields require.
    PayloadLength { tag: RecordTag },
    /// A malformed or incomplete textual header.
    BadHeader(&'static str),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTag(tag) => write!(f, "unknown record tag {tag:#04x}"),
            Self::BadVarint => write!(f, "malformed varint"),
            Self::ValueOutOfRange(field) => write!(f, "value out of range for {field}"),
            Self::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::BadEnum { field, value } => write!(f, "invalid {field} value {value}"),
            Self::PayloadLength { tag } => {
                let name: &'static str = (*tag).into();
                write!(f, "payload length mismatch in {name} record")
            }
            Self::BadHeader(what) => write!(f, "malformed capture header: {what}"),
        }
    }
}

impl std::error::Error for WireError {}

// === varints ===

/// Appends `value` to `out` as an unsigned LEB128 varint.
pub fn varint_to_vec(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a varint from the front of `bytes`, returning the value and the
/// remaining suffix. `None` if the slice ends mid-varint or the varint is
/// longer than a `u64` allows.
#[must_use]
pub fn varint_from_slice(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        let payload = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            // The tenth byte may only carry the final bit of a u64.
            return None;
        }
        value |= payload << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, &bytes[i + 1..]));
        }
    }
    None
}

/// Reads a varint from a byte stream. Distinguishes clean EOF on the first
/// byte (`Ok(None)`) from EOF mid-varint (`Err` with `UnexpectedEof`).
pub fn varint_from_reader<R: Read>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && i == 0 => return Ok(None),
            Err(err) => return Err(err),
        }
        let byte = byte[0];
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"))
}

/// Encoded length of `value` as a varint, for stream-offset bookkeeping.
#[must_use]
pub fn varint_len(value: u64) -> u64 {
    let bits = 64 - u64::from(value.leading_zeros()).min(63);
    bits.max(1).div_ceil(7)
}

/// Maps a signed value onto the unsigned varint space (0, -1, 1, -2, ...).
#[inline]
#[must_use]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[inline]
#[must_use]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// === payload cursor ===

/// Pull-decoder over a single record payload. Every field read is
/// checked; trailing bytes after the last field are a structural error.
struct Payload<'a> {
    bytes: &'a [u8],
    tag: RecordTag,
}

impl<'a> Payload<'a> {
    fn new(tag: RecordTag, bytes: &'a [u8]) -> Self {
        Self { bytes, tag }
    }

    fn varint(&mut self) -> Result<u64, WireError> {
        let (value, rest) = varint_from_slice(self.bytes).ok_or(WireError::BadVarint)?;
        self.bytes = rest;
        Ok(value)
    }

    fn varint_u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        u32::try_from(self.varint()?).map_err(|_| WireError::ValueOutOfRange(field))
    }

    fn byte(&mut self) -> Result<u8, WireError> {
        let (&first, rest) = self.bytes.split_first().ok_or(WireError::PayloadLength { tag: self.tag })?;
        self.bytes = rest;
        Ok(first)
    }

    fn raw(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.bytes.len() < len {
            return Err(WireError::PayloadLength { tag: self.tag });
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn bytes_field(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| WireError::ValueOutOfRange("length"))?;
        Ok(self.raw(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.bytes_field()?).map_err(|_| WireError::BadUtf8)
    }

    fn finish(self) -> Result<(), WireError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(WireError::PayloadLength { tag: self.tag })
        }
    }
}

fn string_to_vec(out: &mut Vec<u8>, value: &str) {
    varint_to_vec(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn bytes_to_vec(out: &mut Vec<u8>, value: &[u8]) {
    varint_to_vec(out, value.len() as u64);
    out.extend_from_slice(value);
}

// === record framing ===

/// Encodes `record` into `scratch` and writes the `(tag, length, payload)`
/// frame to `out`. `scratch` is caller-owned so the hot path reuses one
/// buffer instead of allocating per record.
pub fn write_record<W: Write>(out: &mut W, record: &Record, scratch: &mut Vec<u8>) -> io::Result<()> {
    scratch.clear();
    encode_payload(record, scratch);
    let mut frame = [0u8; 1 + MAX_VARINT_LEN];
    frame[0] = record.tag() as u8;
    let frame_len = 1 + varint_to_slice(&mut frame[1..], scratch.len() as u64);
    out.write_all(&frame[..frame_len])?;
    out.write_all(scratch)
}

/// Encodes `value` into `buf` (which must hold [`MAX_VARINT_LEN`] bytes)
/// and returns the encoded length.
fn varint_to_slice(buf: &mut [u8], mut value: u64) -> usize {
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            return len + 1;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
}

fn encode_payload(record: &Record, out: &mut Vec<u8>) {
    match record {
        Record::MemoryRecord(snapshot) => {
            varint_to_vec(out, snapshot.time_ms);
            varint_to_vec(out, snapshot.rss_bytes);
        }
        Record::ContextSwitch(tid) => varint_to_vec(out, tid.0),
        Record::ThreadName(name) => string_to_vec(out, name),
        Record::CodeObject { id, descriptor } => {
            varint_to_vec(out, u64::from(id.raw()));
            string_to_vec(out, &descriptor.function_name);
            string_to_vec(out, &descriptor.file_name);
            bytes_to_vec(out, &descriptor.linetable);
            varint_to_vec(out, u64::from(descriptor.first_line));
        }
        Record::FramePush(push) => {
            varint_to_vec(out, u64::from(push.code.raw()));
            varint_to_vec(out, u64::from(push.instr_offset));
            out.push(u8::from(push.is_entry));
        }
        Record::FramePop { count } => out.push(*count),
        Record::NativeFrame(frame) => {
            varint_to_vec(out, frame.ip);
            varint_to_vec(out, u64::from(frame.parent.raw()));
        }
        Record::Allocation(alloc) => {
            varint_to_vec(out, alloc.address);
            varint_to_vec(out, alloc.size);
            out.push(alloc.kind as u8);
            varint_to_vec(out, u64::from(alloc.native_stack.raw()));
        }
        Record::AggregatedAllocation(row) => {
            varint_to_vec(out, row.tid.0);
            varint_to_vec(out, u64::from(row.stack.raw()));
            varint_to_vec(out, u64::from(row.native_stack.raw()));
            out.push(row.kind as u8);
            varint_to_vec(out, row.n_allocations_in_high_water_mark);
            varint_to_vec(out, row.bytes_in_high_water_mark);
            varint_to_vec(out, row.n_allocations_leaked);
            varint_to_vec(out, row.bytes_leaked);
        }
        Record::MemoryMapStart | Record::Trailer => {}
        Record::SegmentHeader {
            filename,
            base_addr,
            n_segments,
        } => {
            string_to_vec(out, filename);
            varint_to_vec(out, *base_addr);
            varint_to_vec(out, *n_segments);
        }
        Record::Segment { vaddr, memsz } => {
            varint_to_vec(out, *vaddr);
            varint_to_vec(out, *memsz);
        }
    }
}

/// Decodes one record payload. The frame (tag byte and length prefix) has
/// already been consumed by the caller; `bytes` is exactly the payload.
pub fn decode_payload(tag: u8, bytes: &[u8]) -> Result<Record, WireError> {
    let tag = RecordTag::from_repr(tag).ok_or(WireError::UnknownTag(tag))?;
    let mut payload = Payload::new(tag, bytes);
    let record = match tag {
        RecordTag::MemoryRecord => Record::MemoryRecord(MemorySnapshot {
            time_ms: payload.varint()?,
            rss_bytes: payload.varint()?,
        }),
        RecordTag::ContextSwitch => Record::ContextSwitch(ThreadId(payload.varint()?)),
        RecordTag::ThreadName => Record::ThreadName(payload.string()?),
        RecordTag::CodeObject => {
            let id = CodeId::from_raw(payload.varint_u32("code id")?);
            let function_name = payload.string()?;
            let file_name = payload.string()?;
            let linetable = payload.bytes_field()?;
            let first_line = payload.varint_u32("first line")?;
            Record::CodeObject {
                id,
                descriptor: CodeDescriptor {
                    function_name,
                    file_name,
                    first_line,
                    linetable,
                },
            }
        }
        RecordTag::FramePush => Record::FramePush(ShadowFrame {
            code: CodeId::from_raw(payload.varint_u32("code id")?),
            instr_offset: payload.varint_u32("instruction offset")?,
            is_entry: payload.byte()? != 0,
        }),
        RecordTag::FramePop => Record::FramePop { count: payload.byte()? },
        RecordTag::NativeFrameId => Record::NativeFrame(NativeFrameRecord {
            ip: payload.varint()?,
            parent: NativeStackId::from_raw(payload.varint_u32("native frame id")?),
        }),
        RecordTag::Allocation => {
            let address = payload.varint()?;
            let size = payload.varint()?;
            let kind_byte = payload.byte()?;
            let kind = AllocatorKind::from_repr(kind_byte).ok_or(WireError::BadEnum {
                field: "allocator kind",
                value: u64::from(kind_byte),
            })?;
            let native_stack = NativeStackId::from_raw(payload.varint_u32("native frame id")?);
            Record::Allocation(AllocationRecord {
                address,
                size,
                kind,
                native_stack,
            })
        }
        RecordTag::AggregatedAllocation => {
            let tid = ThreadId(payload.varint()?);
            let stack = StackId::from_raw(payload.varint_u32("stack id")?);
            let native_stack = NativeStackId::from_raw(payload.varint_u32("native frame id")?);
            let kind_byte = payload.byte()?;
            let kind = AllocatorKind::from_repr(kind_byte).ok_or(WireError::BadEnum {
                field: "allocator kind",
                value: u64::from(kind_byte),
            })?;
            Record::AggregatedAllocation(AggregatedAllocationRecord {
                tid,
                stack,
                native_stack,
                kind,
                n_allocations_in_high_water_mark: payload.varint()?,
                bytes_in_high_water_mark: payload.varint()?,
                n_allocations_leaked: payload.varint()?,
                bytes_leaked: payload.varint()?,
            })
        }
        RecordTag::MemoryMapStart => Record::MemoryMapStart,
        RecordTag::SegmentHeader => Record::SegmentHeader {
            filename: payload.string()?,
            base_addr: payload.varint()?,
            n_segments: payload.varint()?,
        },
        RecordTag::Segment => Record::Segment {
            vaddr: payload.varint()?,
            memsz: payload.varint()?,
        },
        RecordTag::Trailer => Record::Trailer,
    };
    payload.finish()?;
    Ok(record)
}

// === textual header ===

fn push_field(out: &mut String, key: &str, value: impl fmt::Display) {
    use fmt::Write as _;
    let _ = writeln!(out, "{key}={value}");
}

fn push_patched_field(out: &mut String, key: &str, value: u64) {
    use fmt::Write as _;
    let _ = writeln!(out, "{key}={value:0width$}", width = PATCHED_FIELD_WIDTH);
}

/// Renders the header. The same call is used at open and at close: the
/// close-time values only differ in fixed-width fields, so the encoded
/// length never changes and the writer can rewrite the header in place.
#[must_use]
pub fn encode_header(header: &CaptureHeader) -> Vec<u8> {
    let mut text = String::new();
    push_field(&mut text, "magic", FILE_MAGIC);
    push_field(&mut text, "version", FILE_VERSION);
    push_field(&mut text, "python_version", format_args!("{:#010x}", header.python_version));
    push_field(&mut text, "native_traces", header.native_traces);
    let format_name: &'static str = header.file_format.into();
    push_field(&mut text, "file_format", format_name);
    push_patched_field(&mut text, "n_allocations", header.n_allocations);
    push_patched_field(&mut text, "n_frames", header.n_frames);
    push_field(&mut text, "start_time", header.start_time_ms);
    push_patched_field(&mut text, "end_time", header.end_time_ms);
    push_field(&mut text, "pid", header.pid);
    push_field(&mut text, "main_tid", header.main_tid.0);
    push_field(&mut text, "skipped_frames_on_main_tid", header.skipped_frames_on_main_tid);
    push_field(&mut text, "command_line", header.command_line.replace('\n', " "));
    push_field(&mut text, "python_allocator", &header.python_allocator);
    push_field(&mut text, "trace_python_allocators", header.trace_python_allocators);
    let mut bytes = text.into_bytes();
    bytes.push(0);
    bytes
}

fn parse_field<T: FromStr>(value: &str, what: &'static str) -> Result<T, WireError> {
    value.parse().map_err(|_| WireError::BadHeader(what))
}

/// Consumes and parses the textual header from the front of a stream.
/// Returns the header and the number of bytes consumed (including the NUL).
pub fn read_header<R: Read>(reader: &mut R) -> io::Result<Result<(CaptureHeader, u64), WireError>> {
    let mut raw = Vec::with_capacity(512);
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Err(WireError::BadHeader("truncated before separator")));
            }
            Err(err) => return Err(err),
        }
        if byte[0] == 0 {
            break;
        }
        raw.push(byte[0]);
        if raw.len() > 64 * 1024 {
            return Ok(Err(WireError::BadHeader("unreasonably large")));
        }
    }
    let consumed = raw.len() as u64 + 1;
    Ok(parse_header_text(&raw).map(|header| (header, consumed)))
}

fn parse_header_text(raw: &[u8]) -> Result<CaptureHeader, WireError> {
    let text = std::str::from_utf8(raw).map_err(|_| WireError::BadHeader("not UTF-8"))?;
    let mut header = CaptureHeader::empty(FileFormat::AllAllocations);
    let mut seen_magic = false;
    let mut seen_version = false;
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(WireError::BadHeader("line without '='"))?;
        match key {
            "magic" => {
                if value != FILE_MAGIC {
                    return Err(WireError::BadHeader("wrong magic"));
                }
                seen_magic = true;
            }
            "version" => {
                let version: u32 = parse_field(value, "version")?;
                if version != FILE_VERSION {
                    return Err(WireError::BadHeader("unsupported version"));
                }
                seen_version = true;
            }
            "python_version" => {
                let digits = value.strip_prefix("0x").ok_or(WireError::BadHeader("python_version"))?;
                header.python_version =
                    u32::from_str_radix(digits, 16).map_err(|_| WireError::BadHeader("python_version"))?;
            }
            "native_traces" => header.native_traces = parse_field(value, "native_traces")?,
            "file_format" => {
                header.file_format = FileFormat::from_str(value).map_err(|_| WireError::BadHeader("file_format"))?;
            }
            "n_allocations" => header.n_allocations = parse_field(value, "n_allocations")?,
            "n_frames" => header.n_frames = parse_field(value, "n_frames")?,
            "start_time" => header.start_time_ms = parse_field(value, "start_time")?,
            "end_time" => header.end_time_ms = parse_field(value, "end_time")?,
            "pid" => header.pid = parse_field(value, "pid")?,
            "main_tid" => header.main_tid = ThreadId(parse_field(value, "main_tid")?),
            "skipped_frames_on_main_tid" => {
                header.skipped_frames_on_main_tid = parse_field(value, "skipped_frames_on_main_tid")?;
            }
            "command_line" => header.command_line = value.to_owned(),
            "python_allocator" => header.python_allocator = value.to_owned(),
            "trace_python_allocators" => {
                header.trace_python_allocators = parse_field(value, "trace_python_allocators")?;
            }
            // Unknown keys are tolerated so minor additions stay readable
            // by older parsers.
            _ => {}
        }
    }
    if !seen_magic {
        return Err(WireError::BadHeader("missing magic"));
    }
    if !seen_version {
        return Err(WireError::BadHeader("missing version"));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            let mut bytes = Vec::new();
            varint_to_vec(&mut bytes, value);
            let (decoded, rest) = varint_from_slice(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn varint_rejects_overlong_encoding() {
        // Eleven continuation bytes can never be a u64.
        let bytes = [0xffu8; 11];
        assert!(varint_from_slice(&bytes).is_none());
    }

    #[test]
    fn zigzag_is_involutive() {
        for value in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn header_length_is_stable_across_patching() {
        let mut header = CaptureHeader::empty(FileFormat::AllAllocations);
        header.command_line = "mneme run demo.py".to_owned();
        header.python_allocator = "pymalloc".to_owned();
        let before = encode_header(&header);
        header.n_allocations = u64::MAX;
        header.n_frames = 123_456;
        header.end_time_ms = 1_700_000_000_000;
        let after = encode_header(&header);
        assert_eq!(before.len(), after.len());
    }
}
