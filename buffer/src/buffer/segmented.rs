//! Durable buffer over memory-mapped segment files
//!
//! # On-disk layout
//!
//! ```text
//! <path>/
//!   segment-0000000007.dat   sealed: truncated to its written length
//!   segment-0000000008.dat   sealed
//!   segment-0000000009.dat   tail: preallocated to segment_size, zero padded
//! ```
//!
//! Each file is a back-to-back run of encoded records. A zero length field or
//! the end of the file ends the run. There is no index file: shifting a record
//! sets the high bit of its length field, and recovery resumes at the first
//! record without it. A tail whose records have all been shifted is zeroed in
//! place.
//!
//! # Write ordering
//!
//! The record body is copied into the mapping before its length field. A crash
//! in between leaves a zero length field behind, which reads as end-of-data.

use super::Buffer;
use super::queue::{RecordQueue, RecordStore};
use crate::error::{Result, VarastoError};
use crate::metrics::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use memmap2::MmapMut;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use varasto_core::{CodecError, Message, codec};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".dat";
const INDEX_DIGITS: usize = 10;

/// Set in the length field of a record that has been shifted
const CONSUMED: u32 = 1 << 31;

/// Largest record a segment accepts; its length field must leave `CONSUMED` clear
const MAX_SEGMENT_RECORD: usize = CONSUMED as usize;

/// Per-record limit for a segmented buffer
fn segment_record_limit(segment_size: usize, backlog_limit: usize) -> usize {
    segment_size.min(backlog_limit).min(MAX_SEGMENT_RECORD)
}

fn write_u32(map: &mut [u8], offset: usize, value: u32) {
    map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// File name of the segment with the given index
pub fn segment_file_name(index: u64) -> String {
    format!("{SEGMENT_PREFIX}{index:0width$}{SEGMENT_SUFFIX}", width = INDEX_DIGITS)
}

fn parse_segment_index(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != INDEX_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Map a segment file read-write
#[allow(unsafe_code)]
fn map_segment(file: &File) -> io::Result<MmapMut> {
    // SAFETY: a segment directory belongs to exactly one buffer instance. The
    // file is only resized by this module, and never while it is mapped.
    unsafe { MmapMut::map_mut(file) }
}

/// Options for opening a [`SegmentedBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedOptions {
    /// Directory holding the segment files
    pub path: PathBuf,
    /// Size of each segment file; also the largest record accepted
    pub segment_size: usize,
    /// Maximum backlog in bytes, unbounded when `None`
    pub limit: Option<usize>,
    /// msync each record before the push returns
    pub sync_writes: bool,
}

impl SegmentedOptions {
    /// Options with default segment size, no limit and no sync
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            segment_size: super::DEFAULT_SEGMENT_SIZE,
            limit: None,
            sync_writes: false,
        }
    }

    /// Set the segment file size
    pub fn segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Set the backlog limit
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Enable msync after every write
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// One segment file
struct Segment {
    index: u64,
    path: PathBuf,
    file: File,
    /// Current file length
    capacity: usize,
    /// Bytes of valid records from the start of the file
    written: usize,
    /// Mapped lazily for sealed segments, always for the tail
    map: Option<MmapMut>,
}

impl Segment {
    fn create(dir: &Path, index: u64, size: usize) -> Result<Self> {
        let path = dir.join(segment_file_name(index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| VarastoError::io(&path, e))?;
        file.set_len(size as u64)
            .map_err(|e| VarastoError::io(&path, e))?;
        let map = map_segment(&file).map_err(|e| VarastoError::io(&path, e))?;

        Ok(Self {
            index,
            path,
            file,
            capacity: size,
            written: 0,
            map: Some(map),
        })
    }

    fn mapping(&mut self) -> Result<&mut MmapMut> {
        let map = match self.map.take() {
            Some(map) => map,
            None => map_segment(&self.file).map_err(|e| VarastoError::io(&self.path, e))?,
        };
        Ok(self.map.insert(map))
    }

    fn remaining(&self) -> usize {
        self.capacity - self.written
    }

    fn write_record(&mut self, record: &[u8], sync: bool) -> Result<()> {
        let start = self.written;
        let end = start + record.len();
        let map = self.mapping()?;

        map[start + 4..end].copy_from_slice(&record[4..]);
        map[start..start + 4].copy_from_slice(&record[..4]);
        let synced = if sync {
            map.flush_range(start, record.len())
        } else {
            Ok(())
        };
        synced.map_err(|e| VarastoError::io(&self.path, e))?;

        self.written = end;
        Ok(())
    }

    /// Flag the record at `offset` as shifted
    fn mark_consumed(&mut self, offset: usize, size: usize, sync: bool) -> Result<()> {
        let map = self.mapping()?;
        write_u32(map, offset, (size - 4) as u32 | CONSUMED);
        let synced = if sync {
            map.flush_range(offset, 4)
        } else {
            Ok(())
        };
        synced.map_err(|e| VarastoError::io(&self.path, e))
    }

    /// Forget every record, keeping the file for reuse
    fn reset(&mut self, sync: bool) -> Result<()> {
        let written = self.written;
        if written == 0 {
            return Ok(());
        }
        let map = self.mapping()?;
        // First length field goes first so a crash mid-clear reads as empty
        write_u32(map, 0, 0);
        let cleared = if sync { map.flush_range(0, 4) } else { Ok(()) };
        let cleared = cleared.and_then(|()| {
            map[..written].fill(0);
            if sync { map.flush_range(0, written) } else { Ok(()) }
        });
        cleared.map_err(|e| VarastoError::io(&self.path, e))?;
        self.written = 0;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        match &self.map {
            Some(map) => map.flush().map_err(|e| VarastoError::io(&self.path, e)),
            None => Ok(()),
        }
    }

    /// Flush, unmap and cut the preallocated tail off the file
    fn seal(&mut self) -> Result<()> {
        self.flush()?;
        self.map = None;
        self.file
            .set_len(self.written as u64)
            .map_err(|e| VarastoError::io(&self.path, e))?;
        self.capacity = self.written;
        Ok(())
    }

    fn remove(self) -> Result<()> {
        let Segment { path, file, map, .. } = self;
        drop(map);
        drop(file);
        fs::remove_file(&path).map_err(|e| VarastoError::io(&path, e))
    }
}

/// What recovery found in one segment file
#[derive(Debug, Default)]
struct Scan {
    /// Bytes of intact records from the start of the file
    written: usize,
    /// End of the leading run of shifted records
    consumed: usize,
    /// Records still pending
    records: usize,
    /// Encoded bytes of the pending records
    backlog: usize,
    torn: Option<CodecError>,
}

/// Walk the records of a segment until end of data
///
/// Shifted records only count as shifted while no pending record precedes
/// them, in this segment or an earlier one (`pending_before`). A flag found
/// after a pending record is cleared again, so that record is redelivered.
fn scan_records(data: &mut [u8], pending_before: bool) -> std::result::Result<Scan, CodecError> {
    let mut scan = Scan::default();
    let mut pending = pending_before;
    loop {
        let offset = scan.written;
        let raw = match codec::peek_total_len(&data[offset..]) {
            None | Some(0) => break,
            Some(raw) => raw,
        };
        let shifted = raw & CONSUMED != 0;
        if shifted {
            write_u32(data, offset, raw & !CONSUMED);
        }

        match codec::validate(&data[offset..]) {
            Ok(used) if shifted && !pending => {
                write_u32(data, offset, raw);
                scan.written += used;
                scan.consumed = scan.written;
            }
            Ok(used) => {
                pending = true;
                scan.written += used;
                scan.records += 1;
                scan.backlog += used;
            }
            Err(e) if e.is_truncated() => {
                if shifted {
                    write_u32(data, offset, raw);
                }
                scan.torn = Some(e);
                return Ok(scan);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(scan)
}

/// Segment files of one buffer, oldest first
pub(crate) struct SegmentStore {
    dir: PathBuf,
    segment_size: usize,
    sync_writes: bool,
    segments: VecDeque<Segment>,
    /// Offset of the next unread record in the head segment
    read_offset: usize,
    next_index: u64,
}

/// Result of opening a segment directory
pub(crate) struct Recovered {
    store: SegmentStore,
    backlog: usize,
    records: usize,
}

impl SegmentStore {
    /// Open `dir`, recovering any segments already there
    pub(crate) fn open(dir: &Path, segment_size: usize, sync_writes: bool) -> Result<Recovered> {
        fs::create_dir_all(dir).map_err(|e| VarastoError::io(dir, e))?;

        let mut found = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| VarastoError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| VarastoError::io(dir, e))?;
            let name = entry.file_name();
            match name.to_str().and_then(parse_segment_index) {
                Some(index) => found.push((index, entry.path())),
                None => debug!(file = ?name, "Ignoring non-segment file"),
            }
        }
        found.sort_by_key(|(index, _)| *index);

        let mut segments = VecDeque::with_capacity(found.len());
        let mut backlog = 0;
        let mut records = 0;
        let mut read_offset = 0;
        let last = found.len().saturating_sub(1);

        for (pos, (index, path)) in found.iter().enumerate() {
            let is_last = pos == last;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| VarastoError::io(path, e))?;
            let len = file
                .metadata()
                .map_err(|e| VarastoError::io(path, e))?
                .len() as usize;

            let mut map = if len > 0 {
                Some(map_segment(&file).map_err(|e| VarastoError::io(path, e))?)
            } else {
                None
            };
            let scan = match map.as_mut() {
                Some(map) => scan_records(map, records > 0)?,
                None => Scan::default(),
            };

            if let Some(torn) = scan.torn {
                if !is_last {
                    return Err(torn.into());
                }
                warn!(
                    segment = %path.display(),
                    offset = scan.written,
                    error = %torn,
                    "Dropping torn record at end of buffer"
                );
            }

            if records == 0 {
                read_offset = scan.consumed;
            }
            backlog += scan.backlog;
            records += scan.records;

            if !is_last {
                if scan.records == 0 {
                    drop(map);
                    debug!(segment = %path.display(), "Removing drained segment");
                    drop(file);
                    fs::remove_file(path).map_err(|e| VarastoError::io(path, e))?;
                    continue;
                }
                if let Some(m) = map.take() {
                    m.flush().map_err(|e| VarastoError::io(path, e))?;
                }
                if scan.written < len {
                    file.set_len(scan.written as u64)
                        .map_err(|e| VarastoError::io(path, e))?;
                }
                segments.push_back(Segment {
                    index: *index,
                    path: path.clone(),
                    file,
                    capacity: scan.written,
                    written: scan.written,
                    map: None,
                });
                continue;
            }

            // Tail: clear anything past the last good record, then regrow
            if let Some(m) = map.as_mut() {
                let garbage = &mut m[scan.written..];
                if garbage.iter().any(|b| *b != 0) {
                    garbage.fill(0);
                    m.flush().map_err(|e| VarastoError::io(path, e))?;
                }
            }
            let capacity = len.max(segment_size);
            if capacity > len {
                drop(map.take());
                file.set_len(capacity as u64)
                    .map_err(|e| VarastoError::io(path, e))?;
            }
            let map = match map {
                Some(map) => map,
                None => map_segment(&file).map_err(|e| VarastoError::io(path, e))?,
            };
            let mut tail = Segment {
                index: *index,
                path: path.clone(),
                file,
                capacity,
                written: scan.written,
                map: Some(map),
            };
            if records == 0 {
                tail.reset(sync_writes)?;
                tail.flush()?;
                read_offset = 0;
            }
            segments.push_back(tail);
        }

        let next_index = match segments.back() {
            Some(tail) => tail.index + 1,
            None => {
                segments.push_back(Segment::create(dir, 0, segment_size)?);
                1
            }
        };

        if let Some(m) = Metrics::get() {
            m.set_segments(segments.len());
        }

        Ok(Recovered {
            store: SegmentStore {
                dir: dir.to_path_buf(),
                segment_size,
                sync_writes,
                segments,
                read_offset,
                next_index,
            },
            backlog,
            records,
        })
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(tail) = self.segments.back_mut() {
            tail.seal()?;
        }
        let segment = Segment::create(&self.dir, self.next_index, self.segment_size)?;
        debug!(
            segment = %segment.path.display(),
            segments = self.segments.len() + 1,
            "Rotated to new segment"
        );
        self.next_index += 1;
        self.segments.push_back(segment);
        if let Some(m) = Metrics::get() {
            m.set_segments(self.segments.len());
        }
        Ok(())
    }

    fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl RecordStore for SegmentStore {
    fn append(&mut self, record: &Bytes) -> Result<()> {
        let fits = self
            .segments
            .back()
            .is_some_and(|tail| tail.remaining() >= record.len());
        if !fits {
            self.rotate()?;
        }
        match self.segments.back_mut() {
            Some(tail) => tail.write_record(record, self.sync_writes),
            None => Err(VarastoError::Closed),
        }
    }

    fn front(&mut self) -> Result<Option<Message>> {
        let read_offset = self.read_offset;
        let Some(head) = self.segments.front_mut() else {
            return Ok(None);
        };
        if read_offset >= head.written {
            return Ok(None);
        }
        let written = head.written;
        let map = head.mapping()?;
        let (msg, _) = codec::decode(&map[read_offset..written])?;
        Ok(Some(msg))
    }

    fn pop_front(&mut self) -> Result<usize> {
        let read_offset = self.read_offset;
        let sealed_head = self.segments.len() > 1;
        let head = self
            .segments
            .front_mut()
            .ok_or(VarastoError::NothingToShift)?;
        if read_offset >= head.written {
            return Err(VarastoError::NothingToShift);
        }
        let written = head.written;
        let map = head.mapping()?;
        let size = codec::validate(&map[read_offset..written])?;
        head.mark_consumed(read_offset, size, self.sync_writes)?;

        self.read_offset += size;
        if self.read_offset < written {
            return Ok(size);
        }
        if sealed_head {
            if let Some(drained) = self.segments.pop_front() {
                debug!(segment = %drained.path.display(), "Removing drained segment");
                drained.remove()?;
            }
            if let Some(m) = Metrics::get() {
                m.set_segments(self.segments.len());
            }
        } else {
            head.reset(self.sync_writes)?;
        }
        self.read_offset = 0;
        Ok(size)
    }

    fn close(&mut self) -> Result<()> {
        match self.segments.back() {
            Some(tail) => tail.flush(),
            None => Ok(()),
        }
    }
}

/// Durable FIFO buffer over memory-mapped segment files
///
/// Same waiting semantics as [`MemoryBuffer`](super::MemoryBuffer). Records
/// larger than one segment are rejected with `MessageTooLarge`. Storage
/// failures close the buffer and are returned to the caller that hit them.
pub struct SegmentedBuffer {
    queue: RecordQueue<SegmentStore>,
    path: PathBuf,
}

impl SegmentedBuffer {
    /// Open or create the buffer directory and recover its backlog
    pub fn open(options: SegmentedOptions) -> Result<Self> {
        if options.segment_size < codec::HEADER_LEN {
            return Err(VarastoError::Config(format!(
                "segment size must be at least {} bytes, got {}",
                codec::HEADER_LEN,
                options.segment_size
            )));
        }
        let SegmentedOptions {
            path,
            segment_size,
            limit,
            sync_writes,
        } = options;

        let Recovered {
            store,
            backlog,
            records,
        } = SegmentStore::open(&path, segment_size, sync_writes)?;
        info!(
            path = %path.display(),
            segments = store.segment_count(),
            backlog,
            pending = records,
            "Segmented buffer opened"
        );

        let backlog_limit = limit.unwrap_or(usize::MAX);
        let record_limit = segment_record_limit(segment_size, backlog_limit);
        let queue = RecordQueue::new(store, record_limit, backlog_limit, "mmap")
            .with_backlog(backlog, records);

        Ok(Self { queue, path })
    }

    /// Directory holding the segment files
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Buffer for SegmentedBuffer {
    async fn push_message(&self, msg: Message) -> Result<usize> {
        self.queue.push(&msg).await
    }

    async fn next_message(&self) -> Result<Message> {
        self.queue.next().await
    }

    fn shift_message(&self) -> Result<usize> {
        self.queue.shift()
    }

    fn backlog(&self) -> usize {
        self.queue.backlog()
    }

    fn close(&self) {
        self.queue.close();
    }

    fn close_once_empty(&self) {
        self.queue.close_once_empty();
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    fn strategy_name(&self) -> &'static str {
        "mmap"
    }
}
