//! Buffers and the per-file ordered buffer list.
//!
//! A file inode owns a sorted, non-overlapping set of buffers covering its
//! logical extent, with holes represented explicitly as `Zero` ranges. The
//! list enforces the state lattice: `Flushing` data is never mutated in
//! place; an overlapping write splits the flushing range out and supersedes
//! it with a fresh `Dirty` buffer carrying a higher generation, so the flush
//! acknowledgement for the old generation cannot clobber newer bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::spill::SpillHandle;

/// Lifecycle state of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Matches the remote object; droppable under memory pressure.
    Clean,
    /// Locally modified, not yet flushed.
    Dirty,
    /// Snapshot taken by an in-flight flush; immutable.
    Flushing,
    /// Dirty and handed to the flusher under eviction pressure.
    Queued,
    /// A hole; reads as zeros, occupies no memory.
    Zero,
}

/// Where a buffer's bytes live.
#[derive(Debug, Clone)]
pub enum BufferData {
    /// Resident in memory.
    Memory(Vec<u8>),
    /// Spilled to a local file; `offset` is the position inside the file.
    Spilled {
        /// Shared spill file.
        handle: Arc<SpillHandle>,
        /// Byte offset of this buffer's data within the file.
        offset: u64,
    },
    /// No bytes held (evicted `Clean` range or a `Zero` hole).
    Absent,
}

/// A contiguous byte range attached to a file inode.
#[derive(Debug, Clone)]
pub struct Buffer {
    /// Start offset within the file.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
    /// Lifecycle state.
    pub state: BufferState,
    /// Backing bytes.
    pub data: BufferData,
    /// Bumped on every mutation; stale flush acks are rejected against it.
    pub generation: u64,
    /// Part index while this buffer flushes through a multipart upload.
    pub part_id: Option<u32>,
}

impl Buffer {
    /// End offset (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Bytes of memory the buffer pins.
    pub fn resident_bytes(&self) -> u64 {
        match self.data {
            BufferData::Memory(_) => self.len,
            _ => 0,
        }
    }

    /// Whether the buffer counts toward the dirty set.
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, BufferState::Dirty | BufferState::Queued)
    }

    /// Reads the buffer's bytes in `[from, from+len)` relative to the file.
    fn read_slice(&self, from: u64, len: u64) -> Result<Vec<u8>> {
        debug_assert!(from >= self.offset && from + len <= self.end());
        let rel = from - self.offset;
        match &self.data {
            BufferData::Memory(bytes) => {
                Ok(bytes[rel as usize..(rel + len) as usize].to_vec())
            }
            BufferData::Spilled { handle, offset } => handle.read_range(offset + rel, len),
            BufferData::Absent => Ok(vec![0u8; len as usize]),
        }
    }

    /// Splits off the prefix `[offset, at)`, leaving `self` as `[at, end)`.
    fn split_front(&mut self, at: u64) -> Buffer {
        debug_assert!(at > self.offset && at < self.end());
        let head_len = at - self.offset;
        let head_data = match &mut self.data {
            BufferData::Memory(bytes) => {
                let tail = bytes.split_off(head_len as usize);
                let head = std::mem::replace(bytes, tail);
                BufferData::Memory(head)
            }
            BufferData::Spilled { handle, offset } => {
                let head = BufferData::Spilled {
                    handle: Arc::clone(handle),
                    offset: *offset,
                };
                *offset += head_len;
                head
            }
            BufferData::Absent => BufferData::Absent,
        };
        let head = Buffer {
            offset: self.offset,
            len: head_len,
            state: self.state,
            data: head_data,
            generation: self.generation,
            part_id: self.part_id,
        };
        self.offset = at;
        self.len -= head_len;
        head
    }
}

/// One segment of a read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSegment {
    /// Bytes served from a buffer.
    Data {
        /// File offset of the segment.
        offset: u64,
        /// The bytes.
        bytes: Vec<u8>,
    },
    /// A hole; reads as zeros.
    Zero {
        /// File offset of the segment.
        offset: u64,
        /// Length in bytes.
        len: u64,
    },
    /// Not cached locally; must be fetched from the backend.
    Missing {
        /// File offset of the segment.
        offset: u64,
        /// Length in bytes.
        len: u64,
    },
}

/// Ordered, non-overlapping buffer set for one file.
#[derive(Debug, Default)]
pub struct BufferList {
    buffers: BTreeMap<u64, Buffer>,
    next_generation: u64,
}

impl BufferList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Current highest generation handed out.
    pub fn generation(&self) -> u64 {
        self.next_generation
    }

    /// Iterates buffers in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.values()
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total bytes in `Dirty`/`Queued` buffers.
    pub fn dirty_bytes(&self) -> u64 {
        self.buffers
            .values()
            .filter(|b| b.is_dirty())
            .map(|b| b.len)
            .sum()
    }

    /// Total resident memory pinned by the list.
    pub fn resident_bytes(&self) -> u64 {
        self.buffers.values().map(|b| b.resident_bytes()).sum()
    }

    /// Total bytes in `Flushing` buffers.
    pub fn flushing_bytes(&self) -> u64 {
        self.buffers
            .values()
            .filter(|b| b.state == BufferState::Flushing)
            .map(|b| b.len)
            .sum()
    }

    /// Dirty, queued and flushing bytes together: what the pool accounts
    /// against the write watermark.
    pub fn accountable_bytes(&self) -> u64 {
        self.dirty_bytes() + self.flushing_bytes()
    }

    /// Offsets and lengths of clean resident buffers, for LRU tracking.
    pub fn clean_resident(&self) -> Vec<(u64, u64)> {
        self.buffers
            .values()
            .filter(|b| b.state == BufferState::Clean && matches!(b.data, BufferData::Memory(_)))
            .map(|b| (b.offset, b.len))
            .collect()
    }

    /// Whether any buffer is mid-flush.
    pub fn has_flushing(&self) -> bool {
        self.buffers
            .values()
            .any(|b| b.state == BufferState::Flushing)
    }

    /// Whether any buffer still needs flushing.
    pub fn has_dirty(&self) -> bool {
        self.buffers.values().any(|b| b.is_dirty())
    }

    fn overlapping_keys(&self, start: u64, end: u64) -> Vec<u64> {
        let mut keys: Vec<u64> = Vec::new();
        // a buffer starting before `start` may still reach into the range
        if let Some((&k, b)) = self.buffers.range(..start).next_back() {
            if b.end() > start {
                keys.push(k);
            }
        }
        keys.extend(self.buffers.range(start..end).map(|(&k, _)| k));
        keys
    }

    /// Carves `[start, end)` out of the list, splitting straddling buffers.
    fn carve(&mut self, start: u64, end: u64) {
        for key in self.overlapping_keys(start, end) {
            let mut buf = self.buffers.remove(&key).expect("key just listed");
            if buf.offset < start {
                let head = buf.split_front(start);
                self.buffers.insert(head.offset, head);
            }
            if buf.end() > end {
                let mut tail = buf;
                let head = tail.split_front(end);
                // head is the carved-out middle; keep only the tail
                drop(head);
                self.buffers.insert(tail.offset, tail);
            }
            // remaining middle portion is dropped
        }
    }

    /// Applies a write, returning the generation assigned to the new data.
    ///
    /// Overlapped `Flushing` ranges are superseded (their fragments keep the
    /// old generation so the in-flight ack can still settle them); adjacent
    /// same-state `Dirty` neighbours are coalesced up to `max_buffer`.
    pub fn write(&mut self, offset: u64, data: &[u8], max_buffer: u64) -> u64 {
        let generation = self.bump_generation();
        if data.is_empty() {
            return generation;
        }
        let end = offset + data.len() as u64;
        self.carve(offset, end);

        let mut new_offset = offset;
        let mut new_data = data.to_vec();

        // coalesce with the dirty neighbour on the left
        if let Some((&k, left)) = self.buffers.range(..new_offset).next_back() {
            let mergeable = left.end() == new_offset
                && left.state == BufferState::Dirty
                && matches!(left.data, BufferData::Memory(_))
                && left.len + new_data.len() as u64 <= max_buffer;
            if mergeable {
                let left = self.buffers.remove(&k).expect("left neighbour");
                if let BufferData::Memory(mut bytes) = left.data {
                    new_offset = left.offset;
                    bytes.extend_from_slice(&new_data);
                    new_data = bytes;
                }
            }
        }

        // coalesce with the dirty neighbour on the right
        let new_end = new_offset + new_data.len() as u64;
        if let Some(right) = self.buffers.get(&new_end) {
            let mergeable = right.state == BufferState::Dirty
                && matches!(right.data, BufferData::Memory(_))
                && right.len + new_data.len() as u64 <= max_buffer;
            if mergeable {
                let right = self.buffers.remove(&new_end).expect("right neighbour");
                if let BufferData::Memory(bytes) = right.data {
                    new_data.extend_from_slice(&bytes);
                }
            }
        }

        // a single dirty buffer never exceeds the part size
        let mut cursor = new_offset;
        for chunk in new_data.chunks(max_buffer.max(1) as usize) {
            self.buffers.insert(
                cursor,
                Buffer {
                    offset: cursor,
                    len: chunk.len() as u64,
                    state: BufferState::Dirty,
                    data: BufferData::Memory(chunk.to_vec()),
                    generation,
                    part_id: None,
                },
            );
            cursor += chunk.len() as u64;
        }
        generation
    }

    /// Inserts a `Zero` hole for `[start, end)` where nothing is cached.
    ///
    /// Existing buffers in the range are kept; only gaps become holes.
    pub fn zero_fill(&mut self, start: u64, end: u64) {
        let generation = self.bump_generation();
        let mut cursor = start;
        let covered: Vec<(u64, u64)> = self
            .overlapping_keys(start, end)
            .iter()
            .map(|k| {
                let b = &self.buffers[k];
                (b.offset, b.end())
            })
            .collect();
        for (b_start, b_end) in covered {
            if b_start > cursor {
                self.insert_zero(cursor, b_start.min(end), generation);
            }
            cursor = cursor.max(b_end);
        }
        if cursor < end {
            self.insert_zero(cursor, end, generation);
        }
    }

    fn insert_zero(&mut self, start: u64, end: u64, generation: u64) {
        self.buffers.insert(
            start,
            Buffer {
                offset: start,
                len: end - start,
                state: BufferState::Zero,
                data: BufferData::Absent,
                generation,
                part_id: None,
            },
        );
    }

    /// Installs remotely fetched bytes as `Clean` buffers.
    ///
    /// Only gaps are filled; newer local data (dirty or already-installed)
    /// is never overwritten by a stale fetch.
    pub fn install_clean(&mut self, offset: u64, data: &[u8]) {
        let generation = self.bump_generation();
        let end = offset + data.len() as u64;
        let mut cursor = offset;
        let covered: Vec<(u64, u64)> = self
            .overlapping_keys(offset, end)
            .iter()
            .map(|k| {
                let b = &self.buffers[k];
                (b.offset, b.end())
            })
            .collect();
        let mut gaps = Vec::new();
        for (b_start, b_end) in covered {
            if b_start > cursor {
                gaps.push((cursor, b_start.min(end)));
            }
            cursor = cursor.max(b_end);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        for (g_start, g_end) in gaps {
            let rel = (g_start - offset) as usize;
            let bytes = data[rel..rel + (g_end - g_start) as usize].to_vec();
            self.buffers.insert(
                g_start,
                Buffer {
                    offset: g_start,
                    len: bytes.len() as u64,
                    state: BufferState::Clean,
                    data: BufferData::Memory(bytes),
                    generation,
                    part_id: None,
                },
            );
        }
    }

    /// Reads `[offset, offset+len)` clipped to `size`, as ordered segments.
    pub fn read(&self, offset: u64, len: u64, size: u64) -> Result<Vec<ReadSegment>> {
        let end = (offset + len).min(size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        let mut cursor = offset;
        for key in self.overlapping_keys(offset, end) {
            let buf = &self.buffers[&key];
            let b_start = buf.offset.max(offset);
            if b_start > cursor {
                segments.push(ReadSegment::Missing {
                    offset: cursor,
                    len: b_start - cursor,
                });
                cursor = b_start;
            }
            let b_end = buf.end().min(end);
            let seg_len = b_end - cursor;
            match (&buf.state, &buf.data) {
                (BufferState::Zero, _) => segments.push(ReadSegment::Zero {
                    offset: cursor,
                    len: seg_len,
                }),
                (BufferState::Clean, BufferData::Absent) => {
                    // evicted range: declaration only, data must be re-fetched
                    segments.push(ReadSegment::Missing {
                        offset: cursor,
                        len: seg_len,
                    })
                }
                _ => segments.push(ReadSegment::Data {
                    offset: cursor,
                    bytes: buf.read_slice(cursor, seg_len)?,
                }),
            }
            cursor = b_end;
        }
        if cursor < end {
            segments.push(ReadSegment::Missing {
                offset: cursor,
                len: end - cursor,
            });
        }
        Ok(segments)
    }

    /// Ranges within `[offset, offset+len)` (clipped to `size`) that need a
    /// backend fetch before a read can complete.
    pub fn missing_ranges(&self, offset: u64, len: u64, size: u64) -> Vec<(u64, u64)> {
        match self.read(offset, len, size) {
            Ok(segments) => segments
                .into_iter()
                .filter_map(|s| match s {
                    ReadSegment::Missing { offset, len } => Some((offset, len)),
                    _ => None,
                })
                .collect(),
            Err(_) => vec![(offset, len.min(size.saturating_sub(offset)))],
        }
    }

    /// Assembles the full body `[0, size)`; `None` if any range is missing.
    pub fn assemble(&self, size: u64) -> Result<Option<Vec<u8>>> {
        let segments = self.read(0, size, size)?;
        let mut body = Vec::with_capacity(size as usize);
        for segment in segments {
            match segment {
                ReadSegment::Data { bytes, .. } => body.extend_from_slice(&bytes),
                ReadSegment::Zero { len, .. } => body.extend(std::iter::repeat(0u8).take(len as usize)),
                ReadSegment::Missing { .. } => return Ok(None),
            }
        }
        Ok(Some(body))
    }

    /// Truncates or extends the covered extent to `new_size`.
    ///
    /// Growth materialises the gap as a `Zero` hole so the extent invariant
    /// keeps holding.
    pub fn truncate(&mut self, old_size: u64, new_size: u64) {
        if new_size < old_size {
            self.carve(new_size, old_size);
        } else if new_size > old_size {
            self.zero_fill(old_size, new_size);
        }
    }

    /// Marks every `Dirty` buffer `Queued`, handing it to the flusher.
    pub fn queue_dirty(&mut self) -> u64 {
        let mut queued = 0;
        for buf in self.buffers.values_mut() {
            if buf.state == BufferState::Dirty {
                buf.state = BufferState::Queued;
                queued += buf.len;
            }
        }
        queued
    }

    /// Begins a flush: `Dirty`/`Queued` become `Flushing`.
    ///
    /// Returns the generation fence; any write after this call gets a higher
    /// generation, so [`end_flush`](Self::end_flush) can tell stale acks
    /// from current ones.
    pub fn begin_flush(&mut self) -> u64 {
        let fence = self.next_generation;
        for buf in self.buffers.values_mut() {
            if buf.is_dirty() {
                buf.state = BufferState::Flushing;
            }
        }
        fence
    }

    /// Settles a flush against the generation fence from `begin_flush`.
    ///
    /// On success, `Flushing` buffers at or below the fence become `Clean`;
    /// on failure they return to `Dirty`. Buffers written after the fence
    /// are untouched either way.
    pub fn end_flush(&mut self, fence: u64, success: bool) {
        for buf in self.buffers.values_mut() {
            if buf.state == BufferState::Flushing && buf.generation <= fence {
                buf.state = if success {
                    BufferState::Clean
                } else {
                    BufferState::Dirty
                };
                buf.part_id = None;
            }
        }
    }

    /// Records the multipart part a flushing range was assigned to.
    pub fn assign_part(&mut self, offset: u64, part_id: u32) {
        if let Some(buf) = self.buffers.get_mut(&offset) {
            if buf.state == BufferState::Flushing {
                buf.part_id = Some(part_id);
            }
        }
    }

    /// Drops the bytes of the `Clean` buffer at `offset`, keeping its range.
    ///
    /// Returns the bytes freed, or 0 when the buffer is absent or not clean.
    pub fn evict_clean(&mut self, offset: u64) -> u64 {
        match self.buffers.get_mut(&offset) {
            Some(buf)
                if buf.state == BufferState::Clean
                    && matches!(buf.data, BufferData::Memory(_)) =>
            {
                let freed = buf.len;
                buf.data = BufferData::Absent;
                freed
            }
            _ => 0,
        }
    }

    /// Moves a `Queued` buffer's bytes into a spill file reference.
    pub fn spill_queued(&mut self, offset: u64, handle: Arc<SpillHandle>) -> u64 {
        match self.buffers.get_mut(&offset) {
            Some(buf)
                if buf.state == BufferState::Queued
                    && matches!(buf.data, BufferData::Memory(_)) =>
            {
                let freed = buf.len;
                buf.data = BufferData::Spilled { handle, offset: 0 };
                freed
            }
            _ => 0,
        }
    }

    /// Offsets of `Queued` buffers still resident in memory, with sizes.
    pub fn queued_resident(&self) -> Vec<(u64, u64)> {
        self.buffers
            .values()
            .filter(|b| b.state == BufferState::Queued && matches!(b.data, BufferData::Memory(_)))
            .map(|b| (b.offset, b.len))
            .collect()
    }

    /// Removes every `Clean` buffer outright, returning the resident bytes
    /// freed. Used when etag revalidation proves the cache stale.
    pub fn invalidate_clean(&mut self) -> u64 {
        let mut freed = 0;
        let clean: Vec<u64> = self
            .buffers
            .values()
            .filter(|b| b.state == BufferState::Clean)
            .map(|b| b.offset)
            .collect();
        for offset in clean {
            if let Some(buf) = self.buffers.remove(&offset) {
                freed += buf.resident_bytes();
            }
        }
        freed
    }

    /// Reserves a fresh generation number (spill file naming).
    pub fn reserve_generation(&mut self) -> u64 {
        self.bump_generation()
    }

    /// Drops every buffer (file deleted or dirty data force-discarded).
    pub fn clear(&mut self) -> u64 {
        let resident = self.resident_bytes();
        self.buffers.clear();
        resident
    }

    /// Checks the structural invariants; `Err` text names the violation.
    pub fn check_invariants(&self, size: u64) -> std::result::Result<(), String> {
        let mut prev_end = 0u64;
        for (key, buf) in &self.buffers {
            if *key != buf.offset {
                return Err(format!("key {} != offset {}", key, buf.offset));
            }
            if buf.len == 0 {
                return Err(format!("zero-length buffer at {}", buf.offset));
            }
            if buf.offset < prev_end {
                return Err(format!(
                    "overlap: buffer at {} begins before {}",
                    buf.offset, prev_end
                ));
            }
            if buf.end() > size {
                return Err(format!(
                    "buffer [{}, {}) exceeds size {}",
                    buf.offset,
                    buf.end(),
                    size
                ));
            }
            prev_end = buf.end();
        }
        Ok(())
    }
}
