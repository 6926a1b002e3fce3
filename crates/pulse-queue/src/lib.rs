//! Jitter buffer for streamed audio: an ordered run of `MemChunk`s addressed
//! by a monotonically advancing byte index, with watermark-driven "how much
//! more do you want" bookkeeping (`missing`/`requested`) and a prebuffering
//! gate that holds playback back until enough data has queued up.
//!
//! The entry list tracks `pa_memblockq`'s doubly-linked list of chunks, but
//! as a `VecDeque<Entry>` kept sorted by `index`: insertion walks backward
//! from the tail the same way the original does, merging, truncating or
//! splitting overlapping entries as it goes.

pub mod error;

use std::collections::VecDeque;

pub use error::MemBlockQError;
pub use pulse_mem::MemChunk;
use pulse_mem::MemBlock;

/// How a `seek` interprets its offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekMode {
    Relative,
    Absolute,
    RelativeOnRead,
    RelativeEnd,
}

/// The result of `peek`.
#[derive(Debug)]
pub enum PeekResult {
    /// Prebuffering: the caller should wait before reading.
    NotReady,
    /// The queue is empty and no silence block is configured.
    NoData,
    /// A hole of `length` bytes precedes the next real data, and no
    /// silence block is configured to paper over it.
    Gap(usize),
    /// Real or silence-substituted data ready to read.
    Chunk(MemChunk),
}

struct Entry {
    /// Byte offset of this entry's first byte in the queue's index space.
    index: i64,
    chunk: MemChunk,
}

/// An ordered, gap-tolerant run of audio chunks addressed by byte index.
pub struct MemBlockQ {
    entries: VecDeque<Entry>,
    read_index: i64,
    write_index: i64,

    base: usize,
    maxlength: usize,
    tlength: usize,
    prebuf: usize,
    minreq: usize,

    in_prebuf: bool,
    missing: i64,
    requested: usize,

    silence: Option<MemBlock>,
    mcalign_pending: Vec<u8>,
}

impl MemBlockQ {
    /// Mirrors `pa_memblockq_new`'s defaulting and rounding: `maxlength` and
    /// `tlength` round up to `base`; `tlength` falls back to `maxlength`
    /// when zero or oversized; `prebuf` defaults to half of `tlength` and is
    /// clamped into `[0, maxlength]`; `minreq` rounds down to `base` and is
    /// clamped into `[base, tlength - prebuf]`.
    pub fn new(base: usize, maxlength: usize, tlength: usize, prebuf: i64, minreq: usize) -> Self {
        let base = base.max(1);
        let round_up = |v: usize| -> usize { ((v + base - 1) / base) * base };
        let round_down = |v: usize| -> usize { (v / base) * base };

        let maxlength = round_up(maxlength).max(base);

        let mut tlength = round_up(tlength);
        if tlength == 0 || tlength > maxlength {
            tlength = maxlength;
        }

        let mut prebuf = if prebuf < 0 { (tlength / 2) as i64 } else { prebuf };
        let mut prebuf = round_up(prebuf.max(0) as usize);
        if prebuf > maxlength {
            prebuf = maxlength;
        }

        let mut minreq = round_down(minreq);
        let minreq_ceiling = tlength.saturating_sub(prebuf);
        if minreq > minreq_ceiling {
            minreq = minreq_ceiling;
        }
        if minreq < base {
            minreq = base;
        }

        Self {
            entries: VecDeque::new(),
            read_index: 0,
            write_index: 0,
            base,
            maxlength,
            tlength,
            prebuf,
            minreq,
            in_prebuf: prebuf > 0,
            missing: tlength as i64,
            requested: 0,
            silence: None,
            mcalign_pending: Vec::new(),
        }
    }

    pub fn set_silence(&mut self, block: Option<MemBlock>) {
        self.silence = block;
    }

    fn get_length(&self) -> usize {
        if self.write_index <= self.read_index {
            0
        } else {
            (self.write_index - self.read_index) as usize
        }
    }

    fn can_push(&self, length: usize) -> bool {
        let mut length = length as i64;
        if self.read_index > self.write_index {
            let d = self.read_index - self.write_index;
            if length > d {
                length -= d;
            } else {
                return true;
            }
        }
        let end = self
            .entries
            .back()
            .map(|e| e.index + e.chunk.length as i64)
            .unwrap_or(self.write_index);
        if self.write_index + length > end && self.write_index + length - self.read_index > self.maxlength as i64 {
            return false;
        }
        true
    }

    fn finish_push_ge(&mut self, old: i64) {
        let mut delta = self.write_index - old;
        if delta >= self.requested as i64 {
            delta -= self.requested as i64;
            self.requested = 0;
        } else {
            self.requested -= delta as usize;
            delta = 0;
        }
        self.missing -= delta;
    }

    /// Splices `chunk` into the queue at the current write index, merging,
    /// truncating or splitting any entries it overlaps, then advances
    /// `write_index` and settles the `missing`/`requested` watermarks.
    pub fn push(&mut self, chunk: MemChunk) -> Result<(), MemBlockQError> {
        if chunk.length % self.base != 0 {
            return Err(MemBlockQError::Misaligned);
        }
        if chunk.length == 0 {
            return Ok(());
        }
        if !self.can_push(chunk.length) {
            return Err(MemBlockQError::QueueFull);
        }

        let old = self.write_index;
        let mut chunk = chunk;

        if self.read_index > self.write_index {
            let d = (self.read_index - self.write_index) as usize;
            if chunk.length > d {
                chunk.index += d;
                chunk.length -= d;
                self.write_index += d as i64;
            } else {
                self.write_index += chunk.length as i64;
                self.finish_push_ge(old);
                return Ok(());
            }
        }

        let mut q_pos = if self.entries.is_empty() { None } else { Some(self.entries.len() - 1) };
        let mut stop = false;

        while let (Some(pos), false) = (q_pos, stop) {
            let entry_index = self.entries[pos].index;
            let entry_len = self.entries[pos].chunk.length as i64;
            let write_end = self.write_index + chunk.length as i64;

            if self.write_index >= entry_index + entry_len {
                // Insertion point is right after this entry.
                stop = true;
            } else if write_end <= entry_index {
                // Entirely before this entry: keep walking backward.
                q_pos = if pos == 0 { None } else { Some(pos - 1) };
            } else if self.write_index <= entry_index && write_end >= entry_index + entry_len {
                // New chunk fully covers this entry: drop it.
                self.entries.remove(pos);
                q_pos = if pos == 0 { None } else { Some(pos - 1) };
            } else if self.write_index >= entry_index {
                // Overlaps the tail of this entry, and maybe more: truncate
                // (and split off a surviving remainder if anything pokes
                // out past the new chunk's end).
                if write_end < entry_index + entry_len {
                    let d = (write_end - entry_index) as usize;
                    let orig = &self.entries[pos].chunk;
                    let remainder = MemChunk::new(orig.block.clone(), orig.index + d, orig.length - d);
                    self.entries.insert(pos + 1, Entry { index: entry_index + d as i64, chunk: remainder });
                }
                let new_len = (self.write_index - entry_index) as usize;
                if new_len == 0 {
                    self.entries.remove(pos);
                    q_pos = if pos == 0 { None } else { Some(pos - 1) };
                } else {
                    self.entries[pos].chunk.length = new_len;
                    q_pos = Some(pos);
                }
                stop = true;
            } else {
                // Overlaps the head of this entry: drop its leading bytes.
                let d = (write_end - entry_index) as usize;
                let e = &mut self.entries[pos];
                e.index += d as i64;
                e.chunk.index += d;
                e.chunk.length -= d;
                q_pos = if pos == 0 { None } else { Some(pos - 1) };
            }
        }

        let mut inserted = false;
        if let Some(pos) = q_pos {
            let mergeable = {
                let e = &self.entries[pos];
                MemBlock::ptr_eq(&e.chunk.block, &chunk.block)
                    && e.chunk.index + e.chunk.length == chunk.index
                    && self.write_index == e.index + e.chunk.length as i64
            };
            if mergeable {
                self.entries[pos].chunk.length += chunk.length;
                self.write_index += chunk.length as i64;
                inserted = true;
            }
        }

        if !inserted {
            let insert_pos = match q_pos {
                Some(pos) => pos + 1,
                None => 0,
            };
            let entry = Entry { index: self.write_index, chunk: chunk.clone() };
            self.write_index += chunk.length as i64;
            self.entries.insert(insert_pos, entry);
        }

        self.finish_push_ge(old);
        Ok(())
    }

    /// `push`, but routed through a byte-alignment accumulator first: bytes
    /// are buffered until a whole `base`-sized piece is available, with at
    /// most one partial remainder held across calls.
    pub fn push_align(&mut self, chunk: MemChunk) -> Result<(), MemBlockQError> {
        if self.base == 1 {
            return self.push(chunk);
        }

        let mut buf = std::mem::take(&mut self.mcalign_pending);
        buf.extend_from_slice(&chunk.as_slice());

        let mut offset = 0;
        while offset + self.base <= buf.len() {
            let piece = buf[offset..offset + self.base].to_vec();
            let block = MemBlock::from_bytes(piece);
            self.push(MemChunk::new(block, 0, self.base))?;
            offset += self.base;
        }

        self.mcalign_pending = buf.split_off(offset);
        Ok(())
    }

    /// Toggles `in_prebuf` off once enough data has queued up to cross the
    /// prebuf watermark; returns whether the queue is still prebuffering.
    fn check_prebuf(&mut self) -> bool {
        if self.in_prebuf {
            if self.get_length() < self.prebuf {
                return true;
            }
            self.in_prebuf = false;
            false
        } else {
            if self.prebuf > 0 && self.read_index >= self.write_index {
                self.in_prebuf = true;
                return true;
            }
            false
        }
    }

    /// Looks at the next readable chunk without consuming it. While
    /// prebuffering returns `NotReady`; over a gap with no silence block
    /// configured returns the gap's length so the caller can decide how to
    /// wait it out.
    pub fn peek(&mut self) -> PeekResult {
        if self.check_prebuf() {
            return PeekResult::NotReady;
        }

        match self.entries.front() {
            None => match &self.silence {
                Some(silence) => PeekResult::Chunk(MemChunk::new(silence.clone(), 0, silence.length())),
                None => PeekResult::NoData,
            },
            Some(head) if head.index > self.read_index => {
                let gap = (head.index - self.read_index) as usize;
                match &self.silence {
                    Some(silence) => {
                        let len = if gap == 0 || gap > silence.length() { silence.length() } else { gap };
                        PeekResult::Chunk(MemChunk::new(silence.clone(), 0, len))
                    }
                    None => PeekResult::Gap(gap),
                }
            }
            Some(head) => PeekResult::Chunk(head.chunk.clone()),
        }
    }

    /// Consumes `length` bytes from the front of the queue, discarding any
    /// leading gap along the way and crediting the same amount to `missing`.
    pub fn drop(&mut self, mut length: usize) {
        let old = self.read_index;

        while length > 0 {
            if self.check_prebuf() {
                break;
            }

            let Some(front) = self.entries.front() else {
                self.read_index += length as i64;
                break;
            };

            let gap = (front.index - self.read_index).max(0) as usize;
            if gap >= length {
                self.read_index += length as i64;
                break;
            }
            length -= gap;
            self.read_index += gap as i64;

            let front_len = self.entries.front().unwrap().chunk.length;
            if front_len <= length {
                length -= front_len;
                self.read_index += front_len as i64;
                self.entries.pop_front();
            } else {
                let front = self.entries.front_mut().unwrap();
                front.chunk.index += length;
                front.chunk.length -= length;
                front.index += length as i64;
                self.read_index += length as i64;
                break;
            }
        }

        let delta = self.read_index - old;
        self.missing += delta;
    }

    /// Repositions `write_index` per `mode`, then settles `missing`/
    /// `requested` against however far it moved.
    pub fn seek(&mut self, offset: i64, mode: SeekMode) {
        let old = self.write_index;
        self.write_index = match mode {
            SeekMode::Relative => self.write_index + offset,
            SeekMode::Absolute => offset,
            SeekMode::RelativeOnRead => self.read_index + offset,
            SeekMode::RelativeEnd => {
                let end = self
                    .entries
                    .back()
                    .map(|e| e.index + e.chunk.length as i64)
                    .unwrap_or(self.read_index);
                end + offset
            }
        };

        let mut delta = self.write_index - old;
        if delta >= self.requested as i64 {
            delta -= self.requested as i64;
            self.requested = 0;
        } else if delta >= 0 {
            self.requested -= delta as usize;
            delta = 0;
        }
        self.missing -= delta;
    }

    /// Drops every queued entry and resets `write_index` to `read_index`,
    /// re-arming prebuffering. Note the strict `>` below, unlike `seek`'s
    /// `>=` — `flush` only eats into `requested` for a strictly larger jump.
    pub fn flush(&mut self) {
        self.entries.clear();
        let old = self.write_index;
        self.write_index = self.read_index;
        self.prebuf_force();

        let mut delta = self.write_index - old;
        if delta > self.requested as i64 {
            delta -= self.requested as i64;
            self.requested = 0;
        } else if delta >= 0 {
            self.requested -= delta as usize;
            delta = 0;
        }
        self.missing -= delta;
    }

    /// How many bytes below `tlength` the queue currently sits, or 0 if
    /// that shortfall hasn't yet crossed `minreq`.
    pub fn missing(&self) -> usize {
        let length = self.get_length();
        if length >= self.tlength {
            return 0;
        }
        let l = self.tlength - length;
        if l >= self.minreq {
            l
        } else {
            0
        }
    }

    /// Drains the accumulated `missing` counter into `requested` and
    /// returns the amount a caller should now go fetch.
    pub fn pop_missing(&mut self) -> usize {
        if self.missing <= 0 {
            return 0;
        }
        let l = self.missing as usize;
        self.missing = 0;
        self.requested += l;
        l
    }

    /// Truncates the queue to at most `length` readable bytes by dropping
    /// from the front.
    pub fn shorten(&mut self, length: usize) {
        let current = self.get_length();
        if current > length {
            self.drop(current - length);
        }
    }

    pub fn is_readable(&mut self) -> bool {
        !self.check_prebuf() && self.get_length() > 0
    }

    pub fn prebuf_disable(&mut self) {
        self.in_prebuf = false;
    }

    pub fn prebuf_force(&mut self) {
        if !self.in_prebuf && self.prebuf > 0 {
            self.in_prebuf = true;
        }
    }

    pub fn get_read_index(&self) -> i64 {
        self.read_index
    }

    pub fn get_write_index(&self) -> i64 {
        self.write_index
    }

    pub fn get_maxlength(&self) -> usize {
        self.maxlength
    }

    pub fn get_tlength(&self) -> usize {
        self.tlength
    }

    pub fn get_prebuf(&self) -> usize {
        self.prebuf
    }

    pub fn get_minreq(&self) -> usize {
        self.minreq
    }

    pub fn set_maxlength(&mut self, maxlength: usize) {
        self.maxlength = ((maxlength.max(self.base) + self.base - 1) / self.base) * self.base;
        if self.tlength > self.maxlength {
            self.tlength = self.maxlength;
        }
        if self.prebuf > self.maxlength {
            self.prebuf = self.maxlength;
        }
    }

    pub fn set_tlength(&mut self, tlength: usize) {
        let mut tlength = ((tlength + self.base - 1) / self.base) * self.base;
        if tlength == 0 || tlength > self.maxlength {
            tlength = self.maxlength;
        }
        self.tlength = tlength;
        if self.minreq > self.tlength.saturating_sub(self.prebuf) {
            self.minreq = self.tlength.saturating_sub(self.prebuf);
        }
    }

    pub fn set_prebuf(&mut self, prebuf: usize) {
        let mut prebuf = ((prebuf + self.base - 1) / self.base) * self.base;
        if prebuf > self.maxlength {
            prebuf = self.maxlength;
        }
        self.prebuf = prebuf;
        self.in_prebuf = self.prebuf > 0;
    }

    pub fn set_minreq(&mut self, minreq: usize) {
        let mut minreq = (minreq / self.base) * self.base;
        let ceiling = self.tlength.saturating_sub(self.prebuf);
        if minreq > ceiling {
            minreq = ceiling;
        }
        if minreq < self.base {
            minreq = self.base;
        }
        self.minreq = minreq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_mem::MemBlock;

    fn chunk(bytes: &[u8]) -> MemChunk {
        MemChunk::new(MemBlock::from_bytes(bytes.to_vec()), 0, bytes.len())
    }

    #[test]
    fn rounds_and_defaults_construction_parameters() {
        let bq = MemBlockQ::new(4, 10, 0, -1, 3);
        assert_eq!(bq.get_maxlength(), 12);
        assert_eq!(bq.get_tlength(), 12);
        assert_eq!(bq.get_prebuf(), 8);
        assert_eq!(bq.get_minreq(), 4);
    }

    #[test]
    fn push_then_peek_returns_pushed_bytes() {
        let mut bq = MemBlockQ::new(1, 1024, 0, 0, 1);
        bq.push(chunk(b"hello")).unwrap();
        match bq.peek() {
            PeekResult::Chunk(c) => assert_eq!(c.as_slice(), b"hello"),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn drop_advances_read_index_and_consumes_entry() {
        let mut bq = MemBlockQ::new(1, 1024, 0, 0, 1);
        bq.push(chunk(b"hello world")).unwrap();
        bq.drop(6);
        assert_eq!(bq.get_read_index(), 6);
        match bq.peek() {
            PeekResult::Chunk(c) => assert_eq!(c.as_slice(), b"world"),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_push_overwrites_tail_of_prior_entry() {
        let mut bq = MemBlockQ::new(1, 1024, 0, 0, 1);
        bq.push(chunk(b"aaaaaaaaaa")).unwrap();
        bq.seek(5, SeekMode::Absolute);
        bq.push(chunk(b"bbbbb")).unwrap();
        match bq.peek() {
            PeekResult::Chunk(c) => assert_eq!(c.as_slice(), b"aaaaabbbbb"),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn gap_with_no_silence_is_reported_and_filled_once_data_arrives() {
        let mut bq = MemBlockQ::new(1, 1024, 0, 0, 1);
        bq.seek(4, SeekMode::Absolute);
        bq.push(chunk(b"data")).unwrap();
        match bq.peek() {
            PeekResult::Gap(n) => assert_eq!(n, 4),
            other => panic!("expected gap, got {other:?}"),
        }
    }

    #[test]
    fn prebuf_holds_back_until_watermark_then_opens() {
        let mut bq = MemBlockQ::new(1, 1024, 0, 4, 1);
        bq.push(chunk(b"ab")).unwrap();
        assert!(matches!(bq.peek(), PeekResult::NotReady));
        bq.push(chunk(b"cd")).unwrap();
        match bq.peek() {
            PeekResult::Chunk(c) => assert_eq!(c.as_slice(), b"abcd"),
            other => panic!("expected chunk once prebuf threshold is met, got {other:?}"),
        }
    }

    #[test]
    fn underrun_to_empty_rearms_prebuf() {
        let mut bq = MemBlockQ::new(1, 1024, 0, 4, 1);
        bq.push(chunk(b"abcd")).unwrap();
        assert!(matches!(bq.peek(), PeekResult::Chunk(_)));
        bq.drop(4);
        assert!(matches!(bq.peek(), PeekResult::NotReady));
    }

    #[test]
    fn missing_reports_shortfall_only_once_it_clears_minreq() {
        let mut bq = MemBlockQ::new(1, 1024, 100, 0, 20);
        assert_eq!(bq.missing(), 100);
        bq.push(chunk(&[0u8; 90])).unwrap();
        assert_eq!(bq.missing(), 0);
    }

    #[test]
    fn pop_missing_drains_into_requested() {
        let mut bq = MemBlockQ::new(1, 1024, 50, 0, 1);
        assert_eq!(bq.pop_missing(), 50);
        assert_eq!(bq.pop_missing(), 0);
    }

    #[test]
    fn flush_resets_write_index_to_read_index() {
        let mut bq = MemBlockQ::new(1, 1024, 0, 0, 1);
        bq.push(chunk(b"hello")).unwrap();
        bq.flush();
        assert_eq!(bq.get_write_index(), bq.get_read_index());
        assert!(matches!(bq.peek(), PeekResult::NoData));
    }

    #[test]
    fn push_align_buffers_partial_frames_across_calls() {
        let mut bq = MemBlockQ::new(4, 1024, 0, 0, 1);
        bq.push_align(chunk(&[1, 2, 3])).unwrap();
        assert!(matches!(bq.peek(), PeekResult::NoData));
        bq.push_align(chunk(&[4, 5, 6, 7, 8])).unwrap();
        match bq.peek() {
            PeekResult::Chunk(c) => assert_eq!(c.as_slice(), &[1, 2, 3, 4]),
            other => panic!("expected aligned chunk, got {other:?}"),
        }
    }

    #[test]
    fn misaligned_push_is_rejected() {
        let mut bq = MemBlockQ::new(4, 1024, 0, 0, 1);
        assert!(matches!(bq.push(chunk(&[1, 2, 3])), Err(MemBlockQError::Misaligned)));
    }
}
