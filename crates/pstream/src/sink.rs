//! Wires a `PStream`'s inbound audio frames into a jitter-buffered
//! `MemBlockQ`, the typical consumer arrangement: the reader task hands off
//! chunks as they arrive, a playback loop elsewhere drains the queue at its
//! own pace.

use std::sync::{Arc, Mutex};

use pulse_mem::MemChunk;
use pulse_queue::{MemBlockQ, PeekResult, SeekMode as QueueSeekMode};

use crate::{PStream, SeekMode};

/// A single-channel `MemBlockQ` fed directly from a `PStream`'s
/// `on_memblock` callback.
pub struct QueueSink {
    channel: u32,
    queue: Arc<Mutex<MemBlockQ>>,
}

impl QueueSink {
    /// Registers an `on_memblock` handler on `stream` that pushes every
    /// chunk addressed to `channel` into a freshly built queue, ignoring
    /// chunks for other channels.
    pub fn attach(stream: &PStream, channel: u32, base: usize, maxlength: usize, tlength: usize, prebuf: i64, minreq: usize) -> Self {
        let queue = Arc::new(Mutex::new(MemBlockQ::new(base, maxlength, tlength, prebuf, minreq)));
        let sink_queue = queue.clone();

        stream.on_memblock(move |chunk_channel, offset, seek, chunk: MemChunk| {
            if chunk_channel != channel {
                return;
            }
            let mut q = sink_queue.lock().unwrap();
            q.seek(offset, to_queue_seek(seek));
            if let Err(err) = q.push(chunk) {
                log::warn!("dropping misaligned or overflowing chunk on channel {channel}: {err}");
            }
        });

        Self { channel, queue }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Looks at (without consuming) the next readable chunk, if any.
    pub fn peek(&self) -> PeekResult {
        self.queue.lock().unwrap().peek()
    }

    pub fn drop(&self, length: usize) {
        pulse_queue::MemBlockQ::drop(&mut self.queue.lock().unwrap(), length);
    }

    pub fn queue(&self) -> Arc<Mutex<MemBlockQ>> {
        self.queue.clone()
    }
}

fn to_queue_seek(seek: SeekMode) -> QueueSeekMode {
    match seek {
        SeekMode::Relative => QueueSeekMode::Relative,
        SeekMode::Absolute => QueueSeekMode::Absolute,
        SeekMode::RelativeOnRead => QueueSeekMode::RelativeOnRead,
        SeekMode::RelativeEnd => QueueSeekMode::RelativeEnd,
    }
}
