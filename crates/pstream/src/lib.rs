//! Frames a connected bidirectional byte stream into discrete packet/audio
//! items, the way `pa_pstream` frames a UNIX or TCP socket for PulseAudio's
//! native protocol: a 20-byte descriptor followed by its payload, with an
//! optional shared-memory handoff in place of inline bytes.
//!
//! A single-threaded-cooperative model per stream: one reader task decodes
//! frames and invokes user callbacks, one writer task drains the send queue
//! and owns all outbound I/O, so no lock is ever held across a callback.

pub mod error;
pub mod io;
pub mod sink;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pulse_mem::{MemChunk, MemExport, MemImport, MemPool};
pub use pulse_wire::{Creds, SeekMode};
use pulse_wire::{FrameDescriptor, Item, ShmRef, ShmVariant, CONTROL_CHANNEL, DESCRIPTOR_SIZE, FLAG_SHMDATA, FLAG_SHMRELEASE, FLAG_SHMREVOKE};
use tokio::sync::mpsc;

pub use error::PStreamError;
pub use io::{IoChannel, TokioIoChannel};

/// At least 512 kB, per the protocol's historical allowance for uploading a
/// single sample cache entry in one frame.
pub const FRAME_SIZE_MAX: u32 = 512 * 1024;

type PacketCb = Box<dyn FnMut(Vec<u8>, Option<Creds>) + Send>;
type MemBlockCb = Box<dyn FnMut(u32, i64, SeekMode, MemChunk) + Send>;
type DieCb = Box<dyn FnOnce() + Send>;
type DrainCb = Box<dyn FnMut() + Send>;
type BlockIdCb = Box<dyn FnMut(u32) + Send>;

#[derive(Default)]
struct Callbacks {
    on_packet: Option<PacketCb>,
    on_memblock: Option<MemBlockCb>,
    on_die: Option<DieCb>,
    on_drain: Option<DrainCb>,
    on_release: Option<BlockIdCb>,
    on_revoke: Option<BlockIdCb>,
}

struct Shared {
    dead: AtomicBool,
    shm_enabled: AtomicBool,
    pending: AtomicUsize,
    pool: MemPool,
    import: MemImport,
    export: Mutex<Option<MemExport>>,
    callbacks: Mutex<Callbacks>,
}

impl Shared {
    fn die(&self, err: PStreamError) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!("pstream died: {err}");
        let mut callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
        if let Some(cb) = callbacks.on_die.take() {
            cb();
        }
    }

    fn mark_item_sent(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cb) = self.callbacks.lock().unwrap().on_drain.as_mut() {
                cb();
            }
        }
    }

    fn process_release(&self, block_id: u32) {
        if let Some(export) = self.export.lock().unwrap().as_ref() {
            export.process_release(block_id);
        }
    }

    fn fire_on_packet(&self, bytes: Vec<u8>, creds: Option<Creds>) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_packet.as_mut() {
            cb(bytes, creds);
        }
    }

    fn fire_on_memblock(&self, channel: u32, offset: i64, seek: SeekMode, chunk: MemChunk) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_memblock.as_mut() {
            cb(channel, offset, seek, chunk);
        }
    }

    fn fire_on_release(&self, block_id: u32) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_release.as_mut() {
            cb(block_id);
        }
    }

    fn fire_on_revoke(&self, block_id: u32) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_revoke.as_mut() {
            cb(block_id);
        }
    }
}

/// A framed, bidirectional audio/control stream over an `IoChannel`.
///
/// Cheap to clone: every clone shares the same send queue and callback
/// table, mirroring the teacher's freely-cloned `RpcWriter` handle.
#[derive(Clone)]
pub struct PStream {
    sender: mpsc::UnboundedSender<Item>,
    shared: Arc<Shared>,
}

impl PStream {
    /// Wraps an already-connected channel. `pool` sizes the receive buffers
    /// allocated for inline audio frames and backs `enable_shm`'s export
    /// table once shared-memory handoff is turned on.
    pub fn new<C>(io: C, pool: MemPool) -> Self
    where
        C: IoChannel + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            dead: AtomicBool::new(false),
            shm_enabled: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            pool,
            import: MemImport::new(),
            export: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        });

        let io = Arc::new(io);
        tokio::spawn(writer_task(io.clone(), receiver, shared.clone()));
        tokio::spawn(reader_task(io, shared.clone()));

        Self { sender, shared }
    }

    pub fn send_packet(&self, bytes: Vec<u8>, creds: Option<Creds>) {
        self.enqueue(Item::Packet { bytes, creds });
    }

    /// Splits `chunk` into sub-items of at most one pool block each before
    /// enqueuing, so no single write blocks the writer task for longer than
    /// it takes to push one block's worth of bytes.
    pub fn send_memblock(&self, channel: u32, offset: i64, seek: SeekMode, chunk: MemChunk) {
        let block_size = self.shared.pool.block_size().max(1);
        let mut sent = 0usize;
        while sent < chunk.length {
            let len = (chunk.length - sent).min(block_size);
            let sub = MemChunk::new(chunk.block.clone(), chunk.index + sent, len);
            self.enqueue(Item::MemBlock { channel, offset: offset + sent as i64, seek, chunk: sub });
            sent += len;
        }
    }

    pub fn send_release(&self, block_id: u32) {
        self.enqueue(Item::ShmRelease { block_id });
    }

    pub fn send_revoke(&self, block_id: u32) {
        self.enqueue(Item::ShmRevoke { block_id });
    }

    fn enqueue(&self, item: Item) {
        if self.shared.dead.load(Ordering::Acquire) {
            return;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(item).is_err() {
            // Writer task is gone; the next I/O error on the reader side
            // (or a concurrent die()) will settle the state.
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Turns SHM handoff for outgoing pool-backed memblocks on or off,
    /// lazily creating the export table the first time it's enabled.
    pub fn enable_shm(&self, enabled: bool) {
        self.shared.shm_enabled.store(enabled, Ordering::Release);
        if enabled {
            let mut export = self.shared.export.lock().unwrap();
            if export.is_none() {
                *export = Some(MemExport::new(self.shared.pool.clone()));
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.shared.dead.load(Ordering::Acquire) && self.shared.pending.load(Ordering::Acquire) > 0
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    pub fn on_packet(&self, cb: impl FnMut(Vec<u8>, Option<Creds>) + Send + 'static) {
        self.shared.callbacks.lock().unwrap().on_packet = Some(Box::new(cb));
    }

    pub fn on_memblock(&self, cb: impl FnMut(u32, i64, SeekMode, MemChunk) + Send + 'static) {
        self.shared.callbacks.lock().unwrap().on_memblock = Some(Box::new(cb));
    }

    pub fn on_die(&self, cb: impl FnOnce() + Send + 'static) {
        self.shared.callbacks.lock().unwrap().on_die = Some(Box::new(cb));
    }

    pub fn on_drain(&self, cb: impl FnMut() + Send + 'static) {
        self.shared.callbacks.lock().unwrap().on_drain = Some(Box::new(cb));
    }

    pub fn on_release(&self, cb: impl FnMut(u32) + Send + 'static) {
        self.shared.callbacks.lock().unwrap().on_release = Some(Box::new(cb));
    }

    pub fn on_revoke(&self, cb: impl FnMut(u32) + Send + 'static) {
        self.shared.callbacks.lock().unwrap().on_revoke = Some(Box::new(cb));
    }
}

async fn writer_task<C: IoChannel>(io: Arc<C>, mut receiver: mpsc::UnboundedReceiver<Item>, shared: Arc<Shared>) {
    while let Some(item) = receiver.recv().await {
        let (frame, creds) = match lower_item(&shared, item) {
            Ok(v) => v,
            Err(err) => {
                shared.die(err);
                return;
            }
        };
        if let Err(err) = write_all(&*io, &frame, creds).await {
            shared.die(err.into());
            return;
        }
        shared.mark_item_sent();
    }
    // Every `PStream` handle was dropped; there is no one left to write
    // for, so the stream is as good as dead.
    shared.die(PStreamError::Dead);
}

async fn reader_task<C: IoChannel>(io: Arc<C>, shared: Arc<Shared>) {
    loop {
        if shared.dead.load(Ordering::Acquire) {
            return;
        }
        let mut header = [0u8; DESCRIPTOR_SIZE];
        let header_creds = match read_all(&*io, &mut header).await {
            Ok(c) => c,
            Err(err) => return shared.die(err.into()),
        };
        let descriptor = FrameDescriptor::parse(&header);

        if descriptor.length > FRAME_SIZE_MAX {
            return shared.die(PStreamError::FrameTooLarge { length: descriptor.length, max: FRAME_SIZE_MAX });
        }
        let seek = match descriptor.seek_mode() {
            Ok(s) => s,
            Err(_) => return shared.die(PStreamError::InvalidSeekMode((descriptor.flags & pulse_wire::FLAG_SEEKMASK) as u8)),
        };
        let variant = match descriptor.shm_variant() {
            Ok(v) => v,
            Err(_) => return shared.die(PStreamError::UnknownFlagBits(descriptor.flags)),
        };

        match variant {
            ShmVariant::Release => {
                shared.process_release(descriptor.offset_hi);
                shared.fire_on_release(descriptor.offset_hi);
            }
            ShmVariant::Revoke => {
                shared.import.process_revoke(descriptor.offset_hi);
                shared.fire_on_revoke(descriptor.offset_hi);
            }
            ShmVariant::Data => {
                if !shared.shm_enabled.load(Ordering::Acquire) {
                    return shared.die(PStreamError::ShmDisabled);
                }
                let mut payload = [0u8; ShmRef::SIZE];
                if let Err(err) = read_all(&*io, &mut payload).await {
                    return shared.die(err.into());
                }
                let r = ShmRef::parse(&payload);
                match shared.import.get(r.block_id, r.shm_id, r.index, r.length) {
                    Ok(block) => {
                        let chunk = MemChunk::new(block, 0, r.length as usize);
                        shared.fire_on_memblock(descriptor.channel, descriptor.offset(), seek, chunk);
                    }
                    Err(err) => {
                        log::warn!("dropping inbound SHM reference {}: {err}", r.block_id);
                    }
                }
            }
            ShmVariant::Inline => {
                let mut payload = vec![0u8; descriptor.length as usize];
                let payload_creds = if descriptor.length > 0 {
                    match read_all(&*io, &mut payload).await {
                        Ok(c) => c,
                        Err(err) => return shared.die(err.into()),
                    }
                } else {
                    None
                };
                let creds = header_creds.or(payload_creds);

                if descriptor.is_control() {
                    shared.fire_on_packet(payload, creds);
                } else {
                    let block = shared
                        .pool
                        .allocate(payload.len())
                        .unwrap_or_else(|| shared.pool.allocate_appended(payload.len()));
                    block.fill(&payload);
                    let chunk = MemChunk::new(block, 0, payload.len());
                    shared.fire_on_memblock(descriptor.channel, descriptor.offset(), seek, chunk);
                }
            }
        }
    }
}

/// Builds a complete frame (descriptor plus payload) for `item`, downgrading
/// a memblock send to an inline copy if it isn't (or can't be made) SHM
/// shareable.
fn lower_item(shared: &Shared, item: Item) -> Result<(Vec<u8>, Option<Creds>), PStreamError> {
    let (descriptor, payload, creds) = match item {
        Item::Packet { bytes, creds } => {
            check_frame_size(bytes.len())?;
            let descriptor = FrameDescriptor { length: bytes.len() as u32, channel: CONTROL_CHANNEL, offset_hi: 0, offset_lo: 0, flags: 0 };
            (descriptor, bytes, creds)
        }
        Item::MemBlock { channel, offset, seek, chunk } => {
            let mut descriptor = FrameDescriptor { length: 0, channel, offset_hi: 0, offset_lo: 0, flags: seek.to_byte() as u32 };
            descriptor.set_offset(offset);

            let exported = if shared.shm_enabled.load(Ordering::Acquire) {
                shared.export.lock().unwrap().as_ref().and_then(|e| e.put(chunk.block.clone()).ok())
            } else {
                None
            };

            match exported {
                Some(desc) => {
                    descriptor.flags |= FLAG_SHMDATA;
                    descriptor.length = ShmRef::SIZE as u32;
                    let shm_ref = ShmRef { block_id: desc.block_id, shm_id: desc.shm_id, index: desc.offset, length: desc.length };
                    (descriptor, shm_ref.to_bytes().to_vec(), None)
                }
                None => {
                    let bytes = chunk.as_slice();
                    check_frame_size(bytes.len())?;
                    descriptor.length = bytes.len() as u32;
                    (descriptor, bytes, None)
                }
            }
        }
        Item::ShmRelease { block_id } => {
            let descriptor = FrameDescriptor { length: 0, channel: CONTROL_CHANNEL, offset_hi: block_id, offset_lo: 0, flags: FLAG_SHMRELEASE };
            (descriptor, Vec::new(), None)
        }
        Item::ShmRevoke { block_id } => {
            let descriptor = FrameDescriptor { length: 0, channel: CONTROL_CHANNEL, offset_hi: block_id, offset_lo: 0, flags: FLAG_SHMREVOKE };
            (descriptor, Vec::new(), None)
        }
    };

    let mut frame = descriptor.to_bytes().to_vec();
    frame.extend_from_slice(&payload);
    Ok((frame, creds))
}

fn check_frame_size(len: usize) -> Result<(), PStreamError> {
    if len > FRAME_SIZE_MAX as usize {
        return Err(PStreamError::FrameTooLarge { length: len as u32, max: FRAME_SIZE_MAX });
    }
    Ok(())
}

async fn write_all<C: IoChannel + ?Sized>(io: &C, buf: &[u8], creds: Option<Creds>) -> std::io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        io.writable().await?;
        let attempt_creds = if written == 0 { creds } else { None };
        match io.try_write_with_creds(&buf[written..], attempt_creds) {
            Ok(0) => return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn read_all<C: IoChannel + ?Sized>(io: &C, buf: &mut [u8]) -> std::io::Result<Option<Creds>> {
    let mut read = 0;
    let mut creds = None;
    while read < buf.len() {
        io.readable().await?;
        match io.try_read_with_creds(&mut buf[read..]) {
            Ok((0, _)) => return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed the connection")),
            Ok((n, c)) => {
                read += n;
                creds = creds.or(c);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(creds)
}
