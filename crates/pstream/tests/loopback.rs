use std::time::Duration;

use pulse_mem::{MemBlock, MemChunk, MemPool};
use pstream::{PStream, SeekMode, TokioIoChannel};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn pair() -> (TokioIoChannel, TokioIoChannel) {
    let (a, b) = UnixStream::pair().unwrap();
    (TokioIoChannel::Unix(a), TokioIoChannel::Unix(b))
}

fn small_pool() -> MemPool {
    MemPool::new(false, 4, 4096).unwrap()
}

#[tokio::test]
async fn inline_packet_round_trips() {
    let (io_a, io_b) = pair().await;
    let a = PStream::new(io_a, small_pool());
    let b = PStream::new(io_b, small_pool());

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.on_packet(move |bytes, _creds| {
        let _ = tx.send(bytes);
    });

    a.send_packet(b"hello from a".to_vec(), None);

    let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, b"hello from a");
}

#[tokio::test]
async fn inline_memblock_round_trips_with_seek_offset() {
    let (io_a, io_b) = pair().await;
    let a = PStream::new(io_a, small_pool());
    let b = PStream::new(io_b, small_pool());

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.on_memblock(move |channel, offset, seek, chunk: MemChunk| {
        let _ = tx.send((channel, offset, seek, chunk.as_slice()));
    });

    let block = MemBlock::from_bytes(b"audioaudio".to_vec());
    let chunk = MemChunk::new(block, 0, 10);
    a.send_memblock(3, 1000, SeekMode::Absolute, chunk);

    let (channel, offset, seek, bytes) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(channel, 3);
    assert_eq!(offset, 1000);
    assert_eq!(seek, SeekMode::Absolute);
    assert_eq!(bytes, b"audioaudio");
}

#[tokio::test]
async fn shm_handoff_delivers_block_via_import() {
    let (io_a, io_b) = pair().await;
    let shared_pool = MemPool::new(true, 4, 4096).unwrap();
    let a = PStream::new(io_a, shared_pool);
    let b = PStream::new(io_b, small_pool());
    a.enable_shm(true);
    b.enable_shm(true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.on_memblock(move |_channel, _offset, _seek, chunk: MemChunk| {
        let _ = tx.send(chunk.as_slice());
    });

    let block = MemBlock::from_bytes(b"shm-transported-bytes".to_vec());
    let chunk = MemChunk::new(block, 0, 22);
    a.send_memblock(0, 0, SeekMode::Relative, chunk);

    let bytes = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(bytes, b"shm-transported-bytes");
}

#[tokio::test]
async fn revoke_notification_propagates_to_peer() {
    let (io_a, io_b) = pair().await;
    let a = PStream::new(io_a, small_pool());
    let b = PStream::new(io_b, small_pool());

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.on_revoke(move |block_id| {
        let _ = tx.send(block_id);
    });

    a.send_revoke(42);

    let block_id = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(block_id, 42);
}

#[tokio::test]
async fn oversized_frame_kills_the_stream() {
    let (io_a, io_b) = pair().await;
    let a = PStream::new(io_a, small_pool());
    let _b = PStream::new(io_b, small_pool());

    let (tx, rx) = tokio::sync::oneshot::channel();
    a.on_die(move || {
        let _ = tx.send(());
    });

    let oversized = vec![0u8; pstream::FRAME_SIZE_MAX as usize + 1];
    a.send_packet(oversized, None);

    timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert!(a.is_dead());
}
