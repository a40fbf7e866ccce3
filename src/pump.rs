//! The bidirectional pump between a stable client stream and its backend.
//!
//! Two copy loops run per session pair, one per direction. Either loop
//! finishing, by error or end-of-stream, winds the other one down; the
//! orchestrator waits for both and reports per-direction byte and packet
//! counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::stream::StableStream;
use crate::transport::BoxTransport;

/// Canonical transfer unit for pump copies: 32 KiB.
pub const NET_BUFFER_SIZE: usize = 32 * 1024;

/// How many idle transfer buffers the pool retains.
const POOL_RETAIN: usize = 64;

/// A process-wide pool of transfer buffers, shared by every pump.
static COPY_POOL: LazyLock<BufferPool> = LazyLock::new(BufferPool::default);

#[derive(Debug, Default)]
struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; NET_BUFFER_SIZE])
    }

    fn put(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < POOL_RETAIN {
            free.push(buf);
        }
    }
}

/// Byte and packet counters for one finished pump.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PumpReport {
    /// Bytes forwarded from the client to the backend.
    pub client_to_backend_bytes: u64,
    /// Client reads forwarded to the backend.
    pub client_to_backend_packets: u64,
    /// Bytes forwarded from the backend to the client.
    pub backend_to_client_bytes: u64,
    /// Backend reads forwarded to the client.
    pub backend_to_client_packets: u64,
}

/// Tells the sibling copy loop to wind down.
#[derive(Debug, Default)]
struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn signal(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_signalled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Copies bytes both ways until either side finishes, then tears the pair
/// down and reports what moved.
pub async fn pump(stream: StableStream, backend: BoxTransport) -> PumpReport {
    let id = stream.id();
    let (backend_rd, backend_wr) = split(backend);
    let shutdown = Arc::new(Shutdown::default());

    let c2s = tokio::spawn(client_to_backend(
        stream.clone(),
        backend_wr,
        shutdown.clone(),
    ));
    let s2c = tokio::spawn(backend_to_client(
        backend_rd,
        stream.clone(),
        shutdown.clone(),
    ));

    let (c2s_bytes, c2s_packets) = c2s.await.unwrap_or_default();
    let (s2c_bytes, s2c_packets) = s2c.await.unwrap_or_default();
    stream.close().await;

    info!(
        id,
        c2s_bytes, c2s_packets, s2c_bytes, s2c_packets, "pair pump finished"
    );
    PumpReport {
        client_to_backend_bytes: c2s_bytes,
        client_to_backend_packets: c2s_packets,
        backend_to_client_bytes: s2c_bytes,
        backend_to_client_packets: s2c_packets,
    }
}

async fn client_to_backend(
    stream: StableStream,
    mut backend: WriteHalf<BoxTransport>,
    shutdown: Arc<Shutdown>,
) -> (u64, u64) {
    let mut buf = COPY_POOL.get();
    let mut bytes = 0u64;
    let mut packets = 0u64;

    loop {
        let notified = shutdown.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if shutdown.is_signalled() {
            break;
        }
        let n = tokio::select! {
            r = stream.read(&mut buf) => match r {
                Ok(n) => n,
                Err(err) => {
                    debug!(id = stream.id(), error = %err, "client read finished");
                    break;
                }
            },
            _ = &mut notified => break,
        };
        if backend.write_all(&buf[..n]).await.is_err() {
            break;
        }
        bytes += n as u64;
        packets += 1;
    }

    shutdown.signal();
    let _ = backend.shutdown().await;
    COPY_POOL.put(buf);
    (bytes, packets)
}

async fn backend_to_client(
    mut backend: ReadHalf<BoxTransport>,
    stream: StableStream,
    shutdown: Arc<Shutdown>,
) -> (u64, u64) {
    let mut buf = COPY_POOL.get();
    let mut bytes = 0u64;
    let mut packets = 0u64;

    loop {
        let notified = shutdown.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if shutdown.is_signalled() {
            break;
        }
        let n = tokio::select! {
            r = backend.read(&mut buf) => match r {
                // End-of-stream from the backend ends the pair.
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = &mut notified => break,
        };
        if let Err(err) = stream.write(&buf[..n]).await {
            debug!(id = stream.id(), error = %err, "client write finished");
            break;
        }
        bytes += n as u64;
        packets += 1;
    }

    shutdown.signal();
    COPY_POOL.put(buf);
    (bytes, packets)
}
