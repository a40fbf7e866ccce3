//! `StableStream`: a byte-stream façade that survives transport loss.
//!
//! The pump reads and writes through this wrapper instead of touching the
//! session directly. When the session underneath freezes, the wrapper
//! parks the caller and waits for the gateway to splice a replacement
//! session in; if the reuse-grace period lapses first, the stream fails
//! for good and every parked caller wakes with a terminal error.

use core::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::Error;
use crate::session::Conn;

/// A cheaply cloneable handle presenting a session as a plain byte stream,
/// masking transport replacement underneath.
#[derive(Clone)]
pub struct StableStream {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled on replacement and on terminal close.
    replaced: Notify,
    reuse_timeout: Duration,
}

struct Inner {
    conn: Arc<Conn>,
    suspended: Option<Error>,
    closed: bool,
    /// Bumped on every suspend, replace and close; a grace timer only
    /// fires if its generation is still current.
    generation: u64,
}

impl StableStream {
    /// Wraps `conn`, allowing `reuse_timeout` for each transport
    /// replacement.
    pub fn new(conn: Arc<Conn>, reuse_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    conn,
                    suspended: None,
                    closed: false,
                    generation: 0,
                }),
                replaced: Notify::new(),
                reuse_timeout,
            }),
        }
    }

    /// The session currently carrying the stream.
    pub fn session(&self) -> Arc<Conn> {
        self.shared.inner.lock().unwrap().conn.clone()
    }

    /// The session id, stable across replacements.
    pub fn id(&self) -> u32 {
        self.session().id()
    }

    /// Reads up to `buf.len()` bytes. A dead transport parks the call
    /// until a replacement arrives; only grace expiry or [`close`] make it
    /// fail.
    ///
    /// [`close`]: StableStream::close
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            let conn = self.wait_usable().await?;
            match conn.read(buf).await {
                Ok(n) => return Ok(n),
                Err(err) => self.suspend(&conn, err),
            }
        }
    }

    /// Writes all of `buf`. The session records every byte in its replay
    /// ring before touching the transport, so a mid-write transport death
    /// still counts the buffer as accepted: the spliced successor
    /// retransmits the unacknowledged tail.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        loop {
            let conn = self.wait_usable().await?;
            match conn.write(buf).await {
                Ok(n) => return Ok(n),
                Err(err @ (Error::Frozen | Error::Closed)) => {
                    // Nothing was recorded; retry the whole buffer on the
                    // replacement transport.
                    self.suspend(&conn, err);
                }
                Err(err) => {
                    // Recorded but undelivered; the replay ring owns the
                    // tail now.
                    self.suspend(&conn, err);
                    return Ok(buf.len());
                }
            }
        }
    }

    /// Blocks until the stream has a usable session, a replacement
    /// arrives, or the stream dies.
    async fn wait_usable(&self) -> Result<Arc<Conn>, Error> {
        loop {
            if let Some(conn) = self.poll_usable()? {
                return Ok(conn);
            }
            let notified = self.shared.replaced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check: a replacement may have slipped in before the
            // waiter registered.
            if let Some(conn) = self.poll_usable()? {
                return Ok(conn);
            }
            notified.await;
        }
    }

    fn poll_usable(&self) -> Result<Option<Arc<Conn>>, Error> {
        let inner = self.shared.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.suspended.is_none() {
            return Ok(Some(inner.conn.clone()));
        }
        Ok(None)
    }

    /// Marks the stream suspended after `source` failed and starts the
    /// grace timer. Errors reported against an already-replaced session
    /// are stale and ignored.
    fn suspend(&self, source: &Arc<Conn>, err: Error) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed || inner.suspended.is_some() {
            return;
        }
        if !Arc::ptr_eq(&inner.conn, source) {
            return;
        }
        debug!(id = source.id(), error = %err, "stream suspended, awaiting replacement");
        inner.suspended = Some(err);
        inner.generation += 1;
        let generation = inner.generation;
        drop(inner);

        let this = self.clone();
        tokio::spawn(async move {
            sleep(this.shared.reuse_timeout).await;
            this.expire(generation).await;
        });
    }

    async fn expire(&self, generation: u64) {
        let expired = {
            let inner = self.shared.inner.lock().unwrap();
            !inner.closed && inner.suspended.is_some() && inner.generation == generation
        };
        if expired {
            info!(id = self.id(), "reuse grace period expired");
            self.close().await;
        }
    }

    /// Swaps in the successor session a reuse handshake produced, waking
    /// every parked reader and writer. Returns `false` when the stream
    /// already closed.
    ///
    /// # Panics
    ///
    /// Panics when the successor carries a different session id.
    pub fn replace_session(&self, next: Arc<Conn>) -> bool {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            assert_eq!(
                inner.conn.id(),
                next.id(),
                "replacement session id mismatch"
            );
            inner.conn = next;
            inner.suspended = None;
            inner.generation += 1; // cancels any pending grace timer
        }
        self.shared.replaced.notify_waiters();
        true
    }

    /// Terminal close: wakes every parked caller with an error and closes
    /// the current session. Idempotent.
    pub async fn close(&self) {
        let conn = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.generation += 1;
            inner.conn.clone()
        };
        self.shared.replaced.notify_waiters();
        conn.close().await;
    }
}

impl Debug for StableStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let inner = self.shared.inner.lock().unwrap();
        f.debug_struct("StableStream")
            .field("conn", &inner.conn)
            .field("suspended", &inner.suspended)
            .field("closed", &inner.closed)
            .finish()
    }
}
