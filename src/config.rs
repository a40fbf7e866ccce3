//! Configuration for sessions and the gateway.
//!
//! A [`Config`] is a plain value: start from [`Config::new`] and chain the
//! `with_*` methods for anything the defaults do not cover.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use sconwire::Config;
//!
//! let config = Config::new()
//!     .with_reuse_buffer_size(128 * 1024)
//!     .with_reuse_timeout(Duration::from_secs(60))
//!     .with_target_server("lobby");
//! ```

use core::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::replay_buffer::ReplayBufferPool;

/// Default replay ring capacity: 64 KiB. A sensible value is the reuse
/// grace period multiplied by the expected downstream byte rate.
pub const DEFAULT_REUSE_BUFFER: usize = 64 * 1024;

/// Default deadline for a whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period a frozen session waits for its replacement
/// transport before closing for good.
pub const DEFAULT_REUSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by sessions, the stream wrapper and the gateway.
#[derive(Clone)]
pub struct Config {
    pub(crate) reuse_buffer_size: usize,
    pub(crate) handshake_timeout: Duration,
    pub(crate) reuse_timeout: Duration,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) target_server: String,
    pub(crate) replay_pool: Option<Arc<ReplayBufferPool>>,
    pub(crate) signing_key: Option<SigningKey>,
    pub(crate) verify_key: Option<VerifyingKey>,
}

impl Config {
    /// A configuration with the default option set.
    pub fn new() -> Self {
        Self {
            reuse_buffer_size: DEFAULT_REUSE_BUFFER,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reuse_timeout: DEFAULT_REUSE_TIMEOUT,
            read_timeout: None,
            target_server: String::new(),
            replay_pool: None,
            signing_key: None,
            verify_key: None,
        }
    }

    /// Capacity of the per-session replay ring. Bounds how large a gap a
    /// reuse can bridge.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn with_reuse_buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "reuse buffer size must be non-zero");
        self.reuse_buffer_size = size;
        self
    }

    /// Deadline for a whole handshake, from transport accept to the
    /// session going live.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Grace period a frozen session waits for a replacement transport.
    pub fn with_reuse_timeout(mut self, timeout: Duration) -> Self {
        self.reuse_timeout = timeout;
        self
    }

    /// Per-read deadline on the raw transport. Exceeding it freezes the
    /// session rather than closing it, so the client may still reconnect.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Preferred backend server name a client announces in its new-session
    /// handshake.
    pub fn with_target_server(mut self, name: impl Into<String>) -> Self {
        self.target_server = name.into();
        self
    }

    /// Shares a replay-ring pool across sessions. The pool's capacity
    /// should match [`Config::with_reuse_buffer_size`]; mismatched buffers
    /// are never handed out.
    pub fn with_replay_pool(mut self, pool: Arc<ReplayBufferPool>) -> Self {
        self.replay_pool = Some(pool);
        self
    }

    /// Signs new-session responses with `key` so clients can authenticate
    /// the gateway.
    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Requires new-session responses to carry a valid signature under
    /// `key`. Responses without one are rejected.
    pub fn with_verify_key(mut self, key: VerifyingKey) -> Self {
        self.verify_key = Some(key);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("reuse_buffer_size", &self.reuse_buffer_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("reuse_timeout", &self.reuse_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("target_server", &self.target_server)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "*****"))
            .field("verify_key", &self.verify_key.as_ref().map(|_| "*****"))
            .finish_non_exhaustive()
    }
}
