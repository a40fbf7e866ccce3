//! The gateway: accept loop, handshake dispatch and pair orchestration.
//!
//! One [`Gateway`] owns a [`Registry`] and a table of live pairs. Every
//! accepted transport gets its own task: the handshake decides whether it
//! opens a fresh pair (dial a backend, start the pump) or replaces the
//! transport of a suspended one.

use core::fmt::{Debug, Formatter};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::pump::pump;
use crate::registry::Registry;
use crate::session::Conn;
use crate::stream::StableStream;
use crate::transport::BoxTransport;

/// Future returned by [`Upstream::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + 'a>>;

/// Chooses and dials a backend for a freshly handshaken session.
pub trait Upstream: Send + Sync + 'static {
    /// Connects to a backend, honoring the client's preferred server name
    /// when one was supplied (empty otherwise).
    fn connect<'a>(&'a self, preferred: &'a str) -> ConnectFuture<'a>;
}

/// A fixed host table: named entries are preferred, any entry serves as
/// fallback, picked at random.
#[derive(Clone, Debug, Default)]
pub struct StaticUpstream {
    named: HashMap<String, SocketAddr>,
    all: Vec<SocketAddr>,
}

impl StaticUpstream {
    /// An empty host table. [`Upstream::connect`] fails until a host is
    /// added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backend. A non-empty `name` makes it addressable by client
    /// preference; every backend joins the fallback set.
    pub fn with_host(mut self, name: impl Into<String>, addr: SocketAddr) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.named.insert(name, addr);
        }
        self.all.push(addr);
        self
    }
}

impl Upstream for StaticUpstream {
    fn connect<'a>(&'a self, preferred: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let addr = match self.named.get(preferred) {
                Some(addr) => *addr,
                None if self.all.is_empty() => {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no upstream host"));
                }
                None => self.all[rand::rng().random_range(0..self.all.len())],
            };
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}

/// The SCP gateway. See the [module docs](self).
pub struct Gateway {
    registry: Arc<Registry>,
    upstream: Arc<dyn Upstream>,
    config: Config,
    pairs: Mutex<HashMap<u32, StableStream>>,
}

impl Gateway {
    /// A gateway forwarding to `upstream` with a fresh registry.
    pub fn new(upstream: Arc<dyn Upstream>, config: Config) -> Arc<Gateway> {
        Arc::new(Gateway {
            registry: Arc::new(Registry::new()),
            upstream,
            config,
            pairs: Mutex::new(HashMap::new()),
        })
    }

    /// The gateway's session registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The number of live pairs.
    pub fn pair_count(&self) -> usize {
        self.pairs.lock().unwrap().len()
    }

    /// Accepts TCP transports forever, one task per connection. Transient
    /// accept failures retry with a doubling delay capped at one second.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let addr = listener.local_addr().ok();
        info!(?addr, "gateway serving");
        let mut retry_delay = Duration::ZERO;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    retry_delay = Duration::ZERO;
                    debug!(%peer, "accepted connection");
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        gateway.handle(Box::new(stream)).await;
                    });
                }
                Err(err) => {
                    retry_delay = if retry_delay.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (retry_delay * 2).min(Duration::from_secs(1))
                    };
                    warn!(error = %err, delay = ?retry_delay, "accept failed, retrying");
                    sleep(retry_delay).await;
                }
            }
        }
    }

    /// Handles one accepted transport end to end: handshake, then either a
    /// new pair or a transport replacement.
    pub async fn handle(&self, transport: BoxTransport) {
        let conn = Conn::server(transport, self.registry.clone(), self.config.clone());
        if let Err(err) = conn.handshake().await {
            warn!(peer = ?conn.peer_addr(), error = %err, "handshake failed");
            conn.close().await;
            return;
        }
        if conn.is_reused() {
            self.attach_reused(conn).await;
        } else {
            self.run_pair(conn).await;
        }
    }

    async fn run_pair(&self, conn: Arc<Conn>) {
        let id = conn.id();
        self.registry.register(id, conn.clone());
        let stream = StableStream::new(conn.clone(), self.config.reuse_timeout);
        self.pairs.lock().unwrap().insert(id, stream.clone());
        info!(
            id,
            peer = ?conn.peer_addr(),
            target = %conn.target_server(),
            "pair new"
        );

        let backend = match self.upstream.connect(&conn.target_server()).await {
            Ok(backend) => backend,
            Err(err) => {
                error!(id, error = %err, "upstream connect failed");
                stream.close().await;
                self.teardown(id).await;
                return;
            }
        };

        pump(stream, backend).await;
        self.teardown(id).await;
    }

    async fn attach_reused(&self, conn: Arc<Conn>) {
        let id = conn.id();
        let stream = self.pairs.lock().unwrap().get(&id).cloned();
        let Some(stream) = stream else {
            warn!(id, "pair reuse failed: no pair");
            conn.close().await;
            return;
        };
        if !self.registry.rebind(id, conn.clone()) {
            warn!(id, "pair reuse raced with teardown");
            conn.close().await;
            return;
        }
        if stream.replace_session(conn.clone()) {
            info!(id, peer = ?conn.peer_addr(), "pair reuse");
        } else {
            warn!(id, "pair reuse failed: stream closed");
            conn.close().await;
        }
    }

    /// Removes a finished pair and releases its id exactly once; the
    /// reuse-error path may already have deregistered it.
    async fn teardown(&self, id: u32) {
        self.pairs.lock().unwrap().remove(&id);
        if let Some(conn) = self.registry.deregister(id) {
            self.registry.release_id(id);
            conn.close().await;
        }
    }
}

impl Debug for Gateway {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gateway")
            .field("pairs", &self.pair_count())
            .field("registry", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
