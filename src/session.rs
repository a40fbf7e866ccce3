//! The session record.
//!
//! A [`Conn`] owns one side of an SCP session: the identity agreed during
//! the handshake (id, shared secret, handshake counter), the two cipher
//! half-streams with their byte counters, the replay ring, and whichever
//! transport currently carries the bytes. The transport is replaceable:
//! when it dies the session freezes instead of closing, and a reuse
//! handshake splices the whole state onto a fresh transport without the
//! peer's application noticing.
//!
//! The record holds no reference to the pump or the stream wrapper, so it
//! can be driven in isolation.

use core::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{
    self, ClientHandshake, NewSessionRequest, NewSessionResponse, ReuseSessionRequest,
    ReuseSessionResponse,
};
use crate::config::Config;
use crate::crypto::{self, Le64, Rc4, SessionKey};
use crate::error::{status, Error};
use crate::registry::Registry;
use crate::replay_buffer::ReplayBuffer;
use crate::transport::{BoxTransport, Transport};

/// Where a session is in its life.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Lifecycle {
    /// Created, handshake not finished.
    Handshaking,
    /// Carrying traffic.
    Live,
    /// Transport lost; waiting to be spliced onto a replacement.
    Frozen,
    /// Finished for good; resources released.
    Closed,
}

enum Role {
    Client,
    Server { registry: Arc<Registry> },
}

struct State {
    lifecycle: Lifecycle,
    id: u32,
    secret: Le64,
    handshakes: u32,
    target_server: String,
    reused: bool,
    handshake_done: bool,
    handshake_err: Option<Error>,
    /// Id acquired by a server handshake still in flight; released if the
    /// handshake dies before the session goes live.
    pending_id: Option<u32>,
}

struct CipherReader {
    transport: Option<ReadHalf<BoxTransport>>,
    cipher: Rc4,
    count: u64,
}

struct CipherWriter {
    transport: Option<WriteHalf<BoxTransport>>,
    cipher: Rc4,
    count: u64,
    replay: Option<ReplayBuffer>,
}

/// One side of an SCP session. See the [module docs](self).
pub struct Conn {
    config: Config,
    role: Role,
    peer: Option<SocketAddr>,
    state: StdMutex<State>,
    /// Wakes I/O blocked on a transport that just got frozen out.
    frozen: Notify,
    reader: AsyncMutex<CipherReader>,
    writer: AsyncMutex<CipherWriter>,
}

impl Conn {
    /// Wraps an accepted transport as the server side of a session. The
    /// handshake decides whether it becomes a fresh session or splices an
    /// existing one out of `registry`.
    pub fn server(transport: BoxTransport, registry: Arc<Registry>, config: Config) -> Arc<Conn> {
        Arc::new(Self::with_role(
            transport,
            Role::Server { registry },
            config,
        ))
    }

    /// Wraps a dialed transport as a client session that will run the
    /// new-session handshake.
    pub fn client(transport: BoxTransport, config: Config) -> Arc<Conn> {
        Arc::new(Self::with_role(transport, Role::Client, config))
    }

    /// Wraps a freshly dialed transport as the successor of `predecessor`,
    /// whose transport died. The predecessor is frozen, its state is
    /// spliced over, and the handshake counter is bumped; the reuse
    /// handshake then runs on first I/O (or via [`Conn::handshake`]).
    ///
    /// Fails with [`Error::NotAcceptable`] when the predecessor is already
    /// closed.
    pub async fn client_reusing(
        transport: BoxTransport,
        config: Config,
        predecessor: &Conn,
    ) -> Result<Arc<Conn>, Error> {
        let conn = Self::with_role(transport, Role::Client, config);
        let handshakes = predecessor.freeze_for_reuse()?;
        {
            let mut rd = conn.reader.lock().await;
            let mut wr = conn.writer.lock().await;
            predecessor.copy_state_into(&conn, &mut rd, &mut wr).await?;
        }
        conn.state.lock().unwrap().handshakes = handshakes + 1;
        Ok(Arc::new(conn))
    }

    fn with_role(transport: BoxTransport, role: Role, config: Config) -> Conn {
        let peer = transport.peer_addr();
        let (rd, wr) = split(transport);
        let placeholder = SessionKey::dumb();
        Conn {
            peer,
            state: StdMutex::new(State {
                lifecycle: Lifecycle::Handshaking,
                id: 0,
                secret: Le64::default(),
                handshakes: 0,
                target_server: config.target_server.clone(),
                reused: false,
                handshake_done: false,
                handshake_err: None,
                pending_id: None,
            }),
            frozen: Notify::new(),
            reader: AsyncMutex::new(CipherReader {
                transport: Some(rd),
                cipher: placeholder.rc4(),
                count: 0,
            }),
            writer: AsyncMutex::new(CipherWriter {
                transport: Some(wr),
                cipher: placeholder.rc4(),
                count: 0,
                replay: None,
            }),
            config,
            role,
        }
    }

    /// The session id, `0` until a new-session handshake assigns one.
    pub fn id(&self) -> u32 {
        self.state.lock().unwrap().id
    }

    /// Where the session is in its life.
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().unwrap().lifecycle
    }

    /// Whether this session was attached to a predecessor by a reuse
    /// handshake.
    pub fn is_reused(&self) -> bool {
        self.state.lock().unwrap().reused
    }

    /// Completed reuse handshakes; `0` for a session still on its first
    /// transport.
    pub fn handshakes(&self) -> u32 {
        self.state.lock().unwrap().handshakes
    }

    /// The backend name the client asked for, empty when it expressed no
    /// preference.
    pub fn target_server(&self) -> String {
        self.state.lock().unwrap().target_server.clone()
    }

    /// The transport's remote address at accept time, when it had one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Plaintext bytes read from the session since birth, across every
    /// transport it has been carried by.
    pub async fn bytes_received(&self) -> u64 {
        self.reader.lock().await.count
    }

    /// Plaintext bytes written to the session since birth.
    pub async fn bytes_sent(&self) -> u64 {
        self.writer.lock().await.count
    }

    pub(crate) fn secret(&self) -> Le64 {
        self.state.lock().unwrap().secret
    }

    /// Drives the handshake to completion under the configured deadline.
    /// Idempotent: later calls return the first outcome.
    pub async fn handshake(&self) -> Result<(), Error> {
        if let Some(done) = self.handshake_outcome() {
            return done;
        }
        let mut rd = self.reader.lock().await;
        let mut wr = self.writer.lock().await;
        if let Some(done) = self.handshake_outcome() {
            return done;
        }

        let deadline = self.config.handshake_timeout;
        let result = match timeout(deadline, self.drive_handshake(&mut rd, &mut wr)).await {
            Ok(result) => result,
            Err(_) => Err(Error::HandshakeTimeout),
        };

        if let Err(err) = &result {
            // A dying server handshake returns its freshly acquired id.
            let pending = self.state.lock().unwrap().pending_id.take();
            if let (Some(id), Role::Server { registry }) = (pending, &self.role) {
                registry.release_id(id);
            }
            debug!(peer = ?self.peer, error = %err, "handshake failed");
        }

        let mut state = self.state.lock().unwrap();
        state.handshake_done = true;
        state.handshake_err = result.as_ref().err().cloned();
        if result.is_ok() {
            state.pending_id = None;
            if state.lifecycle == Lifecycle::Handshaking {
                state.lifecycle = Lifecycle::Live;
            }
        }
        result
    }

    fn handshake_outcome(&self) -> Option<Result<(), Error>> {
        let state = self.state.lock().unwrap();
        if !state.handshake_done {
            return None;
        }
        Some(match &state.handshake_err {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        })
    }

    async fn drive_handshake(
        &self,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) -> Result<(), Error> {
        match &self.role {
            Role::Server { registry } => self.server_handshake(registry, rd, wr).await,
            Role::Client => {
                if self.state.lock().unwrap().id != 0 {
                    self.client_reuse_handshake(rd, wr).await
                } else {
                    self.client_new_handshake(rd, wr).await
                }
            }
        }
    }

    async fn server_handshake(
        &self,
        registry: &Arc<Registry>,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) -> Result<(), Error> {
        let payload = codec::read_record(rd.transport()?).await?;
        let request = match ClientHandshake::parse(&payload) {
            Ok(request) => request,
            Err(err) => {
                self.reply_status(wr, status::BAD_REQUEST).await;
                return Err(err);
            }
        };
        match request {
            ClientHandshake::New(req) => self.server_new_handshake(registry, req, rd, wr).await,
            ClientHandshake::Reuse(req) => {
                self.server_reuse_handshake(registry, req, rd, wr).await
            }
        }
    }

    /// Best-effort error reply; the transport is about to be dropped anyway.
    async fn reply_status(&self, wr: &mut CipherWriter, code: u16) {
        let resp = ReuseSessionResponse {
            received: 0,
            code,
            sum: Le64::default(),
        };
        if let Ok(transport) = wr.transport() {
            let _ = codec::write_record(transport, &resp.marshal()).await;
        }
    }

    async fn server_new_handshake(
        &self,
        registry: &Arc<Registry>,
        req: NewSessionRequest,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) -> Result<(), Error> {
        if req.key.to_u64() == 0 {
            self.reply_status(wr, status::BAD_REQUEST).await;
            return Err(Error::IllegalMessage);
        }

        let private = crypto::private_key();
        let public = crypto::public_key(private);

        let id = registry.acquire_id();
        self.state.lock().unwrap().pending_id = Some(id);

        let mut resp = NewSessionResponse {
            id,
            key: Le64::from_u64(public),
            signature: None,
        };
        if let Some(key) = &self.config.signing_key {
            resp.sign(key);
        }
        codec::write_record(wr.transport()?, &resp.marshal()).await?;

        let secret = Le64::from_u64(crypto::secret(private, req.key.to_u64()));
        self.init_session(id, secret, Some(req.target_server), rd, wr);
        debug!(id, peer = ?self.peer, "new session established");
        Ok(())
    }

    async fn server_reuse_handshake(
        &self,
        registry: &Arc<Registry>,
        req: ReuseSessionRequest,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) -> Result<(), Error> {
        let mut resp = ReuseSessionResponse {
            received: 0,
            code: status::OK,
            sum: Le64::default(),
        };
        let mut secret = None;
        let mut spliced_old: Option<Arc<Conn>> = None;
        let mut gap = 0usize;

        // First failing check wins; the reply always goes out.
        let code = 'checks: {
            let Some(old) = registry.lookup(req.id) else {
                break 'checks status::ID_NOT_FOUND;
            };
            let old_secret = old.secret();
            if !req.verify_sum(old_secret) {
                break 'checks status::UNAUTHORIZED;
            }
            if let Err(err) = old.claim_for_reuse(req.handshakes) {
                break 'checks err.code();
            }
            if old.copy_state_into(self, rd, wr).await.is_err() {
                // Lost the race against a close after the claim.
                break 'checks status::ID_NOT_FOUND;
            }
            {
                let mut state = self.state.lock().unwrap();
                state.handshakes = req.handshakes;
                state.reused = true;
            }
            secret = Some(old_secret);
            spliced_old = Some(old);

            let buffered = wr.replay.as_ref().map_or(0, |b| b.len() as u64);
            gap = match wr.count.checked_sub(req.received) {
                Some(g) if g <= buffered => g as usize,
                _ => break 'checks status::NOT_ACCEPTABLE,
            };
            resp.received = rd.count;
            break 'checks status::OK;
        };

        resp.code = code;
        if let Some(secret) = secret {
            resp.fill_sum(secret);
        }
        codec::write_record(wr.transport()?, &resp.marshal()).await?;

        if code != status::OK {
            if code == status::NOT_ACCEPTABLE {
                // The splice already emptied the predecessor into this
                // shell; neither session can carry the id any more.
                if registry.deregister(req.id).is_some() {
                    registry.release_id(req.id);
                }
                if let Some(old) = spliced_old {
                    old.close().await;
                }
            }
            warn!(id = req.id, code, peer = ?self.peer, "reuse refused");
            return Err(Error::from_status(code));
        }

        if gap > 0 {
            let tail = wr
                .replay
                .as_ref()
                .ok_or(Error::Closed)?
                .read_last(gap)?;
            let transport = wr.transport()?;
            transport.write_all(&tail).await?;
            transport.flush().await?;
            debug!(id = req.id, size = gap, "server retransmit");
        }
        debug!(id = req.id, handshakes = req.handshakes, peer = ?self.peer, "session reused");
        Ok(())
    }

    async fn client_new_handshake(
        &self,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) -> Result<(), Error> {
        let private = crypto::private_key();
        let req = NewSessionRequest {
            key: Le64::from_u64(crypto::public_key(private)),
            target_server: self.config.target_server.clone(),
        };
        codec::write_record(wr.transport()?, &req.marshal()).await?;

        let payload = codec::read_record(rd.transport()?).await?;
        let resp = NewSessionResponse::parse(&payload)?;
        resp.verify_signature(self.config.verify_key.as_ref())?;
        if resp.id == 0 || resp.key.to_u64() == 0 {
            return Err(Error::IllegalMessage);
        }

        let secret = Le64::from_u64(crypto::secret(private, resp.key.to_u64()));
        self.init_session(resp.id, secret, None, rd, wr);
        debug!(id = resp.id, "client session established");
        Ok(())
    }

    async fn client_reuse_handshake(
        &self,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) -> Result<(), Error> {
        let (id, handshakes, secret) = {
            let state = self.state.lock().unwrap();
            (state.id, state.handshakes, state.secret)
        };
        let mut req = ReuseSessionRequest {
            id,
            handshakes,
            received: rd.count,
            sum: Le64::default(),
        };
        req.fill_sum(secret);
        codec::write_record(wr.transport()?, &req.marshal()).await?;

        let payload = codec::read_record(rd.transport()?).await?;
        let resp = ReuseSessionResponse::parse(&payload)?;
        Error::check_status(resp.code)?;

        let buffered = wr.replay.as_ref().map_or(0, |b| b.len() as u64);
        let gap = match wr.count.checked_sub(resp.received) {
            Some(g) if g <= buffered => g as usize,
            _ => return Err(Error::NotAcceptable),
        };
        if gap > 0 {
            let tail = wr
                .replay
                .as_ref()
                .ok_or(Error::Closed)?
                .read_last(gap)?;
            let transport = wr.transport()?;
            transport.write_all(&tail).await?;
            transport.flush().await?;
            debug!(id, size = gap, "client retransmit");
        }
        self.state.lock().unwrap().reused = true;
        debug!(id, handshakes, "client session reused");
        Ok(())
    }

    fn init_session(
        &self,
        id: u32,
        secret: Le64,
        target_server: Option<String>,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) {
        let key = SessionKey::derive(secret);
        rd.cipher = key.rc4();
        rd.count = 0;
        wr.cipher = key.rc4();
        wr.count = 0;
        wr.replay = Some(self.new_replay_buffer());

        let mut state = self.state.lock().unwrap();
        state.id = id;
        state.secret = secret;
        state.handshakes = 0;
        state.reused = false;
        if let Some(target) = target_server {
            state.target_server = target;
        }
    }

    fn new_replay_buffer(&self) -> ReplayBuffer {
        match &self.config.replay_pool {
            Some(pool) if pool.capacity() == self.config.reuse_buffer_size => pool.get(),
            _ => ReplayBuffer::with_capacity(self.config.reuse_buffer_size),
        }
    }

    fn recycle_replay_buffer(&self, buf: ReplayBuffer) {
        if let Some(pool) = &self.config.replay_pool {
            pool.put(buf);
        }
    }

    /// Reads and deciphers up to `buf.len()` bytes from the current
    /// transport, advancing the received-byte counter.
    ///
    /// Any transport failure, end-of-stream, or read-timeout expiry
    /// freezes the session instead of closing it: the peer may still
    /// come back on a fresh transport.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.handshake().await?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut rd = self.reader.lock().await;
        let notified = self.frozen.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.check_live()?;

        let transport = rd.transport.as_mut().ok_or(Error::Frozen)?;
        let result = if let Some(limit) = self.config.read_timeout {
            tokio::select! {
                r = timeout(limit, transport.read(buf)) => {
                    r.unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
                }
                _ = &mut notified => return Err(Error::Frozen),
            }
        } else {
            tokio::select! {
                r = transport.read(buf) => r,
                _ = &mut notified => return Err(Error::Frozen),
            }
        };

        match result {
            Ok(0) => {
                rd.transport.take();
                self.mark_frozen();
                Err(Error::Io(std::io::ErrorKind::UnexpectedEof))
            }
            Ok(n) => {
                rd.cipher.apply_keystream(&mut buf[..n]);
                rd.count += n as u64;
                Ok(n)
            }
            Err(err) => {
                rd.transport.take();
                self.mark_frozen();
                Err(err.into())
            }
        }
    }

    /// Ciphers `buf`, records it in the replay ring, then writes it to the
    /// current transport, advancing the sent-byte counter.
    ///
    /// On an already-frozen session this fails with [`Error::Frozen`]
    /// before recording anything, and the same buffer may be retried after
    /// the transport is replaced. If the transport fails mid-write the
    /// bytes are already recorded and must not be written again: the
    /// replay ring covers the unacknowledged tail on reuse.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.handshake().await?;

        let mut wr = self.writer.lock().await;
        let notified = self.frozen.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.check_live()?;

        let half = &mut *wr;
        let Some(transport) = half.transport.as_mut() else {
            return Err(Error::Frozen);
        };
        let Some(replay) = half.replay.as_mut() else {
            return Err(Error::Closed);
        };

        let mut chunk = buf.to_vec();
        half.cipher.apply_keystream(&mut chunk);
        replay.write(&chunk);
        half.count += buf.len() as u64;

        let result = tokio::select! {
            r = transport.write_all(&chunk) => r,
            // Frozen mid-write: the bytes are recorded, so this must not
            // surface as the retryable `Frozen` gate.
            _ = &mut notified => Err(std::io::ErrorKind::ConnectionAborted.into()),
        };

        match result {
            Ok(()) => Ok(buf.len()),
            Err(err) => {
                wr.transport.take();
                self.mark_frozen();
                Err(err.into())
            }
        }
    }

    fn check_live(&self) -> Result<(), Error> {
        match self.state.lock().unwrap().lifecycle {
            Lifecycle::Closed => Err(Error::Closed),
            Lifecycle::Frozen => Err(Error::Frozen),
            _ => Ok(()),
        }
    }

    fn mark_frozen(&self) {
        let mut state = self.state.lock().unwrap();
        self.freeze_locked(&mut state);
    }

    fn freeze_locked(&self, state: &mut State) {
        if state.lifecycle != Lifecycle::Closed {
            state.lifecycle = Lifecycle::Frozen;
        }
        self.frozen.notify_waiters();
    }

    /// Closes the underlying transport and marks the session frozen; reads
    /// and writes fail until a replacement is spliced in. Clients call this
    /// before re-dialing.
    pub async fn freeze(&self) {
        self.mark_frozen();
        self.reader.lock().await.transport.take();
        let mut wr = self.writer.lock().await;
        if let Some(mut transport) = wr.transport.take() {
            let _ = transport.shutdown().await;
        }
    }

    /// Validates a reuse claim against this session and, when it holds,
    /// commits the new handshake counter and freezes the session in one
    /// step. Exactly one of several concurrent claimants wins; the rest
    /// observe the bumped counter.
    fn claim_for_reuse(&self, req_handshakes: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle == Lifecycle::Closed {
            return Err(Error::IdNotFound);
        }
        if state.handshakes >= req_handshakes {
            return Err(Error::Expired);
        }
        state.handshakes = req_handshakes;
        self.freeze_locked(&mut state);
        Ok(())
    }

    /// Freezes this session so a client successor can splice it, returning
    /// the current handshake counter.
    fn freeze_for_reuse(&self) -> Result<u32, Error> {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle == Lifecycle::Closed {
            return Err(Error::NotAcceptable);
        }
        let handshakes = state.handshakes;
        self.freeze_locked(&mut state);
        Ok(handshakes)
    }

    /// Deep-copies identity, cipher states, counters and replay ring into
    /// `new`'s halves, dropping this session's dead transport. The caller
    /// must have frozen this session first, so blocked I/O has already
    /// drained off the half-locks.
    async fn copy_state_into(
        &self,
        new: &Conn,
        rd: &mut CipherReader,
        wr: &mut CipherWriter,
    ) -> Result<(), Error> {
        let mut old_rd = self.reader.lock().await;
        let mut old_wr = self.writer.lock().await;

        let Some(replay) = old_wr.replay.as_ref() else {
            // Closed in the window between the claim and the locks.
            return Err(Error::IdNotFound);
        };
        let mut fresh = new.new_replay_buffer();
        replay.copy_to(&mut fresh);

        rd.cipher = old_rd.cipher.clone();
        rd.count = old_rd.count;
        wr.cipher = old_wr.cipher.clone();
        wr.count = old_wr.count;
        wr.replay = Some(fresh);

        // Drop the dead transport; the socket closes once both halves go.
        old_rd.transport.take();
        if let Some(mut transport) = old_wr.transport.take() {
            let _ = transport.shutdown().await;
        }

        let (id, secret, target_server) = {
            let state = self.state.lock().unwrap();
            (state.id, state.secret, state.target_server.clone())
        };
        let mut state = new.state.lock().unwrap();
        state.id = id;
        state.secret = secret;
        state.target_server = target_server;
        Ok(())
    }

    /// Terminates the session for good: wakes blocked I/O, closes the
    /// transport, and returns the replay ring to its pool. Idempotent.
    ///
    /// Registry bookkeeping is the owner's job; the session does not reach
    /// back into the registry.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
            self.frozen.notify_waiters();
        }
        self.reader.lock().await.transport.take();
        let mut wr = self.writer.lock().await;
        if let Some(mut transport) = wr.transport.take() {
            let _ = transport.shutdown().await;
        }
        if let Some(buf) = wr.replay.take() {
            self.recycle_replay_buffer(buf);
        }
    }
}

impl CipherReader {
    fn transport(&mut self) -> Result<&mut ReadHalf<BoxTransport>, Error> {
        self.transport.as_mut().ok_or(Error::Frozen)
    }
}

impl CipherWriter {
    fn transport(&mut self) -> Result<&mut WriteHalf<BoxTransport>, Error> {
        self.transport.as_mut().ok_or(Error::Frozen)
    }
}

impl Debug for Conn {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Conn")
            .field("id", &state.id)
            .field("lifecycle", &state.lifecycle)
            .field("handshakes", &state.handshakes)
            .field("reused", &state.reused)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use tokio::io::duplex;

    use super::*;

    fn test_config() -> Config {
        Config::new().with_reuse_buffer_size(64)
    }

    /// A connected client/server session pair over an in-memory pipe.
    fn pipe_pair(registry: &Arc<Registry>, config: &Config) -> (Arc<Conn>, Arc<Conn>) {
        let (near, far) = duplex(256 * 1024);
        let client = Conn::client(Box::new(near), config.clone());
        let server = Conn::server(Box::new(far), registry.clone(), config.clone());
        (client, server)
    }

    async fn read_full(conn: &Conn, want: usize) -> Vec<u8> {
        let mut out = vec![0u8; want];
        let mut got = 0;
        while got < want {
            got += conn.read(&mut out[got..]).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_new_session_happy_path() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);

        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();

        assert_eq!(client.id(), 1);
        assert_eq!(server.id(), 1);
        assert_eq!(client.lifecycle(), Lifecycle::Live);
        assert!(!server.is_reused());
        assert_eq!(client.secret(), server.secret());
        assert_ne!(client.secret(), Le64::default());

        // A handshake is idempotent once done.
        client.handshake().await.unwrap();

        assert_eq!(client.write(b"hello").await.unwrap(), 5);
        assert_eq!(read_full(&server, 5).await, b"hello");
        assert_eq!(client.bytes_sent().await, 5);
        assert_eq!(server.bytes_received().await, 5);

        // And the other direction.
        server.write(b"world").await.unwrap();
        assert_eq!(read_full(&client, 5).await, b"world");
    }

    #[tokio::test]
    async fn test_traffic_is_ciphered_on_the_wire() {
        let registry = Arc::new(Registry::new());
        let config = test_config();

        let (near, far) = duplex(256 * 1024);
        let client = Conn::client(Box::new(near), config.clone());
        let mut raw = far;
        let server_task = tokio::spawn(async move {
            // Speak the server side of the handshake by hand, then capture
            // the raw bytes the client sends.
            let req_payload = codec::read_record(&mut raw).await.unwrap();
            let req = match ClientHandshake::parse(&req_payload).unwrap() {
                ClientHandshake::New(req) => req,
                other => panic!("unexpected handshake {:?}", other),
            };
            let private = crypto::private_key();
            let resp = NewSessionResponse {
                id: 7,
                key: Le64::from_u64(crypto::public_key(private)),
                signature: None,
            };
            codec::write_record(&mut raw, &resp.marshal()).await.unwrap();
            let secret = Le64::from_u64(crypto::secret(private, req.key.to_u64()));

            let mut wire = [0u8; 5];
            raw.read_exact(&mut wire).await.unwrap();
            (secret, wire)
        });

        client.write(b"hello").await.unwrap();
        let (secret, mut wire) = server_task.await.unwrap();
        assert_ne!(&wire, b"hello", "plaintext leaked onto the wire");
        SessionKey::derive(secret).rc4().apply_keystream(&mut wire);
        assert_eq!(&wire, b"hello");
    }

    #[tokio::test]
    async fn test_signature_required_and_verified() {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]);
        let registry = Arc::new(Registry::new());

        let server_config = test_config().with_signing_key(signing.clone());
        let client_config = test_config().with_verify_key(signing.verifying_key());
        let (near, far) = duplex(64 * 1024);
        let client = Conn::client(Box::new(near), client_config);
        let server = Conn::server(Box::new(far), registry.clone(), server_config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();

        // A client configured to verify rejects an unsigned gateway.
        let registry = Arc::new(Registry::new());
        let client_config = test_config().with_verify_key(signing.verifying_key());
        let (near, far) = duplex(64 * 1024);
        let client = Conn::client(Box::new(near), client_config);
        let server = Conn::server(Box::new(far), registry, test_config());
        let (cr, _sr) = tokio::join!(client.handshake(), server.handshake());
        assert_eq!(cr, Err(Error::BadSignature));
    }

    #[tokio::test]
    async fn test_reuse_retransmits_the_gap() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        let id = server.id();
        registry.register(id, server.clone());

        // The server gets ten bytes out, the client only sees seven.
        server.write(b"0123456789").await.unwrap();
        assert_eq!(read_full(&client, 7).await, b"0123456");
        assert_eq!(client.bytes_received().await, 7);

        // Fresh transport, both sides re-handshake.
        let (near, far) = duplex(256 * 1024);
        let client2 = Conn::client_reusing(Box::new(near), config.clone(), &client)
            .await
            .unwrap();
        assert_eq!(client.lifecycle(), Lifecycle::Frozen);
        let server2 = Conn::server(Box::new(far), registry.clone(), config.clone());
        let (cr, sr) = tokio::join!(client2.handshake(), server2.handshake());
        cr.unwrap();
        sr.unwrap();

        assert_eq!(server2.id(), id);
        assert_eq!(client2.id(), id);
        assert!(server2.is_reused());
        assert!(client2.is_reused());
        assert_eq!(server2.handshakes(), 1);
        assert_eq!(server2.secret(), client2.secret());
        assert_eq!(server.lifecycle(), Lifecycle::Frozen);

        // The lost tail arrives exactly once, then traffic continues.
        assert_eq!(read_full(&client2, 3).await, b"789");
        server2.write(b"ab").await.unwrap();
        assert_eq!(read_full(&client2, 2).await, b"ab");
        assert_eq!(client2.bytes_received().await, 12);
    }

    #[tokio::test]
    async fn test_reuse_with_nothing_lost_retransmits_nothing() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        registry.register(server.id(), server.clone());

        server.write(b"abcd").await.unwrap();
        assert_eq!(read_full(&client, 4).await, b"abcd");
        client.write(b"xy").await.unwrap();
        assert_eq!(read_full(&server, 2).await, b"xy");

        let (near, far) = duplex(256 * 1024);
        let client2 = Conn::client_reusing(Box::new(near), config.clone(), &client)
            .await
            .unwrap();
        let server2 = Conn::server(Box::new(far), registry.clone(), config.clone());
        let (cr, sr) = tokio::join!(client2.handshake(), server2.handshake());
        cr.unwrap();
        sr.unwrap();

        // Both acknowledgements matched both sent counters.
        server2.write(b"!").await.unwrap();
        assert_eq!(read_full(&client2, 1).await, b"!");
        assert_eq!(client2.bytes_received().await, 5);
        assert_eq!(server2.bytes_sent().await, 5);
    }

    #[tokio::test]
    async fn test_reuse_at_exact_buffer_boundary() {
        let registry = Arc::new(Registry::new());
        let config = test_config(); // 64-byte ring
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        registry.register(server.id(), server.clone());

        // 80 bytes sent, 16 acknowledged: the 64-byte gap is exactly what
        // the ring still holds.
        let data: Vec<u8> = (0..80u8).collect();
        server.write(&data).await.unwrap();
        assert_eq!(read_full(&client, 16).await, &data[..16]);

        let (near, far) = duplex(256 * 1024);
        let client2 = Conn::client_reusing(Box::new(near), config.clone(), &client)
            .await
            .unwrap();
        let server2 = Conn::server(Box::new(far), registry.clone(), config.clone());
        let (cr, sr) = tokio::join!(client2.handshake(), server2.handshake());
        cr.unwrap();
        sr.unwrap();

        assert_eq!(read_full(&client2, 64).await, &data[16..]);
    }

    #[tokio::test]
    async fn test_reuse_gap_past_buffer_closes_session() {
        let registry = Arc::new(Registry::new());
        let config = test_config(); // 64-byte ring
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        let id = server.id();
        registry.register(id, server.clone());

        // 200 bytes sent, 100 acknowledged: gap 100 > 64.
        let data = vec![7u8; 200];
        server.write(&data).await.unwrap();
        assert_eq!(read_full(&client, 100).await, &data[..100]);

        let (near, far) = duplex(256 * 1024);
        let client2 = Conn::client_reusing(Box::new(near), config.clone(), &client)
            .await
            .unwrap();
        let server2 = Conn::server(Box::new(far), registry.clone(), config.clone());
        let (cr, sr) = tokio::join!(client2.handshake(), server2.handshake());
        assert_eq!(cr, Err(Error::NotAcceptable));
        assert_eq!(sr, Err(Error::NotAcceptable));

        // The id is gone for good; a later retry finds nothing.
        assert!(registry.lookup(id).is_none());
        assert_eq!(server.lifecycle(), Lifecycle::Closed);
        // And the id itself was recycled.
        assert_eq!(registry.acquire_id(), id);
    }

    #[tokio::test]
    async fn test_reuse_stale_handshake_counter_rejected() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        let id = server.id();
        registry.register(id, server.clone());
        let secret = server.secret();

        // A replayed capture: counter equal to the server's, valid MAC.
        let (mut near, far) = duplex(64 * 1024);
        let shell = Conn::server(Box::new(far), registry.clone(), config.clone());
        let mut req = ReuseSessionRequest {
            id,
            handshakes: 0,
            received: 0,
            sum: Le64::default(),
        };
        req.fill_sum(secret);
        codec::write_record(&mut near, &req.marshal()).await.unwrap();

        assert_eq!(shell.handshake().await, Err(Error::Expired));
        let resp =
            ReuseSessionResponse::parse(&codec::read_record(&mut near).await.unwrap()).unwrap();
        assert_eq!(resp.code, status::EXPIRED);
        // The session survives untouched for the legitimate client.
        assert!(registry.lookup(id).is_some());
    }

    #[tokio::test]
    async fn test_reuse_bad_mac_rejected_without_state_change() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        let id = server.id();
        registry.register(id, server.clone());

        let (mut near, far) = duplex(64 * 1024);
        let shell = Conn::server(Box::new(far), registry.clone(), config.clone());
        let req = ReuseSessionRequest {
            id,
            handshakes: 1,
            received: 0,
            sum: Le64::from_u64(0xbad), // wrong on purpose
        };
        codec::write_record(&mut near, &req.marshal()).await.unwrap();

        assert_eq!(shell.handshake().await, Err(Error::Unauthorized));
        let resp =
            ReuseSessionResponse::parse(&codec::read_record(&mut near).await.unwrap()).unwrap();
        assert_eq!(resp.code, status::UNAUTHORIZED);

        // No state changed: the handshake counter is untouched and a
        // legitimate reuse still goes through.
        assert_eq!(server.handshakes(), 0);
        assert_eq!(server.lifecycle(), Lifecycle::Live);
        let (near, far) = duplex(256 * 1024);
        let client2 = Conn::client_reusing(Box::new(near), config.clone(), &client)
            .await
            .unwrap();
        let server2 = Conn::server(Box::new(far), registry.clone(), config.clone());
        let (cr, sr) = tokio::join!(client2.handshake(), server2.handshake());
        cr.unwrap();
        sr.unwrap();
    }

    #[tokio::test]
    async fn test_reuse_unknown_id_rejected() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (mut near, far) = duplex(64 * 1024);
        let shell = Conn::server(Box::new(far), registry, config);
        let mut req = ReuseSessionRequest {
            id: 999,
            handshakes: 1,
            received: 0,
            sum: Le64::default(),
        };
        req.fill_sum(Le64::from_u64(1));
        codec::write_record(&mut near, &req.marshal()).await.unwrap();

        assert_eq!(shell.handshake().await, Err(Error::IdNotFound));
        let resp =
            ReuseSessionResponse::parse(&codec::read_record(&mut near).await.unwrap()).unwrap();
        assert_eq!(resp.code, status::ID_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_handshake_gets_400() {
        let registry = Arc::new(Registry::new());
        let (mut near, far) = duplex(64 * 1024);
        let shell = Conn::server(Box::new(far), registry, test_config());
        codec::write_record(&mut near, b"not a handshake").await.unwrap();

        assert_eq!(shell.handshake().await, Err(Error::IllegalMessage));
        let resp =
            ReuseSessionResponse::parse(&codec::read_record(&mut near).await.unwrap()).unwrap();
        assert_eq!(resp.code, status::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_zero_public_key_rejected() {
        let registry = Arc::new(Registry::new());
        let (mut near, far) = duplex(64 * 1024);
        let shell = Conn::server(Box::new(far), registry.clone(), test_config());
        let req = NewSessionRequest {
            key: Le64::from_u64(0),
            target_server: String::new(),
        };
        codec::write_record(&mut near, &req.marshal()).await.unwrap();

        assert_eq!(shell.handshake().await, Err(Error::IllegalMessage));
        // The acquired id went back: the next session starts from 1.
        assert_eq!(registry.acquire_id(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reuse_single_winner() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        let id = server.id();
        registry.register(id, server.clone());
        let secret = server.secret();

        // Two raced reuse attempts with the same counter.
        let attempt = |registry: Arc<Registry>, config: Config| async move {
            let (mut near, far) = duplex(64 * 1024);
            let shell = Conn::server(Box::new(far), registry, config);
            let mut req = ReuseSessionRequest {
                id,
                handshakes: 1,
                received: 0,
                sum: Le64::default(),
            };
            req.fill_sum(secret);
            codec::write_record(&mut near, &req.marshal()).await.unwrap();
            shell.handshake().await
        };
        let (a, b) = tokio::join!(
            attempt(registry.clone(), config.clone()),
            attempt(registry.clone(), config.clone())
        );

        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = outcomes.iter().find(|r| r.is_err()).unwrap();
        assert!(
            matches!(loser, Err(Error::Expired) | Err(Error::IdNotFound)),
            "loser got {:?}",
            loser
        );
    }

    #[tokio::test]
    async fn test_frozen_session_refuses_io_until_spliced() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();

        client.freeze().await;
        assert_eq!(client.lifecycle(), Lifecycle::Frozen);
        assert_eq!(client.write(b"x").await, Err(Error::Frozen));
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).await, Err(Error::Frozen));
        // The peer sees the transport drop as a freeze, not a close.
        assert_eq!(read_full_err(&server).await, Error::Io(std::io::ErrorKind::UnexpectedEof));
        assert_eq!(server.lifecycle(), Lifecycle::Frozen);
    }

    async fn read_full_err(conn: &Conn) -> Error {
        let mut buf = [0u8; 16];
        loop {
            if let Err(err) = conn.read(&mut buf).await {
                return err;
            }
        }
    }

    #[tokio::test]
    async fn test_freeze_wakes_blocked_reader() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();

        let reader = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                client.read(&mut buf).await
            })
        };
        // Let the reader park on the empty pipe, then freeze underneath it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.freeze().await;
        assert_eq!(reader.await.unwrap(), Err(Error::Frozen));
        drop(server);
    }

    #[tokio::test]
    async fn test_close_recycles_replay_buffer() {
        let pool = Arc::new(crate::replay_buffer::ReplayBufferPool::new(64));
        let registry = Arc::new(Registry::new());
        let config = test_config().with_replay_pool(pool.clone());
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();

        server.close().await;
        assert_eq!(server.lifecycle(), Lifecycle::Closed);
        // Closing twice is fine.
        server.close().await;

        // The ring went back to the pool cleared.
        let recycled = pool.get();
        assert_eq!(recycled.len(), 0);
    }

    #[tokio::test]
    async fn test_client_reusing_a_closed_session_fails() {
        let registry = Arc::new(Registry::new());
        let config = test_config();
        let (client, server) = pipe_pair(&registry, &config);
        let (cr, sr) = tokio::join!(client.handshake(), server.handshake());
        cr.unwrap();
        sr.unwrap();
        drop(server);

        client.close().await;
        let (near, _far) = duplex(1024);
        let result = Conn::client_reusing(Box::new(near), config, &client).await;
        assert!(matches!(result, Err(Error::NotAcceptable)));
    }
}
