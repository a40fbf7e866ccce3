//! Sconwire is a gateway implementation of the Stable Connection Protocol
//! (SCP): a thin session layer over ordinary byte transports that lets a
//! client transparently recover a live session after its transport dies.
//!
//! When a client's network drops, the gateway does not tear the backend
//! connection down. The session freezes for a bounded grace period; the
//! client re-dials over a fresh transport, presents credentials bound to
//! the lost session, and the gateway splices the new transport onto the
//! still-open backend connection, retransmitting whatever the peer had not
//! acknowledged. Neither side loses a byte and the backend application
//! never observes the reconnect.
//!
//! ## Interfaces
//!
//! * [`Conn`]
//!
//!   The session record: the identity agreed during the handshake, both
//!   cipher directions with their byte counters, the replay ring, and the
//!   current transport. `Conn` drives both handshake flavors itself and
//!   can be used directly for the client side of the protocol, or to embed
//!   the server side somewhere other than the bundled gateway.
//!
//! * [`Gateway`]
//!
//!   The ready-to-run server surface: a TCP accept loop that handshakes
//!   every inbound transport, dials a backend through an [`Upstream`], and
//!   pumps the pair until it finishes. Transport replacement, grace
//!   timing and retransmission happen inside; backends just see one
//!   long-lived connection.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sconwire::{Config, Gateway, StaticUpstream};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let upstream = StaticUpstream::new()
//!         .with_host("lobby", "127.0.0.1:4000".parse().unwrap());
//!     let gateway = Gateway::new(Arc::new(upstream), Config::new());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:1248").await?;
//!     gateway.serve(listener).await;
//!     Ok(())
//! }
//! ```
//!
//! On the client side, open a session with [`Conn::client`]; when the
//! transport dies, dial again and hand the dead session to
//! [`Conn::client_reusing`] — the replacement handshake and both-direction
//! retransmission run on first use.
//!
//! ## Security model
//!
//! The handshake agrees on a shared secret through a 64-bit Diffie-Hellman
//! exchange and authenticates reuse attempts with a MAC bound to that
//! secret; traffic is ciphered with RC4 keyed from the secret. This is
//! obfuscation and integrity for short-lived sessions, not confidentiality
//! against a capable adversary — do not put plaintext secrets on the wire
//! because of it. Gateways may additionally sign their new-session
//! responses ([`Config::with_signing_key`]) so clients can reject
//! impostors ([`Config::with_verify_key`]).
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod codec;
mod crypto;
mod gateway;
mod pump;
mod registry;
mod replay_buffer;
mod session;
mod stream;
mod transport;

pub use config::Config;
pub use error::Error;

pub use gateway::{ConnectFuture, Gateway, StaticUpstream, Upstream};
pub use pump::{pump, PumpReport, NET_BUFFER_SIZE};
pub use registry::{IdAllocator, Registry};
pub use replay_buffer::{ReplayBuffer, ReplayBufferPool};
pub use session::{Conn, Lifecycle};
pub use stream::StableStream;
pub use transport::{BoxTransport, Transport};
