//! Handshake message codec.
//!
//! Every handshake record is a `u16` big-endian length followed by a UTF-8
//! payload of newline-separated fields. 64-bit binary values travel as
//! padded standard base64 over their 8 little-endian bytes; the optional
//! response signature travels as `<base64 r>:<base64 s>`.

use std::io;
use std::str;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{hash64, mac, Le64};
use crate::error::Error;

/// Reads one length-prefixed handshake record.
pub(crate) async fn read_record<R>(rd: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = rd.read_u16().await?;
    let mut payload = vec![0u8; len as usize];
    rd.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes one length-prefixed handshake record.
pub(crate) async fn write_record<W>(wr: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(payload.len() <= u16::MAX as usize);
    wr.write_u16(payload.len() as u16).await?;
    wr.write_all(payload).await?;
    wr.flush().await
}

fn encode_le64(v: Le64) -> String {
    BASE64.encode(v.as_bytes())
}

fn decode_le64(field: &str) -> Result<Le64, Error> {
    let bytes = BASE64.decode(field).map_err(|_| Error::IllegalMessage)?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::IllegalMessage)?;
    Ok(Le64::from(raw))
}

fn parse_u32(field: &str) -> Result<u32, Error> {
    field.parse().map_err(|_| Error::IllegalMessage)
}

fn parse_u64(field: &str) -> Result<u64, Error> {
    field.parse().map_err(|_| Error::IllegalMessage)
}

/// Client request to open a fresh session. The leading id line is the
/// reserved value `0`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct NewSessionRequest {
    pub(crate) key: Le64,
    pub(crate) target_server: String,
}

impl NewSessionRequest {
    pub(crate) fn marshal(&self) -> Vec<u8> {
        let mut s = format!("0\n{}", encode_le64(self.key));
        if !self.target_server.is_empty() {
            s.push('\n');
            s.push_str(&self.target_server);
        }
        s.into_bytes()
    }

    pub(crate) fn parse(payload: &[u8]) -> Result<Self, Error> {
        let text = str::from_utf8(payload).map_err(|_| Error::IllegalMessage)?;
        let mut lines = text.split('\n');
        let id = parse_u32(lines.next().ok_or(Error::IllegalMessage)?)?;
        if id != 0 {
            return Err(Error::IllegalMessage);
        }
        let key = decode_le64(lines.next().ok_or(Error::IllegalMessage)?)?;
        let target_server = lines.next().unwrap_or("").to_string();
        Ok(Self { key, target_server })
    }
}

/// Server reply to a new-session request, optionally signed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct NewSessionResponse {
    pub(crate) id: u32,
    pub(crate) key: Le64,
    /// `(r, s)` halves of the signature over the first two lines.
    pub(crate) signature: Option<(Vec<u8>, Vec<u8>)>,
}

impl NewSessionResponse {
    fn signed_content(&self) -> String {
        format!("{}\n{}\n", self.id, encode_le64(self.key))
    }

    /// Attaches the signature trailer.
    pub(crate) fn sign(&mut self, key: &SigningKey) {
        let sig = key.sign(self.signed_content().as_bytes()).to_bytes();
        self.signature = Some((sig[..32].to_vec(), sig[32..].to_vec()));
    }

    /// Verifies the trailer when a verification key is configured. A
    /// missing or malformed trailer is as fatal as a bad signature.
    pub(crate) fn verify_signature(&self, key: Option<&VerifyingKey>) -> Result<(), Error> {
        let Some(key) = key else {
            return Ok(());
        };
        let Some((r, s)) = &self.signature else {
            return Err(Error::BadSignature);
        };
        if r.len() != 32 || s.len() != 32 {
            return Err(Error::BadSignature);
        }
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(r);
        raw[32..].copy_from_slice(s);
        let sig = Signature::from_bytes(&raw);
        key.verify(self.signed_content().as_bytes(), &sig)
            .map_err(|_| Error::BadSignature)
    }

    pub(crate) fn marshal(&self) -> Vec<u8> {
        let s = match &self.signature {
            None => format!("{}\n{}", self.id, encode_le64(self.key)),
            Some((r, s)) => format!(
                "{}\n{}\n{}:{}",
                self.id,
                encode_le64(self.key),
                BASE64.encode(r),
                BASE64.encode(s)
            ),
        };
        s.into_bytes()
    }

    pub(crate) fn parse(payload: &[u8]) -> Result<Self, Error> {
        let text = str::from_utf8(payload).map_err(|_| Error::IllegalMessage)?;
        let mut lines = text.split('\n');
        let id = parse_u32(lines.next().ok_or(Error::IllegalMessage)?)?;
        let key = decode_le64(lines.next().ok_or(Error::IllegalMessage)?)?;
        let signature = match lines.next() {
            None | Some("") => None,
            Some(trailer) => {
                let (r, s) = trailer.split_once(':').ok_or(Error::IllegalMessage)?;
                let r = BASE64.decode(r).map_err(|_| Error::IllegalMessage)?;
                let s = BASE64.decode(s).map_err(|_| Error::IllegalMessage)?;
                Some((r, s))
            }
        };
        Ok(Self { id, key, signature })
    }
}

/// Client request to attach a fresh transport to an existing session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReuseSessionRequest {
    pub(crate) id: u32,
    pub(crate) handshakes: u32,
    pub(crate) received: u64,
    pub(crate) sum: Le64,
}

impl ReuseSessionRequest {
    fn mac_input(&self) -> String {
        format!("{}\n{}\n{}\n", self.id, self.handshakes, self.received)
    }

    fn compute_sum(&self, secret: Le64) -> Le64 {
        mac(hash64(self.mac_input().as_bytes()), secret)
    }

    /// Stamps the MAC binding this request to the session secret.
    pub(crate) fn fill_sum(&mut self, secret: Le64) {
        self.sum = self.compute_sum(secret);
    }

    pub(crate) fn verify_sum(&self, secret: Le64) -> bool {
        self.sum == self.compute_sum(secret)
    }

    pub(crate) fn marshal(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}",
            self.id,
            self.handshakes,
            self.received,
            encode_le64(self.sum)
        )
        .into_bytes()
    }

    pub(crate) fn parse(payload: &[u8]) -> Result<Self, Error> {
        let text = str::from_utf8(payload).map_err(|_| Error::IllegalMessage)?;
        let mut lines = text.split('\n');
        let id = parse_u32(lines.next().ok_or(Error::IllegalMessage)?)?;
        let handshakes = parse_u32(lines.next().ok_or(Error::IllegalMessage)?)?;
        let received = parse_u64(lines.next().ok_or(Error::IllegalMessage)?)?;
        let sum = decode_le64(lines.next().ok_or(Error::IllegalMessage)?)?;
        Ok(Self {
            id,
            handshakes,
            received,
            sum,
        })
    }
}

/// Server reply to a reuse request: its own received count and a status
/// code, plus a MAC once the server knows which secret to key it with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReuseSessionResponse {
    pub(crate) received: u64,
    pub(crate) code: u16,
    pub(crate) sum: Le64,
}

impl ReuseSessionResponse {
    fn mac_input(&self) -> String {
        format!("{}\n{}\n", self.received, self.code)
    }

    fn compute_sum(&self, secret: Le64) -> Le64 {
        mac(hash64(self.mac_input().as_bytes()), secret)
    }

    pub(crate) fn fill_sum(&mut self, secret: Le64) {
        self.sum = self.compute_sum(secret);
    }

    pub(crate) fn marshal(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}",
            self.received,
            self.code,
            encode_le64(self.sum)
        )
        .into_bytes()
    }

    pub(crate) fn parse(payload: &[u8]) -> Result<Self, Error> {
        let text = str::from_utf8(payload).map_err(|_| Error::IllegalMessage)?;
        let mut lines = text.split('\n');
        let received = parse_u64(lines.next().ok_or(Error::IllegalMessage)?)?;
        let code = lines
            .next()
            .ok_or(Error::IllegalMessage)?
            .parse()
            .map_err(|_| Error::IllegalMessage)?;
        let sum = decode_le64(lines.next().ok_or(Error::IllegalMessage)?)?;
        Ok(Self {
            received,
            code,
            sum,
        })
    }
}

/// The first record a server reads: either handshake flavor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ClientHandshake {
    /// Open a fresh session.
    New(NewSessionRequest),
    /// Attach to an existing one.
    Reuse(ReuseSessionRequest),
}

impl ClientHandshake {
    /// A leading `0` id line means a new session; anything else is a
    /// reuse attempt.
    pub(crate) fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.starts_with(b"0\n") {
            Ok(ClientHandshake::New(NewSessionRequest::parse(payload)?))
        } else {
            Ok(ClientHandshake::Reuse(ReuseSessionRequest::parse(payload)?))
        }
    }
}
