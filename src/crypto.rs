//! Crypto primitives.
//!
//! This module provides the 64-bit Diffie-Hellman group used by the
//! handshake, the rolling 64-bit hash and MD5-folded MAC that authenticate
//! reuse requests, and the RC4 keystream that ciphers session traffic.
//!
//! None of this aims at confidentiality against a determined cryptanalyst.
//! The constructions are fixed by the wire protocol and sized for
//! obfuscation and integrity of short-lived sessions.

use core::fmt::{Debug, Formatter};

use md5::{Digest, Md5};
use rand::{rngs::OsRng, TryRngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// DH-64 prime modulus.
const DH_P: u64 = 0xffff_ffff_ffff_ffc5;

/// DH-64 generator.
const DH_G: u64 = 5;

/// A 64-bit value in its little-endian wire representation.
///
/// Public keys, shared secrets, MACs and hashes all travel as the base64
/// encoding of these 8 bytes.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub(crate) struct Le64([u8; 8]);

impl Le64 {
    /// Wraps a `u64` in wire order.
    pub(crate) fn from_u64(v: u64) -> Self {
        Self(v.to_le_bytes())
    }

    /// The numeric value.
    pub(crate) fn to_u64(self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    /// The raw wire bytes.
    pub(crate) fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub(crate) fn set_low(&mut self, v: u32) {
        self.0[..4].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn set_high(&mut self, v: u32) {
        self.0[4..].copy_from_slice(&v.to_le_bytes());
    }
}

impl From<u64> for Le64 {
    fn from(v: u64) -> Self {
        Self::from_u64(v)
    }
}

impl From<[u8; 8]> for Le64 {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl Debug for Le64 {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "Le64({:#018x})", self.to_u64())
    }
}

/// Modular multiplication over `DH_P` via the Russian-peasant loop.
/// A plain `a * b` would overflow 64 bits.
fn mul_mod_p(mut a: u64, mut b: u64) -> u64 {
    let mut m: u64 = 0;
    while b > 0 {
        if b & 1 > 0 {
            let t = DH_P - a;
            if m >= t {
                m -= t;
            } else {
                m += a;
            }
        }
        if a >= DH_P - a {
            // 2a - p stays below p, so the wrap cancels out.
            a = a.wrapping_mul(2).wrapping_sub(DH_P);
        } else {
            a *= 2;
        }
        b >>= 1;
    }
    m
}

fn pow_mod_p(a: u64, b: u64) -> u64 {
    if b == 1 {
        return a;
    }
    let mut t = pow_mod_p(a, b >> 1);
    t = mul_mod_p(t, t);
    if b % 2 > 0 {
        t = mul_mod_p(t, a);
    }
    t
}

/// # Panics
///
/// Zero operands indicate corrupted local state; remote input is validated
/// before it reaches this point.
fn pow_mod(a: u64, b: u64) -> u64 {
    assert!(a != 0, "dh64: zero base");
    assert!(b != 0, "dh64: zero exponent");
    let a = if a > DH_P { a % DH_P } else { a };
    pow_mod_p(a, b)
}

/// Returns a fresh random DH-64 private key. Never zero.
pub(crate) fn private_key() -> u64 {
    loop {
        let key = OsRng
            .try_next_u64()
            .expect("system random source failure");
        if key != 0 {
            return key;
        }
    }
}

/// The public key corresponding to `private`.
pub(crate) fn public_key(private: u64) -> u64 {
    pow_mod(DH_G, private)
}

/// The shared secret from our private key and the peer's public key.
pub(crate) fn secret(private: u64, peer_public: u64) -> u64 {
    pow_mod(peer_public, private)
}

/// The 64-bit rolling hash over a byte string: a DJB hash (seed 5381) in
/// the low half and a JS hash (seed 1315423911) in the high half.
pub(crate) fn hash64(s: &[u8]) -> Le64 {
    let mut djb: u32 = 5381;
    let mut js: u32 = 1_315_423_911;

    for &c in s {
        djb = djb.wrapping_add((djb << 5).wrapping_add(c as u32));
        js ^= (js << 5).wrapping_add(c as u32).wrapping_add(js >> 2);
    }

    let mut v = Le64::default();
    v.set_low(djb);
    v.set_high(js);
    v
}

/// The session MAC: MD5 over `x ‖ y` repeated to 48 bytes, folded to 64
/// bits by XORing the two digest halves.
///
/// Despite its role this is not HMAC; the construction is fixed by the
/// wire protocol.
pub(crate) fn mac(x: Le64, y: Le64) -> Le64 {
    let mut block = [0u8; 48];
    block[..8].copy_from_slice(x.as_bytes());
    block[8..16].copy_from_slice(y.as_bytes());
    let (head, tail) = block.split_at_mut(16);
    tail[..16].copy_from_slice(head);
    tail[16..].copy_from_slice(head);

    let sum: [u8; 16] = Md5::digest(block).into();
    let a = u64::from_le_bytes(sum[..8].try_into().unwrap());
    let b = u64::from_le_bytes(sum[8..].try_into().unwrap());
    Le64::from_u64(a ^ b)
}

/// A 256-bit RC4 key expanded from a session secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKey([u8; 32]);

impl SessionKey {
    /// Expands `secret` into the four MAC-derived words that key a
    /// direction's RC4 state.
    pub(crate) fn derive(secret: Le64) -> Self {
        let mut key = [0u8; 32];
        for i in 0..4u64 {
            let word = mac(secret, Le64::from_u64(i));
            key[(i as usize) * 8..][..8].copy_from_slice(word.as_bytes());
        }
        Self(key)
    }

    /// Generates an invalid key, used as a placeholder before the handshake
    /// derives the real one. Filled with random data so accidental use
    /// never yields a predictable keystream.
    pub(crate) fn dumb() -> Self {
        let mut key = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut key)
            .expect("system random source failure");
        Self(key)
    }

    /// A fresh RC4 state keyed with this key.
    pub(crate) fn rc4(&self) -> Rc4 {
        Rc4::with_key(&self.0)
    }
}

impl Debug for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("SessionKey").field(&"*****").finish()
    }
}

/// RC4 keystream state.
///
/// `Clone` is load-bearing: splicing a session onto a replacement transport
/// deep-copies both directions' cipher states so the keystream continues
/// exactly where the lost transport left off.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub(crate) fn with_key(key: &[u8]) -> Self {
        debug_assert!(!key.is_empty() && key.len() <= 256);
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    /// XORs the keystream over `data` in place, advancing the state.
    pub(crate) fn apply_keystream(&mut self, data: &mut [u8]) {
        for b in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *b ^= self.s[k as usize];
        }
    }
}

impl Debug for Rc4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Rc4").field(&"*****").finish()
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::*;

    #[test]
    fn test_mul_mod_p_matches_wide_arithmetic() {
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let a = rng.random_range(1..DH_P);
            let b = rng.random_range(1..DH_P);
            let expect = ((a as u128 * b as u128) % DH_P as u128) as u64;
            assert_eq!(mul_mod_p(a, b), expect, "a={} b={}", a, b);
        }
    }

    #[test]
    fn test_public_key_of_one_is_generator() {
        assert_eq!(public_key(1), DH_G);
    }

    #[test]
    fn test_key_exchange_agrees() {
        for _ in 0..100 {
            let a = private_key();
            let b = private_key();
            let shared_a = secret(a, public_key(b));
            let shared_b = secret(b, public_key(a));
            assert_eq!(shared_a, shared_b);
            assert_ne!(shared_a, 0);
        }
    }

    #[test]
    #[should_panic]
    fn test_zero_private_key_panics() {
        public_key(0);
    }

    #[test]
    fn test_hash64_seeds() {
        // An empty input yields the bare seeds.
        let h = hash64(b"");
        assert_eq!(h.to_u64() as u32, 5381);
        assert_eq!((h.to_u64() >> 32) as u32, 1_315_423_911);
    }

    #[test]
    fn test_hash64_discriminates() {
        assert_eq!(hash64(b"stable"), hash64(b"stable"));
        assert_ne!(hash64(b"stable"), hash64(b"stables"));
        assert_ne!(hash64(b"ab"), hash64(b"ba"));
    }

    #[test]
    fn test_mac_deterministic() {
        let x = Le64::from_u64(0x1122_3344_5566_7788);
        let y = Le64::from_u64(42);
        assert_eq!(mac(x, y), mac(x, y));
        assert_ne!(mac(x, y), mac(y, x));
    }

    #[test]
    fn test_rc4_known_vector() {
        // RC4("Key", "Plaintext") = bb f3 16 e8 d9 40 af 0a d3
        let mut cipher = Rc4::with_key(b"Key");
        let mut data = *b"Plaintext";
        cipher.apply_keystream(&mut data);
        assert_eq!(
            data,
            [0xbb, 0xf3, 0x16, 0xe8, 0xd9, 0x40, 0xaf, 0x0a, 0xd3]
        );
    }

    #[test]
    fn test_rc4_round_trip() {
        let key = SessionKey::derive(Le64::from_u64(0xdead_beef));
        let mut enc = key.rc4();
        let mut dec = key.rc4();

        let mut rng = rand::rng();
        let mut plain = vec![0u8; 4096];
        rng.fill(plain.as_mut_slice());

        // Uneven chunking must not disturb the keystream.
        let mut wire = plain.clone();
        let (a, b) = wire.split_at_mut(1234);
        enc.apply_keystream(a);
        enc.apply_keystream(b);
        dec.apply_keystream(&mut wire);
        assert_eq!(wire, plain);
    }

    #[test]
    fn test_rc4_clone_continues_keystream() {
        let key = SessionKey::derive(Le64::from_u64(7));
        let mut original = key.rc4();
        let mut reference = key.rc4();

        let mut head = [0u8; 100];
        original.apply_keystream(&mut head);
        let mut expect = [0u8; 200];
        reference.apply_keystream(&mut expect);

        // The clone picks up exactly where the original stands.
        let mut copy = original.clone();
        let mut tail = [0u8; 100];
        copy.apply_keystream(&mut tail);
        assert_eq!(&tail[..], &expect[100..]);
    }

    #[test]
    fn test_session_keys_differ_per_secret() {
        let a = SessionKey::derive(Le64::from_u64(1));
        let b = SessionKey::derive(Le64::from_u64(2));
        let mut data_a = [0u8; 16];
        let mut data_b = [0u8; 16];
        a.rc4().apply_keystream(&mut data_a);
        b.rc4().apply_keystream(&mut data_b);
        assert_ne!(data_a, data_b);
    }
}
