//! WebFig session layer: key agreement, the web-safe byte transport and the
//! encrypted message exchange against the `/jsproxy` endpoint.
//!
//! The handshake is X25519 with a twist: both scalars and points are fed to
//! the scalar multiplication in byte-reversed form, and the shared secret is
//! reversed again afterwards. This matches what the WebFig client ships and
//! is load-bearing; a straight X25519 exchange does not interoperate.

use log::{debug, trace};
use rand::RngCore;
use sha1::{Digest, Sha1};
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};

use super::m2::M2Message;
use super::{classify_error_text, ProtocolError};

const KEYSTREAM_DROP: usize = 768;
const RX_KEY_ROLE: &[u8] =
    b"On the client side, this is the receive key; on the server side, it is the send key.";
const TX_KEY_ROLE: &[u8] =
    b"On the client side, this is the send key; on the server side, it is the receive key.";

pub(crate) fn reverse(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.reverse();
    out
}

/// Encode bytes for the web-safe transport: each byte becomes the character
/// with the equal code point, serialized as UTF-8, with NUL carried as the
/// two-byte sequence `C4 80`.
pub(crate) fn web_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        match b {
            0x00 => out.extend_from_slice(&[0xc4, 0x80]),
            b if b < 0x80 => out.push(b),
            b => {
                // Two-byte UTF-8 form of the code point equal to the byte.
                out.push(0xc0 | (b >> 6));
                out.push(0x80 | (b & 0x3f));
            }
        }
    }
    out
}

/// Inverse of `web_encode`: `C4 80` back to NUL, then each code point back
/// to its byte. Code points above 0xFF cannot appear in well-formed traffic
/// and collapse to `?`.
pub(crate) fn web_decode(data: &[u8]) -> Vec<u8> {
    let mut swapped = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0xc4 && i + 1 < data.len() && data[i + 1] == 0x80 {
            swapped.push(0x00);
            i += 2;
        } else {
            swapped.push(data[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&swapped)
        .chars()
        .map(|c| if (c as u32) <= 0xff { c as u32 as u8 } else { b'?' })
        .collect()
}

/// Plain RC4 keystream. Only lives inside this module; the session drops
/// the first 768 bytes of each stream before use, mirroring the peer.
pub(crate) struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub(crate) fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Rc4 { s, i: 0, j: 0 }
    }

    pub(crate) fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s
                [(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            out.push(byte ^ k);
        }
        out
    }

    fn skip(&mut self, n: usize) {
        self.process(&vec![0u8; n]);
    }
}

pub(crate) struct KeyPair {
    pub private: [u8; 32],
    pub public: [u8; 32],
}

pub(crate) fn generate_key_pair() -> KeyPair {
    let mut private = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut private);
    private[0] &= 248;
    private[31] &= 127;
    private[31] |= 64;
    KeyPair {
        private,
        public: public_for(&private),
    }
}

fn public_for(private: &[u8; 32]) -> [u8; 32] {
    let mut reversed = *private;
    reversed.reverse();
    x25519(reversed, X25519_BASEPOINT_BYTES)
}

pub(crate) fn generate_shared_key(private: &[u8; 32], server_public: &[u8]) -> Vec<u8> {
    let mut reversed_private = *private;
    reversed_private.reverse();
    let mut reversed_public = [0u8; 32];
    for (dst, src) in reversed_public.iter_mut().zip(server_public.iter().rev()) {
        *dst = *src;
    }
    reverse(&x25519(reversed_private, reversed_public))
}

fn derive_stream(shared: &[u8], role: &[u8]) -> Rc4 {
    let mut hasher = Sha1::new();
    hasher.update(shared);
    hasher.update([0u8; 40]);
    hasher.update(role);
    hasher.update([0xf2u8; 40]);
    let digest = hasher.finalize();
    let mut cipher = Rc4::new(&digest[..16]);
    cipher.skip(KEYSTREAM_DROP);
    cipher
}

/// One negotiated session: server-assigned id, running sequence and the two
/// directional ciphers. Sessions are single-use; the driver negotiates a
/// fresh one per authentication attempt.
pub(crate) struct WebfigSession {
    id: u32,
    seq: u32,
    rx: Rc4,
    tx: Rc4,
}

pub(crate) fn classify_reqwest_error(target: &str, err: &reqwest::Error) -> ProtocolError {
    if err.is_timeout() {
        return ProtocolError::Timeout;
    }
    if err.is_connect() {
        return ProtocolError::Connection {
            target: target.to_string(),
            detail: err.to_string(),
        };
    }
    classify_error_text(&err.to_string())
        .unwrap_or_else(|| ProtocolError::Transient(err.to_string()))
}

/// Run the key agreement against `url`. Returns `Ok(None)` when the peer
/// answers but not with a valid 40-byte handshake (treated as a credential
/// reject upstream), `Err` on transport failure.
pub(crate) async fn negotiate(
    client: &reqwest::Client,
    url: &str,
    target: &str,
    timeout: std::time::Duration,
) -> Result<Option<WebfigSession>, ProtocolError> {
    let pair = generate_key_pair();

    let mut payload = vec![0u8; 8];
    payload.extend_from_slice(&reverse(&pair.public));

    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .timeout(timeout)
        .body(web_encode(&payload))
        .send()
        .await
        .map_err(|e| classify_reqwest_error(target, &e))?;

    if response.status() != reqwest::StatusCode::OK {
        debug!("handshake refused with status {}", response.status());
        return Ok(None);
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| classify_reqwest_error(target, &e))?;
    let decoded = web_decode(&body);

    if decoded.len() != 40 {
        debug!("handshake response has {} bytes, expected 40", decoded.len());
        return Ok(None);
    }

    let id = u32::from_be_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]);
    let server_public = &decoded[8..40];
    let shared = generate_shared_key(&pair.private, server_public);

    trace!("negotiated session {id}");

    Ok(Some(WebfigSession {
        id,
        seq: 1,
        rx: derive_stream(&shared, RX_KEY_ROLE),
        tx: derive_stream(&shared, TX_KEY_ROLE),
    }))
}

/// Send one encrypted message and decrypt the reply.
pub(crate) async fn send_message(
    client: &reqwest::Client,
    url: &str,
    target: &str,
    timeout: std::time::Duration,
    session: &mut WebfigSession,
    msg: &M2Message,
) -> Result<M2Message, ProtocolError> {
    let mut plaintext = b"M2".to_vec();
    plaintext.extend_from_slice(&msg.serialize());
    plaintext.extend_from_slice(&[b' '; 8]);

    let encrypted = session.tx.process(&plaintext);

    let mut frame = Vec::with_capacity(8 + encrypted.len());
    frame.extend_from_slice(&session.id.to_be_bytes());
    frame.extend_from_slice(&session.seq.to_be_bytes());
    frame.extend_from_slice(&encrypted);

    session.seq = session.seq.wrapping_add(encrypted.len() as u32);

    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "msg")
        .timeout(timeout)
        .body(frame)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(target, &e))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(ProtocolError::Protocol(format!(
            "unexpected status code: {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| classify_reqwest_error(target, &e))?;
    if body.len() < 8 {
        return Err(ProtocolError::Protocol("response too short".to_string()));
    }

    let decrypted = session.rx.process(&body[8..]);
    if decrypted.len() < 8 {
        return Err(ProtocolError::Protocol("response body too short".to_string()));
    }
    let trimmed = &decrypted[..decrypted.len() - 8];

    M2Message::parse(trimmed)
        .ok_or_else(|| ProtocolError::Protocol("unparseable session response".to_string()))
}

/// Attempt a login over an established session. Authenticated iff the reply
/// carries string field 0x15.
pub(crate) async fn login(
    client: &reqwest::Client,
    url: &str,
    target: &str,
    timeout: std::time::Duration,
    session: &mut WebfigSession,
    username: &str,
    password: &str,
) -> Result<bool, ProtocolError> {
    let mut msg = M2Message::new();
    msg.add_string(1, username.as_bytes());
    msg.add_string(3, password.as_bytes());

    let reply = send_message(client, url, target, timeout, session, &msg).await?;
    Ok(reply.strings.contains_key(&0x15))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn reverse_handles_odd_and_even_lengths() {
        assert_eq!(reverse(&[]), Vec::<u8>::new());
        assert_eq!(reverse(&[1]), vec![1]);
        assert_eq!(reverse(&[1, 2, 3, 4]), vec![4, 3, 2, 1]);
        assert_eq!(reverse(&[1, 2, 3, 4, 5]), vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn web_transport_round_trips_all_bytes() {
        let all: Vec<u8> = (0u8..=255).collect();
        assert_eq!(web_decode(&web_encode(&all)), all);
    }

    #[test]
    fn web_encode_maps_nul_to_c4_80() {
        assert_eq!(web_encode(&[0x00]), vec![0xc4, 0x80]);
        assert_eq!(web_decode(&[0xc4, 0x80, 0xc4, 0x80]), vec![0x00, 0x00]);
        assert_eq!(
            web_decode(b"hello\xc4\x80world"),
            b"hello\x00world".to_vec()
        );
    }

    #[test]
    fn rc4_known_vector() {
        // Classic test vector: key "Key", plaintext "Plaintext".
        let mut cipher = Rc4::new(b"Key");
        let out = cipher.process(b"Plaintext");
        assert_eq!(out, unhex("bbf316e8d940af0ad3"));
    }

    #[test]
    fn rc4_is_symmetric() {
        let mut enc = Rc4::new(b"sixteen byte key");
        let mut dec = Rc4::new(b"sixteen byte key");
        let plaintext = b"M2 login payload        ";
        let encrypted = enc.process(plaintext);
        assert_ne!(encrypted, plaintext.to_vec());
        assert_eq!(dec.process(&encrypted), plaintext.to_vec());
    }

    #[test]
    fn public_key_matches_rfc7748_after_reversal() {
        // RFC 7748 section 5.2 scalar and its public key. The handshake
        // reverses the private key before the multiplication, so feeding the
        // pre-reversed scalar must reproduce the reference result.
        let scalar = unhex("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
        let mut private = [0u8; 32];
        private.copy_from_slice(&reverse(&scalar));

        let expected = unhex("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a");
        assert_eq!(public_for(&private).to_vec(), expected);
    }

    #[test]
    fn shared_key_matches_rfc7748_after_reversal() {
        let scalar_a = unhex("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
        let public_b = unhex("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f");
        let secret = unhex("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742");

        let mut private = [0u8; 32];
        private.copy_from_slice(&reverse(&scalar_a));

        let shared = generate_shared_key(&private, &reverse(&public_b));
        assert_eq!(shared, reverse(&secret));
    }

    #[test]
    fn derived_streams_differ_by_role() {
        let shared = vec![0x42u8; 32];
        let mut rx = derive_stream(&shared, RX_KEY_ROLE);
        let mut tx = derive_stream(&shared, TX_KEY_ROLE);
        assert_ne!(rx.process(&[0u8; 16]), tx.process(&[0u8; 16]));
    }

    #[test]
    fn generated_private_keys_are_clamped() {
        let pair = generate_key_pair();
        assert_eq!(pair.private[0] & 7, 0);
        assert_eq!(pair.private[31] & 0x80, 0);
        assert_eq!(pair.private[31] & 0x40, 0x40);
    }
}
