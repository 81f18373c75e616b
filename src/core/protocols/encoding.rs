//! Length-prefixed sentence framing shared by the binary API drivers.
//!
//! A word is a single length byte (0-255) followed by that many payload
//! bytes; a sentence is a run of words ended by a zero length byte. The
//! login exchanges this crate emits never exceed one-byte lengths, so the
//! decoder deliberately treats every length as a single byte. Do not extend
//! it to the multi-byte length forms; responses are bounded and the
//! single-byte reading is intentional.

use super::ProtocolError;

/// Append one length-prefixed word. Words longer than 255 bytes are
/// truncated; encoding never fails.
pub fn append_word(buf: &mut Vec<u8>, word: &str) {
    let mut bytes = word.as_bytes();
    if bytes.len() > 255 {
        bytes = &bytes[..255];
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

/// Encode a whole sentence, including the zero terminator.
pub fn encode_sentence(words: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for word in words {
        append_word(&mut buf, word);
    }
    buf.push(0x00);
    buf
}

/// Decode the words of one sentence. Stops at the zero terminator or the
/// end of the buffer; a word running past the buffer is a malformed frame.
pub fn decode_words(data: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let mut words = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 {
            break;
        }
        i += 1;
        if i + len > data.len() {
            return Err(ProtocolError::Protocol(format!(
                "malformed frame: word length {} exceeds remaining {} bytes",
                len,
                data.len() - i
            )));
        }
        words.push(String::from_utf8_lossy(&data[i..i + len]).into_owned());
        i += len;
    }

    Ok(words)
}
