//! Streaming UTF-8 assembly of token pieces.
//!
//! A single token can carry part of a multi-byte character. Pieces are fed
//! through one incremental decoder so the host only ever receives complete
//! characters; a fragment may therefore group several tokens.

use encoding_rs::{Decoder, UTF_8};

pub struct PieceAssembler {
    decoder: Decoder,
}

impl Default for PieceAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceAssembler {
    pub fn new() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
        }
    }

    /// Feed the bytes of one token. Returns the text that is now complete,
    /// which may be empty while a character is still split.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.decode(bytes, false)
    }

    /// Flush whatever is left at the end of a generation. A dangling partial
    /// character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        self.decode(&[], true)
    }

    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() + 4);
        let mut out = String::with_capacity(capacity);
        let (_result, _read, _had_errors) = self.decoder.decode_to_string(bytes, &mut out, last);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut asm = PieceAssembler::new();
        assert_eq!(asm.push(b"Hello"), "Hello");
        assert_eq!(asm.push(b" world"), " world");
        assert_eq!(asm.finish(), "");
    }

    #[test]
    fn test_split_character_is_grouped() {
        // "é" is 0xC3 0xA9, "世" is 0xE4 0xB8 0x96.
        let mut asm = PieceAssembler::new();
        assert_eq!(asm.push(&[b'c', b'a', b'f', 0xC3]), "caf");
        assert_eq!(asm.push(&[0xA9, 0xE4]), "é");
        assert_eq!(asm.push(&[0xB8]), "");
        assert_eq!(asm.push(&[0x96, b'!']), "世!");
    }

    #[test]
    fn test_dangling_bytes_flush_as_replacement() {
        let mut asm = PieceAssembler::new();
        assert_eq!(asm.push(&[b'a', 0xE4, 0xB8]), "a");
        assert_eq!(asm.finish(), "\u{FFFD}");
    }
}
