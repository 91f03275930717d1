//! UTF-8 assembly for token pieces
//!
//! Engines hand back raw bytes per token. A multibyte character is often
//! split across two or more tokens, and some vocabularies contain byte
//! tokens that are not valid UTF-8 on their own. Every string that leaves
//! the scheduler goes through this module.

/// Replace malformed sequences in `bytes` with U+FFFD.
pub fn sanitize(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Incremental decoder that holds back an incomplete trailing sequence
/// until the bytes completing it arrive.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token piece and return the text that is now complete.
    ///
    /// The result may be empty when the piece only starts a multibyte
    /// character.
    pub fn push(&mut self, piece: &[u8]) -> String {
        self.pending.extend_from_slice(piece);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete tail: keep it for the next piece
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still pending, replacing an unfinished sequence.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let text = sanitize(&self.pending);
        self.pending.clear();
        text
    }

    /// Whether an incomplete sequence is being held back
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"Hello"), "Hello");
        assert_eq!(asm.push(b", world"), ", world");
        assert!(!asm.has_pending());
    }

    #[test]
    fn test_two_byte_char_split_across_pieces() {
        // "é" = C3 A9
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"caf\xC3"), "caf");
        assert!(asm.has_pending());
        assert_eq!(asm.push(b"\xA9!"), "\u{e9}!");
        assert!(!asm.has_pending());
    }

    #[test]
    fn test_four_byte_char_split_three_ways() {
        let bytes = "\u{1F600}".as_bytes();
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(&bytes[..1]), "");
        assert_eq!(asm.push(&bytes[1..3]), "");
        assert_eq!(asm.push(&bytes[3..]), "\u{1F600}");
    }

    #[test]
    fn test_malformed_bytes_are_replaced() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"a\xFFb"), "a\u{FFFD}b");
        // A lone continuation byte
        assert_eq!(asm.push(b"\x80"), "\u{FFFD}");
    }

    #[test]
    fn test_finish_replaces_dangling_sequence() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"x\xE2\x82"), "x");
        assert_eq!(asm.finish(), "\u{FFFD}");
        assert_eq!(asm.finish(), "");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(b"ok"), "ok");
        assert_eq!(sanitize(b"\xC3("), "\u{FFFD}(");
    }
}
