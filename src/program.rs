//! Assembled-program wire format.
//!
//! A persisted program is a sequence of 8-hex-digit words separated by
//! arbitrary whitespace, most significant byte first, one word per
//! instruction. The writer emits one word per line. The reader is strict:
//! a whitespace-delimited token that is not exactly eight hex digits is a
//! [`VmError::FormatError`] naming the token, never a silently truncated
//! program.

use crate::errors::VmError;
use crate::isa::WORD_HEX_DIGITS;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Parses wire-format text into an instruction stream.
pub fn parse_hex(text: &str) -> Result<Vec<u32>, VmError> {
    let mut words = Vec::new();
    for token in text.split_whitespace() {
        if token.len() != WORD_HEX_DIGITS || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VmError::FormatError {
                token: token.to_string(),
            });
        }
        let word = u32::from_str_radix(token, 16).map_err(|_| VmError::FormatError {
            token: token.to_string(),
        })?;
        words.push(word);
    }
    Ok(words)
}

/// Reads and parses a wire-format file.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u32>, VmError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| VmError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_hex(&text)
}

/// Writes an instruction stream in the wire format, one word per line.
pub fn write_hex<W: Write>(words: &[u32], out: &mut W) -> io::Result<()> {
    for word in words {
        writeln!(out, "{word:08x}")?;
    }
    Ok(())
}

/// Writes an instruction stream to a wire-format file.
pub fn write_file<P: AsRef<Path>>(words: &[u32], path: P) -> Result<(), VmError> {
    let path = path.as_ref();
    let mut text = Vec::with_capacity(words.len() * (WORD_HEX_DIGITS + 1));
    // infallible: Vec<u8> writes cannot error
    let _ = write_hex(words, &mut text);
    fs::write(path, text).map_err(|e| VmError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_input() {
        assert!(parse_hex("").unwrap().is_empty());
        assert!(parse_hex("  \n\t\n").unwrap().is_empty());
    }

    #[test]
    fn parse_newline_separated_words() {
        let words = parse_hex("0110000a\n00100000\n").unwrap();
        assert_eq!(words, vec![0x0110_000A, 0x0010_0000]);
    }

    #[test]
    fn parse_accepts_arbitrary_whitespace() {
        let words = parse_hex("  0110000a\t00100000  ").unwrap();
        assert_eq!(words.len(), 2);
    }

    #[test]
    fn parse_accepts_uppercase_digits() {
        assert_eq!(parse_hex("0110000A").unwrap(), vec![0x0110_000A]);
    }

    #[test]
    fn parse_rejects_short_runs() {
        let err = parse_hex("0110000").unwrap_err();
        assert!(matches!(err, VmError::FormatError { ref token } if token == "0110000"));
    }

    #[test]
    fn parse_rejects_long_runs() {
        let err = parse_hex("0110000aa").unwrap_err();
        assert!(matches!(err, VmError::FormatError { .. }));
    }

    #[test]
    fn parse_rejects_non_hex_tokens() {
        let err = parse_hex("0110000a wordsoup1").unwrap_err();
        assert!(matches!(err, VmError::FormatError { ref token } if token == "wordsoup1"));
    }

    #[test]
    fn write_then_parse_roundtrips() {
        let words = vec![0x0110_000A, 0x0710_0000, 0x0010_0000, 0xFFFF_FFFF];
        let mut text = Vec::new();
        write_hex(&words, &mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert_eq!(parse_hex(&text).unwrap(), words);
    }
}
