//! Whitespace tokenizer
//!
//! Splits on the single ASCII space. Runs of spaces are not collapsed, so
//! `"a  b"` yields an empty token between `a` and `b`, and the remainder after
//! the last space is always emitted, which makes `tokenize("")` return one
//! empty token.

/// Token delimiter
pub const DELIMITER: char = ' ';

/// Split `input` into tokens borrowed from it, in left-to-right order
pub fn tokenize(input: &str) -> Vec<&str> {
    input.split(DELIMITER).collect()
}
