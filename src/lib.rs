//! Pure Rust WOFF2 decoder
//!
//! Decodes a WOFF2 file back into the SFNT (TrueType/OpenType) font or TTC font
//! collection it was encoded from. Malformed input is always rejected with a [`WuffErr`];
//! partial output is never returned.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let woff2 = std::fs::read("font.woff2")?;
//! let ttf = woff2_sfnt::decompress_woff2(&woff2)?;
//! std::fs::write("font.ttf", ttf)?;
//! # Ok(())
//! # }
//! ```
//!
//! Without the default `brotli` feature, bring your own decompressor with
//! [`decompress_woff2_with_custom_brotli`].

mod consistency;
mod decompress;
pub mod error;
mod sfnt_writer;
pub mod table_tags;
pub mod variable_length;
pub mod woff;

#[cfg(feature = "brotli")]
pub use decompress::decompress_woff2;
pub use decompress::{MAX_DECOMPRESSED_SIZE, decompress_woff2_with_custom_brotli};
pub use error::{ErrorKind, WuffErr};
pub use sfnt_writer::CHECKSUM_MAGIC;

/// A decoded glyph point
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Point {
    pub x: i32,
    pub y: i32,
    pub on_curve: bool,
}

/// Compute the OpenType checksum of `buf`: the wrapping sum of its big-endian u32 words
///
/// A length that isn't a multiple of 4 is treated as if padded to 4 with 0's.
///
/// <https://learn.microsoft.com/en-us/typography/opentype/spec/otff#calculating-checksums>
pub fn compute_checksum(buf: &[u8]) -> u32 {
    let mut checksum: u32 = 0;
    let mut iter = buf.chunks_exact(4);
    for chunk in &mut iter {
        checksum = checksum.wrapping_add(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    // Note(nico): as far as I can tell the zeroes don't actually effect the checksum except in that
    // they allow the trailing non-aligned bytes to take effect.
    let tail = match *iter.remainder() {
        [a, b, c] => u32::from_be_bytes([a, b, c, 0]),
        [a, b] => u32::from_be_bytes([a, b, 0, 0]),
        [a] => u32::from_be_bytes([a, 0, 0, 0]),
        _ => 0,
    };

    checksum.wrapping_add(tail)
}

// Round a value up to the nearest multiple of 4. Don't round the value in the
// case that rounding up overflows.
//
// Implemented as a macro to make it generic over the type without horrible type bounds
macro_rules! Round4 {
    ($value:expr) => {
        match $value.checked_add(3) {
            Some(value_plus_3) => value_plus_3 & !3,
            None => $value,
        }
    };
}
pub(crate) use Round4;
