//! GNU tar extensions: the pre-POSIX magic, base-256 numeric fields and the
//! long path/long link pseudo entries.

use crate::error::{Error, Result};
use super::helper::get_str;
use super::FilenameEncoding;

/// GNU magic "ustar " followed by the GNU version " \0".
pub const GNU_MAGIC: &[u8; 6] = b"ustar ";
pub const GNU_VERSION: &[u8; 2] = b" \0";

/// Largest value a base-256 field may carry, integers above it lose precision
/// in most consumers of the format.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Tells if the numeric field uses the base-256 encoding (high bit set).
pub(crate) fn is_base256(buf: &[u8]) -> bool {
    buf.first().is_some_and(|b| b & 0x80 != 0)
}

/// Tells if the value fits the big-endian magnitude of a field of the given width.
pub(crate) fn fits_base256(value: u64, width: usize) -> bool {
    let magnitude = width - 1;
    magnitude >= 8 || value >> (magnitude * 8) == 0
}

/// Writes the value as a base-256 field: the high bit of the first byte is set and
/// the remaining bytes hold the big-endian magnitude.
///
/// # Arguments
/// * `dst` - The numeric field.
/// * `value` - The value to write.
///
/// # Returns
/// * `true` - The value was written.
/// * `false` - The magnitude does not fit, the field is left untouched.
pub(crate) fn encode_base256(dst: &mut [u8], value: u64) -> bool {
    let width = dst.len();
    if !fits_base256(value, width) {
        return false;
    }
    dst.fill(0);
    dst[0] = 0x80;
    let mut rest = value;
    for byte in dst[1..].iter_mut().rev() {
        *byte = (rest & 0xff) as u8;
        rest >>= 8;
    }
    true
}

/// Decodes a base-256 field, ignoring the marker bit.
///
/// # Arguments
/// * `buf` - The numeric field.
///
/// # Returns
/// * `Ok(u64)` - The decoded magnitude.
/// * `Err(Error::UnsafeNumericEncoding)` - The magnitude exceeds [`MAX_SAFE_INTEGER`].
pub(crate) fn decode_base256(buf: &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        let byte = if i == 0 { byte & 0x7f } else { byte };
        value = value
            .checked_mul(256)
            .and_then(|v| v.checked_add(byte as u64))
            .filter(|v| *v <= MAX_SAFE_INTEGER)
            .ok_or(Error::UnsafeNumericEncoding)?;
    }
    Ok(value)
}

/// Decodes the body of a GNU long path or long link pseudo entry.
///
/// The body is a NUL terminated filename, anything after the first NUL is padding.
pub(crate) fn decode_long_path(buf: &[u8], encoding: FilenameEncoding) -> String {
    encoding.decode(get_str(buf))
}
