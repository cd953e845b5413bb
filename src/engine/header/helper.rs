use crate::error::{Error, Result};
use super::gnu;

// Helper to extract the bytes of a null-terminated field
pub(crate) fn get_str(buf: &[u8]) -> &[u8] {
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..nul]
}

// Helper to parse numeric fields, octal text or GNU base-256
pub(crate) fn parse_numeric<T>(buf: &[u8]) -> Result<T>
where
    T: num_traits::Num + num_traits::NumCast,
{
    if gnu::is_base256(buf) {
        let value = gnu::decode_base256(buf)?;
        return <T as num_traits::NumCast>::from(value)
            .ok_or_else(|| Error::MalformedHeader(format!("base-256 value {} overflows its field type", value)));
    }
    parse_octal(buf)
}

// Helper to parse octal strings, older tars prefix the digits with spaces
pub(crate) fn parse_octal<T: num_traits::Num>(buf: &[u8]) -> Result<T> {
    let start = buf.iter().position(|&b| b != b' ').unwrap_or(buf.len());
    let digits = &buf[start..];
    let end = digits.iter().position(|&b| b == b' ' || b == 0).unwrap_or(digits.len());
    let digits = &digits[..end];
    if digits.is_empty() {
        return Ok(T::zero());
    }
    let s = std::str::from_utf8(digits)
        .map_err(|_| Error::MalformedHeader(format!("invalid octal field {:?}", digits)))?;
    T::from_str_radix(s, 8).map_err(|_| Error::MalformedHeader(format!("invalid octal: {}", s)))
}

// Helper to write a string (null-terminated when it fits)
pub(crate) fn put_str(dst: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
    if len < dst.len() {
        // Null-terminate if possible
        dst[len..].fill(0);
    }
}

/// Tells whether the value fits the octal digits of a field of the given width.
pub(crate) fn fits_octal(value: u64, width: usize) -> bool {
    let digits = (width - 1) as u32;
    digits >= 22 || value < 8u64.pow(digits)
}

/// Tells whether the value can be stored in the field at all.
pub(crate) fn fits_numeric(value: u64, width: usize, allow_gnu_extension: bool) -> bool {
    fits_octal(value, width) || (allow_gnu_extension && gnu::fits_base256(value, width))
}

// Helper to write octal numbers as zero padded digits followed by a space
pub(crate) fn put_octal(dst: &mut [u8], value: u64) -> bool {
    let width = dst.len();
    if !fits_octal(value, width) {
        return false;
    }
    let s = format!("{:0width$o} ", value, width = width - 1);
    dst.copy_from_slice(s.as_bytes());
    true
}

/// Writes a numeric field: octal when it fits, base-256 when the GNU extension is
/// allowed, otherwise the largest octal value the field can hold.
pub(crate) fn put_numeric(dst: &mut [u8], value: u64, allow_gnu_extension: bool) {
    if put_octal(dst, value) {
        return;
    }
    if allow_gnu_extension && gnu::encode_base256(dst, value) {
        return;
    }
    let width = dst.len();
    dst[..width - 1].fill(b'7');
    dst[width - 1] = b' ';
}

/// Sums the header block with the checksum field counted as spaces.
pub(crate) fn checksum(block: &[u8; 512]) -> u64 {
    let head: u64 = block[..148].iter().map(|&b| b as u64).sum();
    let tail: u64 = block[156..].iter().map(|&b| b as u64).sum();
    head + 8 * b' ' as u64 + tail
}

/// Writes the checksum as six octal digits, a NUL and a space.
pub(crate) fn put_checksum(block: &mut [u8; 512]) {
    let sum = checksum(block);
    let s = format!("{:06o}\0 ", sum);
    block[148..156].copy_from_slice(s.as_bytes());
}
