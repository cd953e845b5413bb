pub mod buffer;
pub mod extract;
pub mod header;
pub mod link;
pub mod pack;

/// Default to 4k bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Size of a header block and the unit every entry is padded to.
pub const BLOCK_SIZE: usize = 512;

/// A raw header block.
pub type Block = [u8; BLOCK_SIZE];

/// End-of-archive marker, two zero filled blocks.
pub const END_OF_TAR: [u8; 2 * BLOCK_SIZE] = [0; 2 * BLOCK_SIZE];

/// Number of padding bytes needed after `size` bytes to reach the next block boundary.
pub fn overflow(size: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    (block - size % block) % block
}
