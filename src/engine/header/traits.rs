/// Trait for values that know which kind of tar entry they describe.
pub trait IsTypeTrait {
    // Tells if the header is a regular file.
    fn is_regular_file(&self) -> bool;
    // Tells if the header is a hard link.
    fn is_hard_link(&self) -> bool;
    // Tells if the header is a symbolic link.
    fn is_symbolic_link(&self) -> bool;
    // Tells if the header is a character special file.
    fn is_character_special(&self) -> bool;
    // Tells if the header is a block special file.
    fn is_block_special(&self) -> bool;
    // Tells if the header is a directory.
    fn is_directory(&self) -> bool;
    // Tells if the header is a FIFO.
    fn is_fifo(&self) -> bool;
    // Tells if the header is a contiguous file.
    fn is_contiguous_file(&self) -> bool;
    // Tells if the header is one of the extension pseudo entries (PAX or GNU long names).
    fn is_extension(&self) -> bool;
}
