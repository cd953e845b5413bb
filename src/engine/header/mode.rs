//! POSIX file mode bits used to infer entry types.

use super::EntryType;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Permission and set-id bits stored in the header mode field.
pub const PERMISSION_MASK: u32 = 0o7777;

/// Default permissions for directories.
pub const DMODE: u32 = 0o755;
/// Default permissions for everything else.
pub const FMODE: u32 = 0o644;

/// Infers the entry type from the file type bits of a mode.
///
/// Returns `None` when the mode carries no type bits or the type has no tar
/// counterpart, callers keep their default then.
pub fn type_from_mode(mode: u32) -> Option<EntryType> {
    match mode & S_IFMT {
        S_IFBLK => Some(EntryType::BlockDevice),
        S_IFCHR => Some(EntryType::CharacterDevice),
        S_IFDIR => Some(EntryType::Directory),
        S_IFIFO => Some(EntryType::Fifo),
        S_IFLNK => Some(EntryType::Symlink),
        S_IFREG => Some(EntryType::File),
        _ => None,
    }
}
