pub mod helper;
pub mod gnu;
pub mod mode;
pub mod pax;
mod traits;

pub use traits::IsTypeTrait;
pub use pax::{decode_pax, encode_pax, PaxAttributes};

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use super::{Block, BLOCK_SIZE};
use helper::*;

/// POSIX magic "ustar\0" followed by the version "00".
pub const USTAR_MAGIC: &[u8; 6] = b"ustar\0";
pub const USTAR_VERSION: &[u8; 2] = b"00";

const NAME_LEN: usize = 100;
const LINKNAME_LEN: usize = 100;
const OWNER_LEN: usize = 32;
const PREFIX_LEN: usize = 155;

/// Text encoding used to decode filenames stored in headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilenameEncoding {
    /// UTF-8, invalid sequences are replaced.
    #[default]
    Utf8,
    /// ISO-8859-1, every byte is one character.
    Latin1,
}

impl FilenameEncoding {
    /// Decodes raw filename bytes into a string.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

impl FromStr for FilenameEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" | "binary" => Ok(Self::Latin1),
            other => Err(Error::UnsupportedFormat(format!("unknown filename encoding {:?}", other))),
        }
    }
}

/// Tar entry type, including the pseudo entries used by the PAX and GNU extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Link,
    Symlink,
    CharacterDevice,
    BlockDevice,
    Directory,
    Fifo,
    ContiguousFile,
    PaxHeader,
    PaxGlobalHeader,
    GnuLongPath,
    GnuLongLinkPath,
    Unknown(u8),
}

impl From<u8> for EntryType {
    fn from(value: u8) -> Self {
        match value {
            0 | b'0' => Self::File,
            b'1' => Self::Link,
            b'2' => Self::Symlink,
            b'3' => Self::CharacterDevice,
            b'4' => Self::BlockDevice,
            b'5' => Self::Directory,
            b'6' => Self::Fifo,
            b'7' => Self::ContiguousFile,
            b'x' => Self::PaxHeader,
            b'g' => Self::PaxGlobalHeader,
            b'L' => Self::GnuLongPath,
            b'K' => Self::GnuLongLinkPath,
            v => Self::Unknown(v),
        }
    }
}

impl From<EntryType> for u8 {
    fn from(value: EntryType) -> Self {
        match value {
            EntryType::File => b'0',
            EntryType::Link => b'1',
            EntryType::Symlink => b'2',
            EntryType::CharacterDevice => b'3',
            EntryType::BlockDevice => b'4',
            EntryType::Directory => b'5',
            EntryType::Fifo => b'6',
            EntryType::ContiguousFile => b'7',
            EntryType::PaxHeader => b'x',
            EntryType::PaxGlobalHeader => b'g',
            EntryType::GnuLongPath => b'L',
            EntryType::GnuLongLinkPath => b'K',
            EntryType::Unknown(v) => v,
        }
    }
}

impl EntryType {
    /// Tells if entries of this type are followed by `size` body bytes.
    pub fn carries_body(&self) -> bool {
        matches!(self, Self::File | Self::ContiguousFile | Self::Unknown(_)) || self.is_extension()
    }
}

impl IsTypeTrait for EntryType {
    fn is_regular_file(&self) -> bool {
        matches!(self, Self::File)
    }

    fn is_hard_link(&self) -> bool {
        matches!(self, Self::Link)
    }

    fn is_symbolic_link(&self) -> bool {
        matches!(self, Self::Symlink)
    }

    fn is_character_special(&self) -> bool {
        matches!(self, Self::CharacterDevice)
    }

    fn is_block_special(&self) -> bool {
        matches!(self, Self::BlockDevice)
    }

    fn is_directory(&self) -> bool {
        matches!(self, Self::Directory)
    }

    fn is_fifo(&self) -> bool {
        matches!(self, Self::Fifo)
    }

    fn is_contiguous_file(&self) -> bool {
        matches!(self, Self::ContiguousFile)
    }

    fn is_extension(&self) -> bool {
        matches!(self, Self::PaxHeader | Self::PaxGlobalHeader | Self::GnuLongPath | Self::GnuLongLinkPath)
    }
}

/// Header magic as found at offset 257.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ustar,
    Gnu,
    Unknown,
}

impl Format {
    fn detect(block: &Block) -> Self {
        let magic = &block[257..263];
        let version = &block[263..265];
        if magic == USTAR_MAGIC && version == USTAR_VERSION {
            return Self::Ustar;
        }
        if magic == gnu::GNU_MAGIC && version == gnu::GNU_VERSION {
            return Self::Gnu;
        }
        Self::Unknown
    }
}

/// Represents a tar entry header, independent of the on-disk flavour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Full entry path, may exceed the 100 bytes of the name field.
    pub name: String,
    /// Permission bits, file type bits are only used to infer the entry type.
    pub mode: u32,
    /// Owner user ID.
    pub uid: u64,
    /// Owner group ID.
    pub gid: u64,
    /// Body size in bytes.
    pub size: u64,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
    /// Entry type.
    pub entry_type: EntryType,
    /// Link target for hard and symbolic links.
    pub linkname: Option<String>,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
    /// Device major number.
    pub devmajor: u32,
    /// Device minor number.
    pub devminor: u32,
    /// Extra PAX attributes attached to the entry.
    pub pax: Option<PaxAttributes>,
}

impl Header {
    /// Creates a new header stamped with the current time.
    ///
    /// # Arguments
    /// * `entry_type` - The type of the entry.
    ///
    /// # Returns
    /// * `Self` - The created header.
    pub fn new(entry_type: EntryType) -> Self {
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            name: String::new(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime,
            entry_type,
            linkname: None,
            uname: String::new(),
            gname: String::new(),
            devmajor: 0,
            devminor: 0,
            pax: None,
        }
    }

    /// Size written to the size field, body-less entries always store zero.
    pub fn encoded_size(&self) -> u64 {
        if self.entry_type.carries_body() { self.size } else { 0 }
    }

    /// Encodes the header as a USTAR block.
    ///
    /// # Arguments
    /// * `allow_gnu_extension` - Store numbers that overflow their octal field as base-256.
    ///
    /// # Returns
    /// * `Some(Block)` - The encoded header.
    /// * `None` - The name, linkname or owner names do not fit, a PAX header is needed.
    pub fn encode(&self, allow_gnu_extension: bool) -> Option<Block> {
        let (prefix, name) = split_name(&self.name)?;
        if self.linkname.as_deref().is_some_and(|l| l.len() > LINKNAME_LEN) {
            return None;
        }
        if self.uname.len() > OWNER_LEN || self.gname.len() > OWNER_LEN {
            return None;
        }
        Some(self.write_block(prefix, name, allow_gnu_extension))
    }

    /// Encodes the header, cutting strings that do not fit their fields.
    ///
    /// Used for the real header behind a PAX header, where PAX aware readers take
    /// the full values from the extension.
    pub fn encode_truncated(&self, allow_gnu_extension: bool) -> Block {
        match split_name(&self.name) {
            Some((prefix, name)) => self.write_block(prefix, name, allow_gnu_extension),
            None => self.write_block("", &self.name, allow_gnu_extension),
        }
    }

    fn write_block(&self, prefix: &str, name: &str, allow_gnu_extension: bool) -> Block {
        let mut buf = [0u8; BLOCK_SIZE];
        put_str(&mut buf[0..100], name);
        put_numeric(&mut buf[100..108], (self.mode & mode::PERMISSION_MASK) as u64, allow_gnu_extension);
        put_numeric(&mut buf[108..116], self.uid, allow_gnu_extension);
        put_numeric(&mut buf[116..124], self.gid, allow_gnu_extension);
        put_numeric(&mut buf[124..136], self.encoded_size(), allow_gnu_extension);
        put_numeric(&mut buf[136..148], self.mtime, allow_gnu_extension);
        buf[156] = self.entry_type.into();
        if let Some(linkname) = &self.linkname {
            put_str(&mut buf[157..257], linkname);
        }
        buf[257..263].copy_from_slice(USTAR_MAGIC);
        buf[263..265].copy_from_slice(USTAR_VERSION);
        put_str(&mut buf[265..297], &self.uname);
        put_str(&mut buf[297..329], &self.gname);
        put_numeric(&mut buf[329..337], self.devmajor as u64, allow_gnu_extension);
        put_numeric(&mut buf[337..345], self.devminor as u64, allow_gnu_extension);
        put_str(&mut buf[345..500], prefix);
        put_checksum(&mut buf);
        buf
    }

    /// Decodes a header block.
    ///
    /// # Arguments
    /// * `block` - The 512 byte header block.
    /// * `encoding` - Encoding of the stored names.
    /// * `allow_unknown_format` - Decode unknown magics and typeflags instead of failing,
    ///   unknown typeflags become regular files.
    ///
    /// # Returns
    /// * `Ok(Some(Self))` - The decoded header.
    /// * `Ok(None)` - The block is zero filled.
    /// * `Err(e)` - Checksum mismatch, unsupported format or unsafe numeric field.
    pub fn decode(block: &Block, encoding: FilenameEncoding, allow_unknown_format: bool) -> Result<Option<Self>> {
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        // validate checksum before trusting any field
        let stored = parse_octal::<u64>(&block[148..156])?;
        let computed = checksum(block);
        if stored != computed {
            return Err(Error::MalformedHeader(format!(
                "checksum mismatch, stored {} computed {}", stored, computed
            )));
        }

        let format = Format::detect(block);
        if format == Format::Unknown && !allow_unknown_format {
            return Err(Error::UnsupportedFormat("unknown header magic".to_string()));
        }

        let mut entry_type = EntryType::from(block[156]);
        if let EntryType::Unknown(flag) = entry_type {
            if !allow_unknown_format {
                return Err(Error::UnsupportedFormat(format!("unknown typeflag {:?}", flag as char)));
            }
            entry_type = EntryType::File;
        }

        let mut name = encoding.decode(get_str(&block[0..100]));
        if format == Format::Ustar && block[345] != 0 {
            let prefix = encoding.decode(get_str(&block[345..500]));
            name = format!("{}/{}", prefix, name);
        }

        // pre-POSIX archives mark directories with a trailing slash only
        if entry_type == EntryType::File && name.ends_with('/') {
            entry_type = EntryType::Directory;
        }

        let linkname = if block[157] == 0 {
            None
        } else {
            Some(encoding.decode(get_str(&block[157..257])))
        };

        Ok(Some(Self {
            name,
            mode: parse_numeric(&block[100..108])?,
            uid: parse_numeric(&block[108..116])?,
            gid: parse_numeric(&block[116..124])?,
            size: parse_numeric(&block[124..136])?,
            mtime: parse_numeric(&block[136..148])?,
            entry_type,
            linkname,
            uname: encoding.decode(get_str(&block[265..297])),
            gname: encoding.decode(get_str(&block[297..329])),
            devmajor: parse_numeric(&block[329..337])?,
            devminor: parse_numeric(&block[337..345])?,
            pax: None,
        }))
    }

    /// Applies PAX attributes over the fixed header fields and keeps them on the header.
    pub fn apply_pax(&mut self, pax: PaxAttributes) {
        if let Some(path) = pax.path() {
            self.name = path.to_string();
        }
        if let Some(linkpath) = pax.linkpath() {
            self.linkname = Some(linkpath.to_string());
        }
        if let Some(size) = pax.size() {
            self.size = size;
        }
        if let Some(uid) = pax.uid() {
            self.uid = uid;
        }
        if let Some(gid) = pax.gid() {
            self.gid = gid;
        }
        if let Some(uname) = pax.uname() {
            self.uname = uname.to_string();
        }
        if let Some(gname) = pax.gname() {
            self.gname = gname.to_string();
        }
        if let Some(mtime) = pax.mtime() {
            self.mtime = mtime;
        }
        self.pax = Some(pax);
    }
}

impl IsTypeTrait for Header {
    fn is_regular_file(&self) -> bool {
        self.entry_type.is_regular_file()
    }

    fn is_hard_link(&self) -> bool {
        self.entry_type.is_hard_link()
    }

    fn is_symbolic_link(&self) -> bool {
        self.entry_type.is_symbolic_link()
    }

    fn is_character_special(&self) -> bool {
        self.entry_type.is_character_special()
    }

    fn is_block_special(&self) -> bool {
        self.entry_type.is_block_special()
    }

    fn is_directory(&self) -> bool {
        self.entry_type.is_directory()
    }

    fn is_fifo(&self) -> bool {
        self.entry_type.is_fifo()
    }

    fn is_contiguous_file(&self) -> bool {
        self.entry_type.is_contiguous_file()
    }

    fn is_extension(&self) -> bool {
        self.entry_type.is_extension()
    }
}

/// Splits a path into the USTAR prefix and name fields.
///
/// Picks the last '/' that leaves both parts within their field widths.
fn split_name(path: &str) -> Option<(&str, &str)> {
    if path.len() <= NAME_LEN {
        return Some(("", path));
    }
    if path.len() > PREFIX_LEN + 1 + NAME_LEN {
        return None;
    }
    path.bytes()
        .enumerate()
        .rev()
        .filter(|&(_, b)| b == b'/')
        .map(|(i, _)| i)
        .find(|&i| i > 0 && i <= PREFIX_LEN && path.len() - i - 1 <= NAME_LEN && path.len() - i - 1 > 0)
        .map(|i| (&path[..i], &path[i + 1..]))
}
