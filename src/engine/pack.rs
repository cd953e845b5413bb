//! Pack bookkeeping: header resolution, PAX fallback and the single open entry rule.
//!
//! [`Packer`] produces the archive bytes, the async facade only moves them.

use log::debug;

use crate::error::{Error, Result};
use super::header::helper::fits_numeric;
use super::header::mode::{type_from_mode, DMODE, FMODE, PERMISSION_MASK};
use super::header::{encode_pax, EntryType, Header, PaxAttributes};
use super::{overflow, END_OF_TAR};

/// How the entry continues after its header was accepted.
#[derive(Debug, PartialEq, Eq)]
pub enum Begin {
    /// Header, inline body and padding. The entry is complete.
    Inline(Vec<u8>),
    /// Header of an entry whose `size` body bytes follow through [`Packer::record_body`].
    Stream { bytes: Vec<u8>, size: u64 },
    /// Symlink without a target, the header waits for [`Packer::complete_link`].
    LinkTarget,
    /// Header of an entry that takes no body bytes. The entry is complete.
    Closed { bytes: Vec<u8>, carries_body: bool },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Finalize {
    /// End-of-archive marker to emit.
    Emit(Vec<u8>),
    /// An entry is still open, the marker follows its completion.
    Deferred,
    /// The marker was already produced.
    Done,
}

#[derive(Debug)]
enum Open {
    Body { declared: u64, written: u64 },
    LinkTarget(Header),
}

#[derive(Debug)]
pub struct Packer {
    allow_gnu_extension: bool,
    open: Option<Open>,
    finalize_pending: bool,
    finalized: bool,
    failed: Option<Error>,
}

impl Packer {
    pub fn new(allow_gnu_extension: bool) -> Self {
        Self {
            allow_gnu_extension,
            open: None,
            finalize_pending: false,
            finalized: false,
            failed: None,
        }
    }

    pub fn error(&self) -> Option<Error> {
        self.failed.clone()
    }

    /// Tells if the end-of-archive marker was produced.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Tells if finalize was requested, even when deferred.
    pub fn is_finalizing(&self) -> bool {
        self.finalized || self.finalize_pending
    }

    pub fn has_open_entry(&self) -> bool {
        self.open.is_some()
    }

    /// Fails the packer, only the first error is kept and returned.
    pub fn fail(&mut self, err: Error) -> Error {
        if self.failed.is_none() {
            debug!("pack failed: {}", err);
            self.failed = Some(err);
        }
        self.failed.clone().unwrap_or(Error::Destroyed("pack engine failed".to_string()))
    }

    fn check(&self) -> Result<()> {
        match &self.failed {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Starts a new entry.
    ///
    /// # Arguments
    /// * `header` - Entry header, defaults are applied to unset fields.
    /// * `inline` - Complete body when it is known up front.
    ///
    /// # Returns
    /// * `Ok(Begin)` - The bytes to emit and how the entry continues.
    /// * `Err(e)` - Protocol misuse, fatal unless the archive was already finalized.
    pub fn begin(&mut self, header: Header, inline: Option<&[u8]>) -> Result<Begin> {
        self.check()?;
        if self.open.is_some() {
            return Err(self.fail(Error::ProtocolMisuse("an entry is already open".to_string())));
        }
        if self.is_finalizing() {
            return Err(Error::ProtocolMisuse("entry after finalize".to_string()));
        }

        let header = resolve(header, inline.map(|data| data.len() as u64));
        let carries_body = header.entry_type.carries_body();

        if let Some(data) = inline {
            if !carries_body && !data.is_empty() {
                return Err(self.fail(Error::ProtocolMisuse(format!(
                    "{:?} entry {:?} carries no body", header.entry_type, header.name
                ))));
            }
            let mut bytes = self.encode_header(&header);
            bytes.extend_from_slice(data);
            pad(&mut bytes, data.len() as u64);
            return Ok(Begin::Inline(bytes));
        }

        if header.entry_type == EntryType::Symlink && header.linkname.is_none() {
            self.open = Some(Open::LinkTarget(header));
            return Ok(Begin::LinkTarget);
        }

        let bytes = self.encode_header(&header);
        if carries_body && header.size > 0 {
            self.open = Some(Open::Body { declared: header.size, written: 0 });
            return Ok(Begin::Stream { bytes, size: header.size });
        }
        Ok(Begin::Closed { bytes, carries_body })
    }

    /// Counts body bytes of the open entry.
    pub fn record_body(&mut self, len: usize) -> Result<()> {
        self.check()?;
        let exceeded = match &mut self.open {
            Some(Open::Body { declared, written }) => {
                *written += len as u64;
                (*written > *declared).then_some((*declared, *written))
            }
            _ => return Err(self.fail(Error::ProtocolMisuse("no open entry body".to_string()))),
        };
        match exceeded {
            Some((declared, written)) => Err(self.fail(Error::SizeMismatch { declared, written })),
            None => Ok(()),
        }
    }

    /// Completes the open entry body.
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` - Padding, followed by the end marker when finalize was deferred.
    /// * `Err(e)` - The body is shorter than declared, or no body is open.
    pub fn complete_body(&mut self) -> Result<Vec<u8>> {
        self.check()?;
        let (declared, written) = match &self.open {
            Some(Open::Body { declared, written }) => (*declared, *written),
            _ => return Err(self.fail(Error::ProtocolMisuse("no open entry body".to_string()))),
        };
        if declared != written {
            return Err(self.fail(Error::SizeMismatch { declared, written }));
        }
        self.open = None;
        let mut bytes = Vec::new();
        pad(&mut bytes, declared);
        self.after_entry(&mut bytes);
        Ok(bytes)
    }

    /// Completes a symlink whose target was written to its sink.
    pub fn complete_link(&mut self, target: String) -> Result<Vec<u8>> {
        self.check()?;
        let mut header = match self.open.take() {
            Some(Open::LinkTarget(header)) => header,
            other => {
                self.open = other;
                return Err(self.fail(Error::ProtocolMisuse("no open link entry".to_string())));
            }
        };
        header.linkname = Some(target);
        let mut bytes = self.encode_header(&header);
        self.after_entry(&mut bytes);
        Ok(bytes)
    }

    /// Requests the end-of-archive marker. Idempotent.
    pub fn finalize(&mut self) -> Result<Finalize> {
        self.check()?;
        if self.finalized {
            return Ok(Finalize::Done);
        }
        if self.open.is_some() {
            self.finalize_pending = true;
            return Ok(Finalize::Deferred);
        }
        self.finalized = true;
        Ok(Finalize::Emit(END_OF_TAR.to_vec()))
    }

    fn after_entry(&mut self, bytes: &mut Vec<u8>) {
        if self.finalize_pending && !self.finalized {
            self.finalized = true;
            bytes.extend_from_slice(&END_OF_TAR);
        }
    }

    /// Encodes the header, preceded by a PAX header when the fixed fields cannot hold it.
    fn encode_header(&self, header: &Header) -> Vec<u8> {
        let gnu = self.allow_gnu_extension;
        let overflowing = overflowing_fields(header, gnu);
        if header.pax.is_none() && overflowing.is_empty() {
            if let Some(block) = header.encode(gnu) {
                return block.to_vec();
            }
        }

        let mut attributes = PaxAttributes::new();
        attributes.insert("path", header.name.as_str());
        if let Some(linkname) = &header.linkname {
            attributes.insert("linkpath", linkname.as_str());
        }
        for (key, value) in overflowing {
            attributes.insert(key, value);
        }
        if let Some(pax) = &header.pax {
            for (key, value) in pax.iter() {
                attributes.insert(key, value);
            }
        }
        debug!("PAX header for {:?} with {} records", header.name, attributes.len());

        let body = encode_pax(&attributes);
        let mut pax_header = Header::new(EntryType::PaxHeader);
        pax_header.name = "PaxHeader".to_string();
        pax_header.mode = header.mode;
        pax_header.uid = header.uid;
        pax_header.gid = header.gid;
        pax_header.mtime = header.mtime;
        pax_header.size = body.len() as u64;

        let mut bytes = pax_header.encode_truncated(gnu).to_vec();
        bytes.extend_from_slice(&body);
        pad(&mut bytes, body.len() as u64);
        bytes.extend_from_slice(&header.encode_truncated(gnu));
        bytes
    }
}

/// Applies pack defaults: type from mode bits, permissions by type, body-less sizes.
fn resolve(mut header: Header, inline_len: Option<u64>) -> Header {
    if header.entry_type == EntryType::File {
        if let Some(entry_type) = type_from_mode(header.mode) {
            header.entry_type = entry_type;
        }
    }
    if header.mode & PERMISSION_MASK == 0 {
        header.mode |= if header.entry_type == EntryType::Directory { DMODE } else { FMODE };
    }
    if let Some(len) = inline_len {
        header.size = len;
    }
    if !header.entry_type.carries_body() {
        header.size = 0;
    }
    header
}

/// Fields that fit neither the fixed header nor, when allowed, base-256.
fn overflowing_fields(header: &Header, allow_gnu_extension: bool) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    let mut buf = itoa::Buffer::new();
    for (key, value, width) in [
        ("size", header.encoded_size(), 12),
        ("uid", header.uid, 8),
        ("gid", header.gid, 8),
        ("mtime", header.mtime, 12),
    ] {
        if !fits_numeric(value, width, allow_gnu_extension) {
            fields.push((key, buf.format(value).to_string()));
        }
    }
    if header.uname.len() > 32 {
        fields.push(("uname", header.uname.clone()));
    }
    if header.gname.len() > 32 {
        fields.push(("gname", header.gname.clone()));
    }
    fields
}

fn pad(bytes: &mut Vec<u8>, size: u64) {
    bytes.resize(bytes.len() + overflow(size) as usize, 0);
}
