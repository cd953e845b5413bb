//! Extraction state machine.
//!
//! [`Parser`] does no I/O: every call to [`Parser::step`] looks at the next slice of
//! archive bytes, consumes a prefix of it and reports what happened. The caller
//! routes body bytes, waits for the consumer on [`Output::Locked`] and feeds the
//! rest of the slice back in.

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use super::buffer::BufferList;
use super::header::{decode_pax, gnu, EntryType, FilenameEncoding, Header, PaxAttributes};
use super::{overflow, Block, BLOCK_SIZE};

/// What the parser is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Header,
    GnuLongPath,
    GnuLongLinkPath,
    PaxGlobal,
    PaxHeader,
    Body,
    Padding,
}

/// Result of one parser step.
#[derive(Debug)]
pub enum Output {
    /// All given bytes were consumed, more input is needed.
    NeedInput,
    /// Internal progress, call again with the remaining input.
    Continue,
    /// The consumed bytes are body bytes of the current entry.
    Body,
    /// The current entry body is complete.
    BodyEnd,
    /// A real entry header was decoded, the parser is locked until [`Parser::unlock`].
    Entry {
        header: Header,
        offset: u64,
        has_body: bool,
    },
    /// The next header cannot be read before the current entry is unlocked.
    Locked,
}

#[derive(Debug)]
pub struct Step {
    /// Number of input bytes consumed by this step.
    pub consumed: usize,
    pub output: Output,
}

impl Step {
    fn new(consumed: usize, output: Output) -> Self {
        Self { consumed, output }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParserOptions {
    pub filename_encoding: FilenameEncoding,
    pub allow_unknown_format: bool,
}

#[derive(Debug)]
pub struct Parser {
    options: ParserOptions,
    buffer: BufferList,
    phase: Phase,
    /// Bytes missing to the next phase boundary.
    missing: u64,
    /// Archive bytes consumed so far.
    offset: u64,
    /// Size of the body (or skipped payload) the padding belongs to.
    payload_size: u64,
    pax: Option<PaxAttributes>,
    pax_global: Option<PaxAttributes>,
    gnu_long_path: Option<String>,
    gnu_long_link_path: Option<String>,
    locked: bool,
    zero_blocks: u64,
    failed: Option<Error>,
}

impl Parser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            options,
            buffer: BufferList::new(),
            phase: Phase::Header,
            missing: BLOCK_SIZE as u64,
            offset: 0,
            payload_size: 0,
            pax: None,
            pax_global: None,
            gnu_long_path: None,
            gnu_long_link_path: None,
            locked: false,
            zero_blocks: 0,
            failed: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Archive bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Releases the lock taken by the last emitted entry.
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Consumes a prefix of `input`.
    ///
    /// # Arguments
    /// * `input` - Unconsumed archive bytes, may be empty.
    ///
    /// # Returns
    /// * `Ok(Step)` - The consumed byte count and what it produced.
    /// * `Err(e)` - A fatal error, every later call returns it again.
    pub fn step(&mut self, input: &[u8]) -> Result<Step> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.transition(input).inspect_err(|err| {
            debug!("extract failed at offset {}: {}", self.offset, err);
            self.failed = Some(err.clone());
        })
    }

    /// Checks that the archive ended on a header boundary.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.phase == Phase::Header && self.buffer.is_empty() {
            trace!("archive ended cleanly at offset {}", self.offset);
            return Ok(());
        }
        debug!("archive truncated in {:?} phase at offset {}", self.phase, self.offset);
        self.failed = Some(Error::TruncatedArchive);
        Err(Error::TruncatedArchive)
    }

    fn transition(&mut self, input: &[u8]) -> Result<Step> {
        match self.phase {
            Phase::Header => {
                if input.is_empty() {
                    return Ok(Step::new(0, Output::NeedInput));
                }
                if self.locked {
                    return Ok(Step::new(0, Output::Locked));
                }
                let (consumed, block) = self.fill(input);
                match block {
                    Some(block) => self.on_header(consumed, &block),
                    None => Ok(Step::new(consumed, Output::NeedInput)),
                }
            }
            Phase::GnuLongPath | Phase::GnuLongLinkPath | Phase::PaxGlobal | Phase::PaxHeader => {
                let (consumed, payload) = self.fill(input);
                match payload {
                    Some(payload) => {
                        self.on_extension(&payload);
                        Ok(Step::new(consumed, Output::Continue))
                    }
                    None => Ok(Step::new(consumed, Output::NeedInput)),
                }
            }
            Phase::Body => {
                if self.missing == 0 {
                    self.begin_padding(self.payload_size);
                    return Ok(Step::new(0, Output::BodyEnd));
                }
                if input.is_empty() {
                    return Ok(Step::new(0, Output::NeedInput));
                }
                let consumed = self.advance(input.len());
                Ok(Step::new(consumed, Output::Body))
            }
            Phase::Padding => {
                if input.is_empty() {
                    return Ok(Step::new(0, Output::NeedInput));
                }
                let consumed = self.advance(input.len());
                if self.missing == 0 {
                    self.expect_header();
                }
                Ok(Step::new(consumed, Output::Continue))
            }
        }
    }

    /// Moves up to `available` bytes towards the phase boundary.
    fn advance(&mut self, available: usize) -> usize {
        let n = self.missing.min(available as u64);
        self.missing -= n;
        self.offset += n;
        n as usize
    }

    /// Buffers input until the phase payload is complete.
    fn fill(&mut self, input: &[u8]) -> (usize, Option<Vec<u8>>) {
        let consumed = self.advance(input.len());
        self.buffer.append(&input[..consumed]);
        if self.missing > 0 {
            return (consumed, None);
        }
        let len = self.buffer.len();
        (consumed, self.buffer.take(len))
    }

    fn expect_header(&mut self) {
        self.phase = Phase::Header;
        self.missing = BLOCK_SIZE as u64;
    }

    fn begin_padding(&mut self, size: u64) {
        let padding = overflow(size);
        if padding == 0 {
            self.expect_header();
        } else {
            self.phase = Phase::Padding;
            self.missing = padding;
        }
    }

    fn on_header(&mut self, consumed: usize, raw: &[u8]) -> Result<Step> {
        let offset = self.offset - BLOCK_SIZE as u64;
        let block: &Block = raw
            .try_into()
            .map_err(|_| Error::MalformedHeader(format!("header block of {} bytes", raw.len())))?;
        let decoded = Header::decode(block, self.options.filename_encoding, self.options.allow_unknown_format)?;
        let Some(mut header) = decoded else {
            self.zero_blocks += 1;
            if self.zero_blocks == 2 {
                trace!("end-of-archive marker at offset {}", offset - BLOCK_SIZE as u64);
            }
            self.expect_header();
            return Ok(Step::new(consumed, Output::Continue));
        };
        if self.zero_blocks > 0 {
            warn!("skipped {} zero blocks before the header at offset {}", self.zero_blocks, offset);
            self.zero_blocks = 0;
        }

        let extension = match header.entry_type {
            EntryType::GnuLongPath => Some(Phase::GnuLongPath),
            EntryType::GnuLongLinkPath => Some(Phase::GnuLongLinkPath),
            EntryType::PaxGlobalHeader => Some(Phase::PaxGlobal),
            EntryType::PaxHeader => Some(Phase::PaxHeader),
            _ => None,
        };
        if let Some(phase) = extension {
            debug!("{:?} extension of {} bytes at offset {}", header.entry_type, header.size, offset);
            self.phase = phase;
            self.missing = header.size;
            return Ok(Step::new(consumed, Output::Continue));
        }

        self.apply_extensions(&mut header);
        let size = header.size;
        let has_body = size > 0 && header.entry_type != EntryType::Directory;
        if has_body {
            self.phase = Phase::Body;
            self.missing = size;
            self.payload_size = size;
        } else if size > 0 {
            warn!("directory {:?} declares {} body bytes, skipping them", header.name, size);
            self.phase = Phase::Padding;
            self.missing = size + overflow(size);
        } else {
            self.expect_header();
        }

        debug!("entry {:?} ({:?}, {} bytes) at offset {}", header.name, header.entry_type, size, offset);
        self.locked = true;
        Ok(Step::new(consumed, Output::Entry { header, offset, has_body }))
    }

    fn on_extension(&mut self, payload: &[u8]) {
        let encoding = self.options.filename_encoding;
        match self.phase {
            Phase::GnuLongPath => self.gnu_long_path = Some(gnu::decode_long_path(payload, encoding)),
            Phase::GnuLongLinkPath => self.gnu_long_link_path = Some(gnu::decode_long_path(payload, encoding)),
            Phase::PaxGlobal => self.pax_global = Some(decode_pax(payload)),
            Phase::PaxHeader => self.pax = Some(decode_pax(payload)),
            _ => {}
        }
        self.begin_padding(payload.len() as u64);
    }

    /// Applies pending long names and PAX attributes, the per-entry ones are cleared.
    fn apply_extensions(&mut self, header: &mut Header) {
        if let Some(path) = self.gnu_long_path.take() {
            header.name = path;
        }
        if let Some(linkpath) = self.gnu_long_link_path.take() {
            header.linkname = Some(linkpath);
        }
        let pax = match (&self.pax_global, self.pax.take()) {
            (Some(global), Some(local)) => Some(global.merged_with(&local)),
            (Some(global), None) => Some(global.clone()),
            (None, local) => local,
        };
        if let Some(pax) = pax {
            header.apply_pax(pax);
        }
    }
}
