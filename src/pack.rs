//! Async pack engine.
//!
//! [`Pack`] takes entries one at a time, [`PackStream`] yields the archive bytes.
//! Every chunk goes through a bounded channel, so a writer awaiting
//! [`EntrySink::write`] is held back until the archive reader catches up.

use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;

use crate::engine::header::Header;
use crate::engine::link::Link;
use crate::engine::pack::{Begin, Finalize, Packer};
use crate::engine::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Result};

/// Pack engine options.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Store numbers that overflow their octal field as GNU base-256 instead of
    /// falling back to a PAX header.
    pub allow_gnu_extension: bool,
    /// Archive chunks buffered before writers wait for the reader.
    pub capacity: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            allow_gnu_extension: false,
            capacity: 16,
        }
    }
}

/// Creates a pack engine.
///
/// # Arguments
/// * `options` - Engine options.
///
/// # Returns
/// * `(Pack, PackStream)` - The entry writer and the archive byte stream.
pub fn pack(options: PackOptions) -> (Pack, PackStream) {
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    let link = Link::new();
    let shared = Arc::new(Shared {
        packer: Mutex::new(Packer::new(options.allow_gnu_extension)),
        tx,
        link: link.clone(),
    });
    let stream = PackStream {
        rx,
        link,
        pending: Vec::new(),
        pos: 0,
        ended: false,
    };
    (Pack { shared }, stream)
}

enum Frame {
    Data(Vec<u8>),
    End,
}

struct Shared {
    packer: Mutex<Packer>,
    tx: mpsc::Sender<Frame>,
    link: Link,
}

impl Shared {
    fn packer(&self) -> MutexGuard<'_, Packer> {
        self.packer.lock()
    }

    /// Runs a packer operation, a fatal packer error cancels the link.
    fn with_packer<T>(&self, f: impl FnOnce(&mut Packer) -> Result<T>) -> Result<T> {
        if let Some(err) = self.link.error() {
            return Err(self.packer().fail(err));
        }
        let mut packer = self.packer();
        let result = f(&mut packer);
        let fatal = packer.error();
        drop(packer);
        if let Some(err) = fatal {
            self.link.cancel(err);
        }
        result
    }

    fn fail(&self, err: Error) -> Error {
        let err = self.packer().fail(err);
        self.link.cancel(err.clone());
        err
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if let Some(err) = self.link.error() {
            return Err(err);
        }
        let result = tokio::select! {
            sent = self.tx.send(frame) => {
                sent.map_err(|_| Error::Destroyed("archive stream dropped".to_string()))
            }
            err = self.link.cancelled() => Err(err),
        };
        result.map_err(|err| self.fail(err))
    }

    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.send(Frame::Data(bytes)).await
    }

    /// Sends the bytes and, when they carried the end marker, ends the stream.
    async fn send_tail(&self, bytes: Vec<u8>) -> Result<()> {
        let end = self.packer().is_finalized();
        self.send_bytes(bytes).await?;
        if end {
            debug!("archive finalized");
            self.send(Frame::End).await?;
        }
        Ok(())
    }
}

/// Entry writer side of the pack engine.
pub struct Pack {
    shared: Arc<Shared>,
}

impl Pack {
    /// Adds an entry whose body, if any, is written through the returned sink.
    ///
    /// A file entry takes exactly `header.size` bytes. A symlink without a linkname
    /// takes its target text instead. Other entries take no bytes.
    pub async fn entry(&mut self, header: Header) -> Result<EntrySink> {
        let begin = self.shared.with_packer(|packer| packer.begin(header, None))?;
        let kind = match begin {
            Begin::Stream { bytes, .. } => {
                self.shared.send_bytes(bytes).await?;
                SinkKind::Body
            }
            Begin::LinkTarget => SinkKind::LinkTarget(Vec::new()),
            Begin::Closed { bytes, carries_body } => {
                self.shared.send_bytes(bytes).await?;
                SinkKind::Closed { carries_body }
            }
            Begin::Inline(bytes) => {
                self.shared.send_bytes(bytes).await?;
                SinkKind::Closed { carries_body: false }
            }
        };
        Ok(EntrySink {
            shared: self.shared.clone(),
            kind,
            done: false,
        })
    }

    /// Adds an entry with its complete body, the size is taken from `data`.
    pub async fn entry_with_data(&mut self, header: Header, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        let begin = self.shared.with_packer(|packer| packer.begin(header, Some(data)))?;
        match begin {
            Begin::Inline(bytes) | Begin::Stream { bytes, .. } | Begin::Closed { bytes, .. } => {
                self.shared.send_bytes(bytes).await
            }
            Begin::LinkTarget => Ok(()),
        }
    }

    /// Ends the archive. Deferred until the open entry completes, idempotent.
    pub async fn finalize(&mut self) -> Result<()> {
        match self.shared.with_packer(|packer| packer.finalize())? {
            Finalize::Emit(bytes) => self.shared.send_tail(bytes).await,
            Finalize::Deferred | Finalize::Done => Ok(()),
        }
    }

    /// Destroys the engine, the open sink and the archive stream see the error.
    pub fn destroy(self, err: Option<Error>) {
        let err = err.unwrap_or_else(|| Error::Destroyed("pack engine destroyed".to_string()));
        self.shared.fail(err);
    }
}

impl Drop for Pack {
    fn drop(&mut self) {
        let abandoned = {
            let packer = self.shared.packer();
            !packer.is_finalizing() && packer.error().is_none()
        };
        if abandoned {
            self.shared.fail(Error::Destroyed("pack engine dropped before finalize".to_string()));
        }
    }
}

enum SinkKind {
    Body,
    LinkTarget(Vec<u8>),
    Closed { carries_body: bool },
}

/// Body writer of a packed entry.
///
/// Dropping an open sink before [`EntrySink::finish`] fails the engine.
pub struct EntrySink {
    shared: Arc<Shared>,
    kind: SinkKind,
    done: bool,
}

impl EntrySink {
    /// Writes body bytes, waits until the archive stream accepted them.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.kind {
            SinkKind::Body => {
                self.shared.with_packer(|packer| packer.record_body(data.len()))?;
                self.shared.send_bytes(data.to_vec()).await
            }
            SinkKind::LinkTarget(target) => {
                target.extend_from_slice(data);
                Ok(())
            }
            SinkKind::Closed { carries_body } => {
                if data.is_empty() {
                    return Ok(());
                }
                let err = if *carries_body {
                    Error::SizeMismatch { declared: 0, written: data.len() as u64 }
                } else {
                    Error::ProtocolMisuse("entry type carries no body".to_string())
                };
                Err(self.shared.fail(err))
            }
        }
    }

    /// Streams a reader into the entry.
    ///
    /// # Returns
    /// * `Ok(u64)` - Number of bytes copied.
    pub async fn copy_from<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<u64> {
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => return Err(self.shared.fail(err.into())),
            };
            if n == 0 {
                return Ok(total);
            }
            self.write(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Completes the entry: checks the body size and pads it, or emits the
    /// symlink header with the written target.
    pub async fn finish(mut self) -> Result<()> {
        self.done = true;
        let bytes = match &mut self.kind {
            SinkKind::Body => self.shared.with_packer(|packer| packer.complete_body())?,
            SinkKind::LinkTarget(target) => {
                let target = String::from_utf8_lossy(target).into_owned();
                self.shared.with_packer(|packer| packer.complete_link(target))?
            }
            SinkKind::Closed { .. } => return Ok(()),
        };
        self.shared.send_tail(bytes).await
    }
}

impl Drop for EntrySink {
    fn drop(&mut self) {
        if !self.done && !matches!(self.kind, SinkKind::Closed { .. }) {
            self.shared.fail(Error::Destroyed("entry sink dropped before finish".to_string()));
        }
    }
}

/// Archive bytes produced by the pack engine.
///
/// Dropping it before the archive ended fails the engine.
pub struct PackStream {
    rx: mpsc::Receiver<Frame>,
    link: Link,
    pending: Vec<u8>,
    pos: usize,
    ended: bool,
}

impl AsyncRead for PackStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pos);
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.ended {
                return Poll::Ready(Ok(()));
            }
            if let Some(err) = this.link.error() {
                return Poll::Ready(Err(err.into()));
            }
            this.link.register(cx.waker());
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Frame::Data(bytes))) => {
                    this.pending = bytes;
                    this.pos = 0;
                }
                Poll::Ready(Some(Frame::End)) => this.ended = true,
                Poll::Ready(None) => {
                    let err = this.link.error().map(io::Error::from).unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::UnexpectedEof, "pack engine ended before finalize")
                    });
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for PackStream {
    fn drop(&mut self) {
        if !self.ended {
            self.link.cancel(Error::Destroyed("archive stream dropped".to_string()));
        }
    }
}
