//! Async extract engine.
//!
//! The [`Extract`] half is fed raw archive bytes, the [`Entries`] half yields one
//! [`Entry`] at a time. The engine does not read past an entry until its body was
//! drained and its [`Unlock`] handle was called, and a slow body reader suspends
//! [`Extract::write`] through the bounded body channel.

use log::{debug, trace};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;

use crate::engine::extract::{Output, Parser, ParserOptions};
use crate::engine::header::{FilenameEncoding, Header};
use crate::engine::link::Link;
use crate::engine::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Result};

/// Extract engine options.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Encoding of the names stored in headers and GNU long name entries.
    pub filename_encoding: FilenameEncoding,
    /// Decode unknown magics and typeflags instead of failing.
    pub allow_unknown_format: bool,
    /// Body chunks buffered before [`Extract::write`] waits for the reader.
    pub body_capacity: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            filename_encoding: FilenameEncoding::Utf8,
            allow_unknown_format: false,
            body_capacity: 16,
        }
    }
}

/// Creates an extract engine.
///
/// # Arguments
/// * `options` - Engine options.
///
/// # Returns
/// * `(Extract, Entries)` - The byte sink and the entry receiver.
pub fn extract(options: ExtractOptions) -> (Extract, Entries) {
    let (tx, rx) = mpsc::channel(1);
    let link = Link::new();
    let parser = Parser::new(ParserOptions {
        filename_encoding: options.filename_encoding,
        allow_unknown_format: options.allow_unknown_format,
    });
    let extract = Extract {
        parser,
        entries: Some(tx),
        current: None,
        link: link.clone(),
        body_capacity: options.body_capacity.max(1),
        finished: false,
    };
    (extract, Entries { rx, link, reported: false })
}

/// The entry being handed out.
struct Current {
    link: Link,
    body: Option<mpsc::Sender<Vec<u8>>>,
}

/// Byte sink side of the extract engine.
pub struct Extract {
    parser: Parser,
    entries: Option<mpsc::Sender<Entry>>,
    current: Option<Current>,
    link: Link,
    body_capacity: usize,
    finished: bool,
}

impl Extract {
    /// Feeds archive bytes to the engine.
    ///
    /// Returns once every byte was routed, which may wait for the consumer to drain
    /// or unlock the current entry.
    pub async fn write(&mut self, mut input: &[u8]) -> Result<()> {
        self.check()?;
        loop {
            let step = match self.parser.step(input) {
                Ok(step) => step,
                Err(err) => return Err(self.fail(err)),
            };
            let (chunk, rest) = input.split_at(step.consumed);
            input = rest;
            match step.output {
                Output::NeedInput => return Ok(()),
                Output::Continue => {}
                Output::Body => self.forward(chunk).await?,
                Output::BodyEnd => {
                    if let Some(current) = &mut self.current {
                        current.body = None;
                    }
                }
                Output::Entry { header, offset, has_body } => self.emit(header, offset, has_body).await?,
                Output::Locked => self.wait_unlock().await?,
            }
        }
    }

    /// Signals the end of input.
    ///
    /// Checks the archive ended on a header boundary, then waits for the last entry
    /// to be released. The entry receiver ends after this.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.write(&[]).await?;
        if let Err(err) = self.parser.finish() {
            return Err(self.fail(err));
        }
        if self.parser.is_locked() {
            self.wait_unlock().await?;
        }
        debug!("extract finished after {} bytes", self.parser.offset());
        self.finished = true;
        self.entries = None;
        Ok(())
    }

    /// Feeds a whole reader to the engine and finishes it.
    pub async fn consume<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<()> {
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => return Err(self.fail(err.into())),
            };
            if n == 0 {
                break;
            }
            self.write(&buf[..n]).await?;
        }
        self.finish().await
    }

    /// Destroys the engine, the current entry and the entry receiver see the error.
    pub fn destroy(mut self, err: Option<Error>) {
        let err = err.unwrap_or_else(|| Error::Destroyed("extract engine destroyed".to_string()));
        self.fail(err);
    }

    /// Archive bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.parser.offset()
    }

    fn check(&self) -> Result<()> {
        match self.link.error() {
            Some(err) => Err(err),
            None if self.finished => Err(Error::ProtocolMisuse("write after finish".to_string())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        if self.link.cancel(err.clone()) {
            debug!("extract engine failed: {}", err);
        }
        let err = self.link.error().unwrap_or(err);
        if let Some(current) = self.current.take() {
            current.link.cancel(err.clone());
        }
        self.entries = None;
        err
    }

    async fn emit(&mut self, header: Header, offset: u64, has_body: bool) -> Result<()> {
        let link = Link::new();
        let size = if has_body { header.size } else { 0 };
        let (tx, rx) = mpsc::channel(self.body_capacity);
        if !has_body {
            link.drain();
        }
        let entry = Entry {
            header,
            offset,
            body: EntryBody {
                rx,
                link: link.clone(),
                pending: Vec::new(),
                pos: 0,
                size,
                delivered: 0,
            },
            unlock: Unlock { link: Some(link.clone()) },
        };
        self.current = Some(Current {
            link,
            body: has_body.then_some(tx),
        });

        let sent = match &self.entries {
            Some(entries) => entries.send(entry).await.is_ok(),
            None => false,
        };
        if !sent {
            return Err(self.fail(Error::Destroyed("entry receiver dropped".to_string())));
        }
        Ok(())
    }

    async fn forward(&mut self, chunk: &[u8]) -> Result<()> {
        let result = match &self.current {
            Some(Current { link, body: Some(body) }) => {
                tokio::select! {
                    sent = body.send(chunk.to_vec()) => {
                        sent.map_err(|_| Error::Destroyed("entry body dropped".to_string()))
                    }
                    err = link.cancelled() => Err(err),
                }
            }
            _ => Err(Error::ProtocolMisuse("body bytes without an open entry".to_string())),
        };
        result.map_err(|err| self.fail(err))
    }

    async fn wait_unlock(&mut self) -> Result<()> {
        let released = match &self.current {
            Some(current) => current.link.released().await,
            None => Ok(()),
        };
        if let Err(err) = released {
            return Err(self.fail(err));
        }
        trace!("entry released at offset {}", self.parser.offset());
        self.current = None;
        self.parser.unlock();
        Ok(())
    }
}

impl Drop for Extract {
    fn drop(&mut self) {
        if !self.finished {
            self.fail(Error::Destroyed("extract engine dropped".to_string()));
        }
    }
}

/// Receiver side of the extract engine.
pub struct Entries {
    rx: mpsc::Receiver<Entry>,
    link: Link,
    reported: bool,
}

impl Entries {
    /// Waits for the next entry.
    ///
    /// # Returns
    /// * `Some(Ok(Entry))` - The next entry, locked until its [`Unlock`] is called.
    /// * `Some(Err(e))` - The engine failed, reported once.
    /// * `None` - The archive ended, cleanly or after the error was reported.
    pub async fn next(&mut self) -> Option<Result<Entry>> {
        if self.reported {
            return None;
        }
        match self.rx.recv().await {
            Some(entry) => Some(Ok(entry)),
            None => {
                let err = self.link.error()?;
                self.reported = true;
                Some(Err(err))
            }
        }
    }
}

/// An extracted entry.
pub struct Entry {
    pub header: Header,
    /// Archive offset of the entry header, extension headers excluded.
    pub offset: u64,
    pub body: EntryBody,
    pub unlock: Unlock,
}

/// Body of an extracted entry.
///
/// Dropping it before every byte was read fails the engine.
pub struct EntryBody {
    rx: mpsc::Receiver<Vec<u8>>,
    link: Link,
    pending: Vec<u8>,
    pos: usize,
    size: u64,
    delivered: u64,
}

impl EntryBody {
    /// Body size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Tells if every body byte was read.
    pub fn is_drained(&self) -> bool {
        self.delivered >= self.size
    }

    /// Reads and discards the rest of the body.
    pub async fn skip(&mut self) -> Result<u64> {
        let skipped = tokio::io::copy(self, &mut tokio::io::sink()).await?;
        Ok(skipped)
    }
}

impl AsyncRead for EntryBody {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pos);
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                this.delivered += n as u64;
                if this.delivered == this.size {
                    this.link.drain();
                }
                return Poll::Ready(Ok(()));
            }
            if this.is_drained() {
                return Poll::Ready(Ok(()));
            }
            if let Some(err) = this.link.error() {
                return Poll::Ready(Err(err.into()));
            }
            this.link.register(cx.waker());
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.pos = 0;
                }
                Poll::Ready(None) => {
                    let err = this
                        .link
                        .error()
                        .unwrap_or_else(|| Error::Destroyed("extract engine dropped".to_string()));
                    return Poll::Ready(Err(err.into()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for EntryBody {
    fn drop(&mut self) {
        if !self.is_drained() {
            self.link.cancel(Error::Destroyed("entry body dropped before it was drained".to_string()));
        }
    }
}

/// Acknowledges an entry so the engine can move on.
///
/// Dropping it without calling [`Unlock::unlock`] fails the engine.
pub struct Unlock {
    link: Option<Link>,
}

impl Unlock {
    pub fn unlock(mut self) {
        if let Some(link) = self.link.take() {
            link.unlock();
        }
    }

    /// Fails the engine with the given error.
    pub fn fail(mut self, err: Error) {
        if let Some(link) = self.link.take() {
            link.cancel(err);
        }
    }
}

impl Drop for Unlock {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.cancel(Error::Destroyed("entry dropped without unlock".to_string()));
        }
    }
}
