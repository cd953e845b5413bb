//! Streaming tar codec.
//!
//! [`pack`] turns entries into archive bytes and [`extract`] turns archive bytes
//! back into entries, both one entry at a time with backpressure in both
//! directions. USTAR headers, PAX extended headers, GNU long names and GNU
//! base-256 numbers are supported.
//!
//! ```no_run
//! use rtar_stream::{extract, pack, EntryType, ExtractOptions, Header, PackOptions};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn demo() -> rtar_stream::Result<()> {
//! let (mut packer, mut archive) = pack(PackOptions::default());
//! let writer = async move {
//!     let mut header = Header::new(EntryType::File);
//!     header.name = "hello.txt".to_string();
//!     packer.entry_with_data(header, b"hello world\n").await?;
//!     packer.finalize().await
//! };
//! let mut bytes = Vec::new();
//! let (written, read) = tokio::join!(writer, archive.read_to_end(&mut bytes));
//! written?;
//! read?;
//!
//! let (mut extractor, mut entries) = extract(ExtractOptions::default());
//! let feeder = extractor.consume(bytes.as_slice());
//! let reader = async move {
//!     while let Some(entry) = entries.next().await {
//!         let mut entry = entry?;
//!         let mut body = Vec::new();
//!         entry.body.read_to_end(&mut body).await?;
//!         entry.unlock.unlock();
//!     }
//!     rtar_stream::Result::Ok(())
//! };
//! let (fed, read) = tokio::join!(feeder, reader);
//! fed?;
//! read?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod extract;
pub mod pack;

pub use engine::header::{EntryType, FilenameEncoding, Header, IsTypeTrait, PaxAttributes};
pub use error::{Error, Result};
pub use extract::{extract, Entries, Entry, EntryBody, Extract, ExtractOptions, Unlock};
pub use pack::{pack, EntrySink, Pack, PackOptions, PackStream};
