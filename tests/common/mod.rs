#![allow(dead_code)]

use rtar_stream::{extract, pack, EntryType, ExtractOptions, Header, PackOptions, Result};
use tokio::io::AsyncReadExt;

pub const MTIME: u64 = 1387580181;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn file_header(name: &str) -> Header {
    let mut header = Header::new(EntryType::File);
    header.name = name.to_string();
    header.mode = 0o644;
    header.uid = 501;
    header.gid = 20;
    header.mtime = MTIME;
    header
}

/// Entry as seen by the extract side.
#[derive(Debug)]
pub struct Extracted {
    pub header: Header,
    pub offset: u64,
    pub body: Vec<u8>,
}

/// Packs entries with inline bodies and returns the archive bytes.
pub async fn pack_entries(options: PackOptions, entries: Vec<(Header, Vec<u8>)>) -> Result<Vec<u8>> {
    let (mut packer, mut stream) = pack(options);
    let writer = async move {
        for (header, body) in entries {
            packer.entry_with_data(header, body).await?;
        }
        packer.finalize().await
    };
    let mut archive = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut archive));
    written?;
    read?;
    Ok(archive)
}

/// Extracts an archive fed in pieces of the given sizes, cycling through them.
pub async fn extract_with(options: ExtractOptions, archive: &[u8], chunks: &[usize]) -> Result<Vec<Extracted>> {
    let (mut extractor, mut entries) = extract(options);
    let feeder = async move {
        let mut rest = archive;
        let mut sizes = chunks.iter().cycle();
        while !rest.is_empty() {
            let size = sizes.next().copied().unwrap_or(rest.len()).clamp(1, rest.len());
            let (chunk, tail) = rest.split_at(size);
            extractor.write(chunk).await?;
            rest = tail;
        }
        extractor.finish().await
    };
    let reader = async move {
        let mut out = Vec::new();
        while let Some(entry) = entries.next().await {
            let mut entry = entry?;
            let mut body = Vec::new();
            entry.body.read_to_end(&mut body).await?;
            out.push(Extracted {
                header: entry.header,
                offset: entry.offset,
                body,
            });
            entry.unlock.unlock();
        }
        Result::Ok(out)
    };
    let (fed, read) = tokio::join!(feeder, reader);
    fed?;
    read
}

pub async fn extract_chunked(archive: &[u8], chunk: usize) -> Result<Vec<Extracted>> {
    extract_with(ExtractOptions::default(), archive, &[chunk]).await
}
