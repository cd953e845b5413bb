mod common;

use anyhow::Result;
use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtar_stream::{extract, pack, EntryType, Error, ExtractOptions, Header, IsTypeTrait, PackOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random()).collect()
}

fn mixed_entries() -> Vec<(Header, Vec<u8>)> {
    let mut entries = vec![(file_header("test.txt"), b"hello world\n".to_vec())];

    let mut dir = file_header("fixtures/");
    dir.entry_type = EntryType::Directory;
    dir.mode = 0o755;
    entries.push((dir, Vec::new()));

    entries.push((file_header("fixtures/random.bin"), random_bytes(70_001, 7)));

    let mut link = file_header("fixtures/link");
    link.entry_type = EntryType::Symlink;
    link.linkname = Some("random.bin".to_string());
    entries.push((link, Vec::new()));

    let split_name = format!("{}/{}", "nested".repeat(20), "name.txt");
    entries.push((file_header(&split_name), b"prefix split".to_vec()));

    let pax_name = format!("{}.txt", "x".repeat(300));
    entries.push((file_header(&pax_name), random_bytes(512, 9)));

    entries.push((file_header("empty.txt"), Vec::new()));
    entries
}

#[tokio::test]
async fn single_file_archive_layout() -> Result<()> {
    init_logger();
    let archive = pack_entries(PackOptions::default(), vec![(file_header("test.txt"), b"hello world\n".to_vec())]).await?;
    assert_eq!(archive.len(), 2048);
    assert!(archive[1024..].iter().all(|&b| b == 0));

    let entries = extract_chunked(&archive, archive.len()).await?;
    assert_eq!(entries.len(), 1);
    let header = &entries[0].header;
    assert_eq!(header.name, "test.txt");
    assert_eq!(header.mode, 0o644);
    assert_eq!(header.uid, 501);
    assert_eq!(header.gid, 20);
    assert_eq!(header.mtime, MTIME);
    assert_eq!(header.size, 12);
    assert_eq!(header.entry_type, EntryType::File);
    assert_eq!(header.pax, None);
    assert_eq!(entries[0].body, b"hello world\n");
    Ok(())
}

#[tokio::test]
async fn round_trip_for_any_chunk_size() -> Result<()> {
    init_logger();
    let input = mixed_entries();
    let archive = pack_entries(PackOptions::default(), input.clone()).await?;
    assert_eq!(archive.len() % 512, 0);

    let mut rng = StdRng::seed_from_u64(1387580181);
    let random_sizes: Vec<usize> = (0..64).map(|_| rng.random_range(1..2000)).collect();
    let plans: Vec<Vec<usize>> = vec![vec![1], vec![321], vec![archive.len()], random_sizes];

    for plan in plans {
        let entries = extract_with(ExtractOptions::default(), &archive, &plan).await?;
        assert_eq!(entries.len(), input.len(), "chunk plan {:?}", &plan[..plan.len().min(4)]);
        for (extracted, (header, body)) in entries.iter().zip(input.iter()) {
            assert_eq!(extracted.header.name, header.name);
            assert_eq!(extracted.header.entry_type, header.entry_type);
            assert_eq!(extracted.header.linkname, header.linkname);
            assert_eq!(extracted.body.len() as u64, extracted.header.size);
            assert_eq!(&extracted.body, body);
        }
    }
    Ok(())
}

#[tokio::test]
async fn offsets_point_at_headers() -> Result<()> {
    let entries = vec![
        (file_header("a"), vec![1u8; 600]),
        (file_header(&"x".repeat(200)), vec![2u8; 3]),
        (file_header("c"), Vec::new()),
    ];
    let archive = pack_entries(PackOptions::default(), entries).await?;
    let extracted = extract_chunked(&archive, 512).await?;
    assert_eq!(extracted[0].offset, 0);
    // the second entry is preceded by a PAX header and its records
    assert_eq!(extracted[1].offset, 1536 + 1024);
    assert_eq!(extracted[2].offset, 1536 + 1024 + 1024);
    for entry in &extracted {
        let offset = entry.offset as usize;
        assert_ne!(&archive[offset..offset + 512], &[0u8; 512][..]);
    }
    Ok(())
}

#[tokio::test]
async fn pax_path_overrides_name() -> Result<()> {
    let mut header = file_header("short.txt");
    header.pax = Some([("path", "renamed/by/pax.txt"), ("comment", "kept")].into_iter().collect());
    let archive = pack_entries(PackOptions::default(), vec![(header, b"pax".to_vec())]).await?;

    let entries = extract_chunked(&archive, 100).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].header.name, "renamed/by/pax.txt");
    let pax = entries[0].header.pax.as_ref().expect("pax attributes");
    assert_eq!(pax.get("comment"), Some("kept"));
    assert_eq!(entries[0].body, b"pax");
    Ok(())
}

#[tokio::test]
async fn symlink_target_written_to_sink() -> Result<()> {
    let (mut packer, mut stream) = pack(PackOptions::default());
    let writer = async move {
        let mut header = file_header("link");
        header.entry_type = EntryType::Symlink;
        let mut sink = packer.entry(header).await?;
        sink.write(b"tar").await?;
        sink.write(b"get").await?;
        sink.finish().await?;
        packer.finalize().await
    };
    let mut archive = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut archive));
    written?;
    read?;
    assert_eq!(archive.len(), 1536);

    let entries = extract_chunked(&archive, 1).await?;
    assert!(entries[0].header.is_symbolic_link());
    assert_eq!(entries[0].header.linkname.as_deref(), Some("target"));
    assert_eq!(entries[0].header.size, 0);
    assert!(entries[0].body.is_empty());
    Ok(())
}

#[tokio::test]
async fn large_uid_with_and_without_gnu_extension() -> Result<()> {
    let mut header = file_header("owner");
    header.uid = 1000000001;
    header.gid = 1000000002;

    let gnu = PackOptions { allow_gnu_extension: true, ..Default::default() };
    let archive = pack_entries(gnu, vec![(header.clone(), b"x".to_vec())]).await?;
    assert_eq!(archive.len(), 2048);
    let entries = extract_chunked(&archive, 512).await?;
    assert_eq!(entries[0].header.uid, 1000000001);
    assert_eq!(entries[0].header.gid, 1000000002);
    assert_eq!(entries[0].header.pax, None);

    let archive = pack_entries(PackOptions::default(), vec![(header, b"x".to_vec())]).await?;
    let entries = extract_chunked(&archive, 512).await?;
    assert_eq!(entries[0].header.uid, 1000000001);
    assert_eq!(entries[0].header.gid, 1000000002);
    assert_eq!(entries[0].header.pax.as_ref().and_then(|p| p.uid()), Some(1000000001));
    Ok(())
}

#[tokio::test]
async fn streamed_body_and_copy_from() -> Result<()> {
    let data = random_bytes(10_000, 3);
    let (mut packer, mut stream) = pack(PackOptions::default());
    let body = data.clone();
    let writer = async move {
        let mut header = file_header("streamed.bin");
        header.size = body.len() as u64;
        let mut sink = packer.entry(header).await?;
        assert_eq!(sink.copy_from(body.as_slice()).await?, 10_000);
        sink.finish().await?;
        packer.finalize().await
    };
    let mut archive = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut archive));
    written?;
    read?;

    let entries = extract_chunked(&archive, 4096).await?;
    assert_eq!(entries[0].body, data);
    Ok(())
}

#[tokio::test]
async fn finalize_waits_for_open_entry() -> Result<()> {
    let (mut packer, mut stream) = pack(PackOptions::default());
    let writer = async move {
        let mut header = file_header("late.txt");
        header.size = 4;
        let mut sink = packer.entry(header).await?;
        packer.finalize().await?;
        sink.write(b"late").await?;
        sink.finish().await?;
        match packer.entry_with_data(file_header("after"), b"").await {
            Err(Error::ProtocolMisuse(_)) => {}
            other => panic!("expected protocol misuse, got {:?}", other),
        }
        packer.finalize().await
    };
    let mut archive = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut archive));
    written?;
    read?;
    assert_eq!(archive.len(), 2048);
    assert_eq!(extract_chunked(&archive, 512).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn second_open_entry_is_fatal() -> Result<()> {
    let (mut packer, mut stream) = pack(PackOptions::default());
    let writer = async move {
        let mut header = file_header("first");
        header.size = 10;
        let _sink = packer.entry(header).await?;
        let second = packer.entry(file_header("second")).await;
        assert!(matches!(second, Err(Error::ProtocolMisuse(_))));
        rtar_stream::Result::Ok(())
    };
    let mut archive = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut archive));
    written?;
    let err = read.expect_err("archive stream must fail");
    assert!(matches!(Error::from(err), Error::ProtocolMisuse(_)));
    Ok(())
}

#[tokio::test]
async fn short_body_is_a_size_mismatch() -> Result<()> {
    let (mut packer, mut stream) = pack(PackOptions::default());
    let writer = async move {
        let mut header = file_header("short");
        header.size = 10;
        let mut sink = packer.entry(header).await?;
        sink.write(b"12345").await?;
        sink.finish().await
    };
    let mut archive = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut archive));
    match written {
        Err(Error::SizeMismatch { declared: 10, written: 5 }) => {}
        other => panic!("expected size mismatch, got {:?}", other),
    }
    assert!(read.is_err());
    Ok(())
}

#[tokio::test]
async fn body_for_directory_is_rejected() -> Result<()> {
    let (mut packer, _stream) = pack(PackOptions::default());
    let mut header = file_header("dir");
    header.entry_type = EntryType::Directory;
    let mut sink = packer.entry(header).await?;
    assert!(matches!(sink.write(b"nope").await, Err(Error::ProtocolMisuse(_))));
    assert!(matches!(packer.finalize().await, Err(Error::ProtocolMisuse(_))));
    Ok(())
}

#[tokio::test]
async fn dropped_sink_fails_the_archive() -> Result<()> {
    let (mut packer, mut stream) = pack(PackOptions::default());
    let writer = async move {
        let mut header = file_header("abandoned");
        header.size = 10;
        let sink = packer.entry(header).await?;
        drop(sink);
        packer.finalize().await
    };
    let mut archive = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut archive));
    assert!(matches!(written, Err(Error::Destroyed(_))));
    assert!(matches!(read.map_err(Error::from), Err(Error::Destroyed(_))));
    Ok(())
}

#[tokio::test]
async fn destroyed_pack_fails_sink_and_stream() -> Result<()> {
    let (mut packer, mut stream) = pack(PackOptions::default());
    let mut header = file_header("open");
    header.size = 10;
    let mut sink = packer.entry(header).await?;
    packer.destroy(None);

    assert!(matches!(sink.write(b"0123456789").await, Err(Error::Destroyed(_))));
    let mut archive = Vec::new();
    let err = stream.read_to_end(&mut archive).await.expect_err("stream must fail");
    match Error::from(err) {
        Error::Destroyed(msg) => assert_eq!(msg, "pack engine destroyed"),
        other => panic!("expected destroyed, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn dropped_stream_fails_the_writer() -> Result<()> {
    let (mut packer, stream) = pack(PackOptions { capacity: 1, ..Default::default() });
    drop(stream);
    let result = packer.entry_with_data(file_header("a"), b"a").await;
    assert!(matches!(result, Err(Error::Destroyed(_))));
    Ok(())
}

#[tokio::test]
async fn pack_output_waits_for_reader() -> Result<()> {
    let (mut packer, mut stream) = pack(PackOptions { capacity: 1, ..Default::default() });
    let mut header = file_header("slow.bin");
    header.size = 1024;
    let mut sink = packer.entry(header).await?;

    {
        let write = sink.write(&[7u8; 1024]);
        tokio::pin!(write);
        tokio::select! {
            biased;
            _ = &mut write => panic!("body accepted while the archive reader is behind"),
            _ = tokio::task::yield_now() => {}
        }
        let mut block = [0u8; 512];
        stream.read_exact(&mut block).await?;
        write.await?;
    }

    let writer = async move {
        sink.finish().await?;
        packer.finalize().await
    };
    let mut rest = Vec::new();
    let (written, read) = tokio::join!(writer, stream.read_to_end(&mut rest));
    written?;
    read?;
    assert_eq!(rest.len(), 1024 + 1024);
    Ok(())
}

#[tokio::test]
async fn extract_waits_for_body_reader() -> Result<()> {
    let archive = pack_entries(PackOptions::default(), vec![(file_header("slow.bin"), vec![5u8; 2048])]).await?;
    let (mut extractor, mut entries) = extract(ExtractOptions { body_capacity: 1, ..Default::default() });

    extractor.write(&archive[..512]).await?;
    extractor.write(&archive[512..1024]).await?;
    let mut entry = {
        let write = extractor.write(&archive[1024..1536]);
        tokio::pin!(write);
        tokio::select! {
            biased;
            _ = &mut write => panic!("body forwarded while the entry reader is behind"),
            _ = tokio::task::yield_now() => {}
        }
        let mut entry = entries.next().await.expect("entry")?;
        let mut first = [0u8; 512];
        entry.body.read_exact(&mut first).await?;
        write.await?;
        entry
    };

    let feeder = async {
        extractor.write(&archive[1536..]).await?;
        extractor.finish().await
    };
    let reader = async move {
        let mut rest = Vec::new();
        entry.body.read_to_end(&mut rest).await?;
        entry.unlock.unlock();
        rtar_stream::Result::Ok(rest.len())
    };
    let (fed, read) = tokio::join!(feeder, reader);
    fed?;
    assert_eq!(read?, 1536);
    assert!(entries.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn next_entry_waits_for_unlock() -> Result<()> {
    let entries = vec![(file_header("one"), b"1".to_vec()), (file_header("two"), b"2".to_vec())];
    let archive = pack_entries(PackOptions::default(), entries).await?;
    let (mut extractor, mut entries) = extract(ExtractOptions::default());
    let feeder = tokio::spawn(async move { extractor.consume(archive.as_slice()).await });

    let mut first = entries.next().await.expect("first entry")?;
    first.body.skip().await?;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::select! {
        biased;
        _ = entries.next() => panic!("second entry emitted before the first was unlocked"),
        _ = tokio::task::yield_now() => {}
    }
    first.unlock.unlock();

    let mut second = entries.next().await.expect("second entry")?;
    assert_eq!(second.header.name, "two");
    let mut body = String::new();
    second.body.read_to_string(&mut body).await?;
    assert_eq!(body, "2");
    second.unlock.unlock();

    assert!(entries.next().await.is_none());
    feeder.await??;
    Ok(())
}

#[tokio::test]
async fn truncated_archive_fails() -> Result<()> {
    let archive = pack_entries(PackOptions::default(), vec![(file_header("cut.bin"), vec![1u8; 2000])]).await?;
    for cut in [100, 700, 2100] {
        match extract_chunked(&archive[..cut], 333).await {
            Err(Error::TruncatedArchive) => {}
            other => panic!("cut at {}: expected truncated archive, got {:?}", cut, other),
        }
    }
    Ok(())
}

#[tokio::test]
async fn corrupted_header_fails() -> Result<()> {
    let mut archive = pack_entries(PackOptions::default(), vec![(file_header("bad"), b"bad".to_vec())]).await?;
    archive[10] ^= 0x20;
    match extract_chunked(&archive, 512).await {
        Err(Error::MalformedHeader(_)) => {}
        other => panic!("expected malformed header, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn engine_error_is_reported_once() -> Result<()> {
    let mut archive = pack_entries(PackOptions::default(), vec![(file_header("bad"), b"bad".to_vec())]).await?;
    archive[10] ^= 0x20;
    let (mut extractor, mut entries) = extract(ExtractOptions::default());
    let feeder = async { extractor.consume(archive.as_slice()).await };
    let reader = async {
        let mut errors = Vec::new();
        for _ in 0..5 {
            match entries.next().await {
                Some(Ok(entry)) => panic!("unexpected entry {}", entry.header.name),
                Some(Err(err)) => errors.push(err),
                None => break,
            }
        }
        errors
    };
    let (fed, errors) = tokio::join!(feeder, reader);
    assert!(matches!(fed, Err(Error::MalformedHeader(_))));
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::MalformedHeader(_)));
    assert!(entries.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn dropped_unlock_fails_the_engine() -> Result<()> {
    let entries = vec![(file_header("one"), Vec::new()), (file_header("two"), Vec::new())];
    let archive = pack_entries(PackOptions::default(), entries).await?;
    let (mut extractor, mut entries) = extract(ExtractOptions::default());
    let feeder = async { extractor.consume(archive.as_slice()).await };
    let reader = async {
        let entry = entries.next().await.expect("entry")?;
        drop(entry);
        match entries.next().await {
            Some(Err(err)) => rtar_stream::Result::Ok(err),
            other => panic!("expected an engine error, got {:?}", other.map(|e| e.map(|e| e.header))),
        }
    };
    let (fed, read) = tokio::join!(feeder, reader);
    assert!(matches!(fed, Err(Error::Destroyed(_))));
    assert!(matches!(read?, Error::Destroyed(_)));
    Ok(())
}

#[tokio::test]
async fn dropped_body_fails_the_engine() -> Result<()> {
    let archive = pack_entries(PackOptions::default(), vec![(file_header("big"), vec![1u8; 100_000])]).await?;
    let (mut extractor, mut entries) = extract(ExtractOptions::default());
    let feeder = async { extractor.consume(archive.as_slice()).await };
    let reader = async {
        let mut entry = entries.next().await.expect("entry")?;
        let mut head = [0u8; 10];
        entry.body.read_exact(&mut head).await?;
        entry.unlock.unlock();
        drop(entry.body);
        rtar_stream::Result::Ok(())
    };
    let (fed, read) = tokio::join!(feeder, reader);
    read?;
    assert!(matches!(fed, Err(Error::Destroyed(_))));
    Ok(())
}

#[tokio::test]
async fn destroyed_engine_fails_the_body() -> Result<()> {
    let archive = pack_entries(PackOptions::default(), vec![(file_header("big"), vec![1u8; 4096])]).await?;
    let (mut extractor, mut entries) = extract(ExtractOptions::default());
    extractor.write(&archive[..1024]).await?;
    let mut entry = entries.next().await.expect("entry")?;
    extractor.destroy(Some(Error::Destroyed("caller gave up".to_string())));

    let mut body = Vec::new();
    let err = entry.body.read_to_end(&mut body).await.expect_err("body must fail");
    assert!(matches!(Error::from(err), Error::Destroyed(msg) if msg == "caller gave up"));
    assert!(matches!(entries.next().await, Some(Err(Error::Destroyed(_)))));
    entry.unlock.unlock();
    Ok(())
}

#[tokio::test]
async fn write_after_finish_is_rejected() -> Result<()> {
    let archive = pack_entries(PackOptions::default(), Vec::new()).await?;
    assert_eq!(archive.len(), 1024);
    let (mut extractor, mut entries) = extract(ExtractOptions::default());
    extractor.write(&archive).await?;
    extractor.finish().await?;
    assert!(entries.next().await.is_none());
    assert!(matches!(extractor.write(b"more").await, Err(Error::ProtocolMisuse(_))));
    Ok(())
}

#[tokio::test]
async fn entries_from_a_duplex_pipe() -> Result<()> {
    let archive = pack_entries(PackOptions::default(), mixed_entries()).await?;
    let (mut client, server) = tokio::io::duplex(1000);
    let (mut extractor, mut entries) = extract(ExtractOptions::default());

    let producer = async move {
        client.write_all(&archive).await?;
        client.shutdown().await?;
        rtar_stream::Result::Ok(())
    };
    let feeder = extractor.consume(server);
    let reader = async {
        let mut names = Vec::new();
        while let Some(entry) = entries.next().await {
            let mut entry = entry?;
            entry.body.skip().await?;
            names.push(entry.header.name.clone());
            entry.unlock.unlock();
        }
        rtar_stream::Result::Ok(names)
    };
    let (produced, fed, names) = tokio::join!(producer, feeder, reader);
    produced?;
    fed?;
    assert_eq!(names?.len(), mixed_entries().len());
    Ok(())
}
