/// Decode type-1 archive chunks.
///
/// A chunk document carries a `data` field: four header bytes (a sample
/// count, unused here) followed by a zlib stream.  The inflated bytes are a
/// sample block, a BSON document whose top-level fields include `start`,
/// `end`, `serverStatus`, `replSetGetStatus` and `systemMetrics`, followed by
/// delta-encoded samples.  Only the leading reference document is decoded;
/// one representative sample per chunk is enough at this detail level, and
/// the delta stream is left for a future downsampling pass.
use crate::dataset::{doc_time, ReplSetStatus, ServerStatus, SystemMetrics};
use crate::dates::Timestamp;
use anyhow::{bail, Context, Result};
use bson::{Bson, Document};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// The representative sample decoded from one chunk.
#[derive(Debug)]
pub struct ChunkSample {
    pub start: Timestamp,
    pub end: Timestamp,
    pub server_status: ServerStatus,
    pub repl_status: ReplSetStatus,
    pub system_metrics: SystemMetrics,
}

/// Extract and inflate the compressed payload of a chunk document.
pub fn inflate(doc: &Document) -> Result<Vec<u8>> {
    let data = match doc.get("data") {
        Some(Bson::Binary(bin)) => &bin.bytes,
        _ => bail!("chunk has no binary data field"),
    };
    if data.len() < 4 {
        bail!("chunk payload too short: {} bytes", data.len());
    }
    let mut inflated = Vec::new();
    ZlibDecoder::new(&data[4..])
        .read_to_end(&mut inflated)
        .context("inflating chunk payload")?;
    Ok(inflated)
}

/// Decode the reference document of an inflated sample block.
pub fn decode_block(block: &[u8]) -> Result<ChunkSample> {
    let doc = Document::from_reader(block).context("decoding sample block")?;
    let server_status = match doc.get_document("serverStatus") {
        Ok(d) => ServerStatus::from_document(d),
        Err(_) => ServerStatus::default(),
    };
    let repl_status = match doc.get_document("replSetGetStatus") {
        Ok(d) => ReplSetStatus::from_document(d),
        Err(_) => ReplSetStatus::default(),
    };
    let system_metrics = match doc.get_document("systemMetrics") {
        Ok(d) => SystemMetrics::from_document(d),
        Err(_) => SystemMetrics::default(),
    };
    Ok(ChunkSample {
        start: doc_time(&doc, "start"),
        end: doc_time(&doc, "end"),
        server_status,
        repl_status,
        system_metrics,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for chunk bytes, shared with the archive tests.
    use bson::{doc, Bson, Document};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// A minimal sample block for a given host and time.
    pub fn sample_block(host: &str, millis: i64) -> Document {
        doc! {
            "start": bson::DateTime::from_millis(millis),
            "serverStatus": {
                "host": host,
                "localTime": bson::DateTime::from_millis(millis),
                "mem": { "resident": 512, "virtual": 1024 },
            },
            "replSetGetStatus": { "set": "rs0", "myState": 1 },
            "systemMetrics": { "cpu": { "idle_ms": 9_i64 } },
            "end": bson::DateTime::from_millis(millis + 1000),
        }
    }

    /// Wrap a sample block the way an archive does: count header, zlib
    /// stream, binary field in a type-1 document.
    pub fn chunk_doc(block: &Document) -> Document {
        let mut payload = 1u32.to_le_bytes().to_vec();
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&bson::to_vec(block).unwrap()).unwrap();
        payload.extend(enc.finish().unwrap());
        doc! {
            "type": 1,
            "data": Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: payload,
            }),
        }
    }
}

// This tests:
//  - the inflate + decode pipeline recovers the representative sample

#[test]
fn test_chunk_roundtrip() {
    let block = fixtures::sample_block("db-0.example.com", 1507838933000);
    let chunk = fixtures::chunk_doc(&block);

    let inflated = inflate(&chunk).unwrap();
    let sample = decode_block(&inflated).unwrap();
    assert!(sample.server_status.host == "db-0.example.com");
    assert!(sample.server_status.mem.resident == 512);
    assert!(sample.repl_status.set == "rs0");
    assert!(sample.system_metrics.cpu["idle_ms"] == 9);
    assert!(sample.end - sample.start == chrono::Duration::seconds(1));
}

// This tests:
//  - missing/short/corrupt payloads fail without panicking

#[test]
fn test_chunk_bad_payload() {
    use bson::doc;

    assert!(inflate(&doc! { "type": 1 }).is_err());
    assert!(inflate(&doc! { "type": 1, "data": "not binary" }).is_err());

    let short = doc! {
        "type": 1,
        "data": Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: vec![0, 0],
        }),
    };
    assert!(inflate(&short).is_err());

    let junk = doc! {
        "type": 1,
        "data": Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: vec![0, 0, 0, 0, 1, 2, 3, 4],
        }),
    };
    assert!(inflate(&junk).is_err());

    assert!(decode_block(&[1, 2, 3]).is_err());
}

// This tests:
//  - a block missing some series still decodes, with defaults filled in

#[test]
fn test_chunk_partial_block() {
    use bson::doc;

    let block = doc! {
        "start": bson::DateTime::from_millis(0),
        "serverStatus": { "host": "h" },
    };
    let sample = decode_block(&bson::to_vec(&block).unwrap()).unwrap();
    assert!(sample.server_status.host == "h");
    assert!(sample.repl_status.set.is_empty());
    assert!(sample.system_metrics.cpu.is_empty());
}
