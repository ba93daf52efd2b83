/// Reading diagnostic archives into a DiagnosticData.
///
/// An archive directory is a flat set of files; only children named
/// `metrics.*` (binary capture files) or `keyhole_stats.*` (previously
/// persisted textual snapshots) are considered.  Binary files are fanned out
/// over a bounded worker pool, one file per task; each task decodes into its
/// own bucket and the buckets are merged in input-path order after the pool
/// drains, so completion order never disturbs series order.  Archive
/// filenames are time-sortable, which makes concatenation in path order
/// yield globally time-sorted series without an explicit sort.
///
/// Textual snapshots are ingested serially; they are cheap to parse and
/// their lines are already whole samples.
use crate::chunk;
use crate::dataset::{DiagnosticData, ReplSetStatus, ServerStatus};
use crate::frames::FrameReader;
use crate::linereader::LineReader;
use anyhow::{bail, Context, Result};
use bson::Bson;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;
use tracing::{info, warn};

/// Filename prefix of binary capture files.
pub const METRICS_PREFIX: &str = "metrics.";

/// Filename prefix of persisted textual snapshots.
pub const STATS_PREFIX: &str = "keyhole_stats.";

// Samples per line in a persisted snapshot.
const STATS_LINE_DOCS: usize = 100;

impl DiagnosticData {
    /// Ingest every archive named by `paths`.  A directory contributes its
    /// matching children in name order; a regular file contributes itself.
    /// When any selected file is a textual snapshot, all files take the
    /// textual path; otherwise the binary fan-out runs.  Fails when a path
    /// cannot be read or when nothing matched at all.
    pub fn ingest(&mut self, paths: &[String]) -> Result<()> {
        let mut filenames: Vec<String> = Vec::new();
        for path in paths {
            let meta = fs::metadata(path).with_context(|| format!("stat {path}"))?;
            if meta.is_dir() {
                filenames.extend(scan_archive_dir(path)?);
            } else {
                filenames.push(path.clone());
            }
        }
        if filenames.is_empty() {
            bail!("no archive files found");
        }
        if filenames
            .iter()
            .any(|f| basename(f).starts_with(STATS_PREFIX))
        {
            for f in &filenames {
                self.read_stats_file(f)?;
            }
            return Ok(());
        }
        self.read_archive_files(&filenames)
    }

    // Fan the binary files out over the pool, then merge per-file buckets in
    // the original path order.
    fn read_archive_files(&mut self, filenames: &[String]) -> Result<()> {
        let started = Instant::now();
        info!(files = filenames.len(), "reading diagnostic archives");

        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(4)
            .min(filenames.len());
        let next = AtomicUsize::new(0);
        let span = self.span_seconds();
        let mut buckets: Vec<Option<Result<DiagnosticData>>> = Vec::new();
        buckets.resize_with(filenames.len(), || None);

        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    let ix = next.fetch_add(1, Ordering::Relaxed);
                    if ix >= filenames.len() {
                        break;
                    }
                    let result = read_archive_file(&filenames[ix], span);
                    if tx.send((ix, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);
            // The receive loop doubles as the completion barrier: it ends
            // when every worker has dropped its sender.
            for (ix, result) in rx {
                buckets[ix] = Some(result);
            }
        });

        for (ix, bucket) in buckets.into_iter().enumerate() {
            match bucket {
                Some(Ok(data)) => self.merge(data),
                Some(Err(err)) => {
                    warn!(file = %filenames[ix], error = %err, "archive file failed")
                }
                None => warn!(file = %filenames[ix], "archive worker produced no result"),
            }
        }
        info!(files = filenames.len(), elapsed = ?started.elapsed(), "archives loaded");
        Ok(())
    }

    // Textual snapshot: every non-empty line is a JSON array of samples,
    // either server statuses (recognized by a host on the first element) or
    // repl-set statuses.
    fn read_stats_file(&mut self, filename: &str) -> Result<()> {
        let mut reader = LineReader::open(filename)?;
        let mut statuses: Vec<ServerStatus> = Vec::new();
        let mut repls: Vec<ReplSetStatus> = Vec::new();
        while let Some((mut line, mut continued)) = reader.read_line()? {
            while continued {
                match reader.read_line()? {
                    Some((more, c)) => {
                        line.push_str(&more);
                        continued = c;
                    }
                    None => break,
                }
            }
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(docs) = serde_json::from_str::<Vec<ServerStatus>>(&line) {
                if !docs.is_empty() && !docs[0].host.is_empty() {
                    statuses.extend(docs);
                    continue;
                }
            }
            if let Ok(docs) = serde_json::from_str::<Vec<ReplSetStatus>>(&line) {
                repls.extend(docs);
            }
        }
        if statuses.is_empty() && repls.is_empty() {
            bail!("no documents found in {filename}");
        }
        self.server_status.extend(statuses);
        self.repl_status.extend(repls);
        Ok(())
    }

    /// Persist the decoded series as a textual snapshot that the stats path
    /// of `ingest` reads back: JSON arrays of server-status samples, one
    /// line each, followed by the repl-set samples.
    pub fn save_stats(&self, filename: &str) -> Result<()> {
        let mut out = String::new();
        for docs in self.server_status.chunks(STATS_LINE_DOCS) {
            out.push_str(&serde_json::to_string(docs)?);
            out.push('\n');
        }
        for docs in self.repl_status.chunks(STATS_LINE_DOCS) {
            out.push_str(&serde_json::to_string(docs)?);
            out.push('\n');
        }
        fs::write(filename, out).with_context(|| format!("write {filename}"))?;
        Ok(())
    }
}

// List the matching children of an archive directory, in name order.
fn scan_archive_dir(dirname: &str) -> Result<Vec<String>> {
    let mut filenames: Vec<String> = Vec::new();
    for entry in fs::read_dir(dirname).with_context(|| format!("read dir {dirname}"))? {
        let Ok(entry) = entry else {
            // Bad directory entries are ignored; the read_dir iterator is
            // assumed to make progress past them.
            continue;
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            // Non-UTF8 names can never match the prefixes we look for.
            continue;
        };
        if name.starts_with(METRICS_PREFIX) || name.starts_with(STATS_PREFIX) {
            filenames.push(format!("{}/{}", dirname, name));
        }
    }
    filenames.sort();
    Ok(filenames)
}

// Read one archive file: every frame is dispatched on its type.  Type 0
// carries the server-info document, type 1 a compressed sample chunk.  A
// chunk that fails to inflate is skipped; a sample block that fails to
// decode fails the file.
fn read_archive_file(filename: &str, span_seconds: u32) -> Result<DiagnosticData> {
    let started = Instant::now();
    let buffer = fs::read(filename).with_context(|| format!("read {filename}"))?;
    let mut data = DiagnosticData::new(span_seconds);
    let mut chunks = 0usize;
    for doc in FrameReader::new(&buffer) {
        match frame_type(&doc) {
            Some(0) => {
                if let Ok(info) = doc.get_document("doc") {
                    data.server_info = Some(info.clone());
                }
            }
            Some(1) => {
                let payload = match chunk::inflate(&doc) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(file = %filename, error = %err, "skipping chunk");
                        continue;
                    }
                };
                let sample = chunk::decode_block(&payload)?;
                chunks += 1;
                data.server_status.push(sample.server_status);
                data.repl_status.push(sample.repl_status);
                data.system_metrics.push(sample.system_metrics);
            }
            Some(kind) => warn!(file = %filename, kind, "unknown frame type"),
            None => warn!(file = %filename, "frame has no usable type field"),
        }
    }
    info!(file = %basename(filename), chunks, elapsed = ?started.elapsed(), "archive file decoded");
    Ok(data)
}

fn frame_type(doc: &bson::Document) -> Option<i64> {
    match doc.get("type") {
        Some(Bson::Int32(n)) => Some(*n as i64),
        Some(Bson::Int64(n)) => Some(*n),
        Some(Bson::Double(n)) => Some(*n as i64),
        _ => None,
    }
}

fn basename(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::fixtures::{chunk_doc, sample_block};
    use bson::doc;

    fn write_archive(path: &Path, frames: &[bson::Document]) {
        let mut buf: Vec<u8> = Vec::new();
        for f in frames {
            buf.extend(bson::to_vec(f).unwrap());
        }
        fs::write(path, buf).unwrap();
    }

    // This tests:
    //  - a directory of two archives merges in name order: three samples,
    //    time-sorted, and the last file's server info wins
    //  - non-matching children are ignored
    #[test]
    fn test_ingest_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(
            &dir.path().join("metrics.2017-10-12T20-08-53Z-00000"),
            &[
                chunk_doc(&sample_block("db-0", 1000)),
                chunk_doc(&sample_block("db-0", 2000)),
            ],
        );
        write_archive(
            &dir.path().join("metrics.2017-10-12T21-08-53Z-00000"),
            &[
                doc! { "type": 0, "doc": { "hostInfo": { "system": { "hostname": "db-0" } } } },
                chunk_doc(&sample_block("db-0", 3000)),
            ],
        );
        fs::write(dir.path().join("README"), b"not an archive").unwrap();

        let mut data = DiagnosticData::new(0);
        data.ingest(&[dir.path().to_str().unwrap().to_string()])
            .unwrap();

        assert!(data.server_status.len() == 3);
        assert!(data.repl_status.len() == 3);
        assert!(data.system_metrics.len() == 3);
        for w in data.server_status.windows(2) {
            assert!(w[0].local_time <= w[1].local_time);
        }
        let info = data.server_info.as_ref().unwrap();
        assert!(info.get_document("hostInfo").is_ok());
    }

    // This tests:
    //  - many files through the pool still merge deterministically in path
    //    order
    #[test]
    fn test_ingest_many_files_ordered() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            write_archive(
                &dir.path().join(format!("metrics.2017-10-12T20-08-{:02}Z", i)),
                &[chunk_doc(&sample_block("db-0", 1000 * (i as i64 + 1)))],
            );
        }
        let mut data = DiagnosticData::new(0);
        data.ingest(&[dir.path().to_str().unwrap().to_string()])
            .unwrap();
        assert!(data.server_status.len() == 20);
        for w in data.server_status.windows(2) {
            assert!(w[0].local_time < w[1].local_time);
        }
    }

    // This tests:
    //  - a corrupt file is recorded and skipped while its peers load
    #[test]
    fn test_ingest_corrupt_peer() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(
            &dir.path().join("metrics.aaa"),
            &[chunk_doc(&sample_block("db-0", 1000))],
        );
        // A chunk whose inflated bytes are not a sample block.
        let mut payload = 1u32.to_le_bytes().to_vec();
        {
            use flate2::write::ZlibEncoder;
            use flate2::Compression;
            use std::io::Write;
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(b"garbage").unwrap();
            payload.extend(enc.finish().unwrap());
        }
        write_archive(
            &dir.path().join("metrics.bbb"),
            &[doc! { "type": 1, "data": Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: payload,
            }) }],
        );

        let mut data = DiagnosticData::new(0);
        data.ingest(&[dir.path().to_str().unwrap().to_string()])
            .unwrap();
        assert!(data.server_status.len() == 1);
    }

    // This tests:
    //  - a snapshot round-trips through save_stats and the textual path
    //  - a snapshot with no usable documents is a no-data error
    #[test]
    fn test_stats_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = DiagnosticData::new(0);
        for i in 0..3 {
            let mut ss = ServerStatus::default();
            ss.host = "db-0".to_string();
            ss.local_time = crate::dates::epoch() + chrono::Duration::seconds(i);
            data.server_status.push(ss);
        }
        data.repl_status.push(ReplSetStatus::default());
        let stats = dir.path().join("keyhole_stats.2017-10-12");
        data.save_stats(stats.to_str().unwrap()).unwrap();

        let mut back = DiagnosticData::new(0);
        back.ingest(&[stats.to_str().unwrap().to_string()]).unwrap();
        assert!(back.server_status.len() == 3);
        assert!(back.repl_status.len() == 1);
        assert!(back.server_status[0].host == "db-0");

        let empty = dir.path().join("keyhole_stats.empty");
        fs::write(&empty, "\n\n").unwrap();
        let mut none = DiagnosticData::new(0);
        assert!(none.ingest(&[empty.to_str().unwrap().to_string()]).is_err());
    }

    // This tests:
    //  - a missing path fails ingest outright
    //  - an empty directory is a no-data error
    #[test]
    fn test_ingest_errors() {
        let mut data = DiagnosticData::new(0);
        assert!(data.ingest(&["/nonexistent/archive77".to_string()]).is_err());

        let dir = tempfile::tempdir().unwrap();
        let mut data = DiagnosticData::new(0);
        assert!(data
            .ingest(&[dir.path().to_str().unwrap().to_string()])
            .is_err());
    }
}
