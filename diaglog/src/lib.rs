/// Diagnostic data from a document database server comes in two shapes.
/// *Archives* are binary capture files: a flat concatenation of
/// length-prefixed BSON frames, where a type-0 frame describes the server
/// (host OS, hardware, build) and a type-1 frame carries a zlib-compressed
/// block of metric samples.  *Server logs* are line-oriented text: a
/// configuration banner near the top, then operational records, some of
/// which are slow-operation lines ending in a duration.
///
/// This library has as its fundamental task to turn both shapes into
/// something a person can act on.  That breaks down into a number of
/// subtasks:
///
/// - Walk an archive buffer frame by frame, tolerating the truncation and
///   corruption that capture files routinely exhibit.
///
/// - Inflate and decode sample chunks, projecting each into one
///   representative sample per series.
///
/// - Fan a directory of archive files out over a bounded worker pool and
///   merge the per-file results deterministically, in path order.
///
/// - Canonicalize slow-operation log lines into pattern keys, so that
///   operations differing only in literal values aggregate together.
///
/// - Aggregate per-pattern performance statistics, keep the slowest
///   operations verbatim, and render and persist the result.
mod archive;
mod chunk;
mod dataset;
mod dates;
mod frames;
mod linereader;
mod pattern;
mod slowlog;

// Types and utilities for manipulating timestamps.

pub use dates::epoch;
pub use dates::format_timestamp;
pub use dates::now;
pub use dates::parse_timestamp;
pub use dates::Timestamp;

// The mutable aggregate all archive ingest lands in: the server-info
// document plus three sample series.  `ingest` reads archive files or
// directories (binary capture or textual snapshots); `save_stats` writes the
// series back out as a textual snapshot.

pub use dataset::DiagnosticData;
pub use dataset::DEFAULT_SPAN_SECONDS;

// The typed sample documents making up the series.

pub use dataset::{Connections, Mem, OpCounters, ReplMember, ReplSetStatus, ServerStatus, SystemMetrics};

// Filename prefixes an archive directory is filtered by.

pub use archive::{METRICS_PREFIX, STATS_PREFIX};

// Walk a byte buffer as a sequence of length-prefixed framed documents.

pub use frames::FrameReader;

// Decode a type-1 chunk: extract and inflate its payload, then decode the
// representative sample from the inflated block.

pub use chunk::{decode_block, inflate, ChunkSample};

// A buffered line reader that transparently decompresses gzipped sources and
// returns over-long lines in pieces for the caller to reassemble.

pub use linereader::LineReader;

// Canonicalization of slow-operation log lines: balanced-brace document
// extraction and the value-elision cascade that produces pattern keys.

pub use pattern::balanced_braces;
pub use pattern::canonicalize;
pub use pattern::doc_by_field;
pub use pattern::elide_values;
pub use pattern::SlowOpLine;
pub use pattern::COLLSCAN;

// The slow-operation log analyzer and its persisted report.

pub use slowlog::load_report;
pub use slowlog::milli_to_time_string;
pub use slowlog::LogAnalyzer;
pub use slowlog::LogReport;
pub use slowlog::OpPattern;
pub use slowlog::SlowOp;
pub use slowlog::{SLOW_OP_FLOOR_MILLIS, TOP_SLOW_OPS};
