/// Slow-operation analysis of a server log file.
///
/// The analyzer makes three passes over one (possibly gzipped) log file:
/// count lines for the progress meter, collect the configuration banner from
/// the top of the file, then scan every line for slow operations.  Slow ops
/// are canonicalized (see pattern.rs) and aggregated per pattern key;
/// operations of ten seconds or more are additionally kept verbatim in a
/// bounded top-ten list.  The result is rendered as a textual summary and
/// persisted to disk in a binary form this implementation can reload.
use crate::linereader::LineReader;
use crate::pattern::{self, COLLSCAN};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;
use ustr::Ustr;

/// An op must take this long to make the top-slow-ops list.
pub const SLOW_OP_FLOOR_MILLIS: usize = 10_000;

/// How many slow ops are retained.
pub const TOP_SLOW_OPS: usize = 10;

/// Aggregated performance data for one query pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpPattern {
    /// count, delete, find, remove, update, aggregate, getMore
    pub command: String,
    /// Number of contributing ops.
    pub count: usize,
    /// The canonical filter.
    pub filter: String,
    pub max_millis: usize,
    /// database.collection
    #[serde(with = "ustr_serde")]
    pub namespace: Ustr,
    /// "" or COLLSCAN.
    pub scan: String,
    pub total_millis: usize,
    /// Human label of the newest observed plan.
    pub index: String,
}

/// One operation that crossed the slow-op floor, kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowOp {
    pub millis: usize,
    pub line: String,
}

/// Everything the analyzer learned from one log file.  This is what gets
/// persisted; the format is private to this implementation.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogReport {
    pub patterns: Vec<OpPattern>,
    pub slow_ops: Vec<SlowOp>,
    pub banner: String,
    pub output_filename: String,
}

pub struct LogAnalyzer {
    filename: String,
    output_filename: String,
    collscan: bool,
    silent: bool,
    verbose: bool,
}

// Configuration banner lines near the top of the file.
static CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\S+ .? CONTROL\s+\[\w+\] (\w+(:)?) (.*)$").unwrap());

// The options document uses bare keys; quote them to get JSON.
static BARE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+):").unwrap());

impl LogAnalyzer {
    /// Create an analyzer for `filename`.  The persisted-result name is the
    /// input's basename, a trailing `.gz` stripped, plus `.enc`.
    pub fn new(filename: &str) -> LogAnalyzer {
        let mut base = Path::new(filename)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        if let Some(stripped) = base.strip_suffix(".gz") {
            base = stripped.to_string();
        }
        LogAnalyzer {
            filename: filename.to_string(),
            output_filename: base + ".enc",
            collscan: false,
            silent: false,
            verbose: false,
        }
    }

    /// Only aggregate collection scans.
    pub fn set_collscan(&mut self, collscan: bool) {
        self.collscan = collscan;
    }

    /// Suppress the stderr progress meter.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Include the configuration banner in the summary.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn output_filename(&self) -> &str {
        &self.output_filename
    }

    /// Run the analysis and render the textual summary.  The full report is
    /// also persisted to the output file; a write failure there is logged and
    /// the summary is still returned.
    pub fn analyze(&self) -> Result<String> {
        let report = self.parse()?;
        let mut summaries: Vec<String> = Vec::new();
        if self.verbose {
            summaries.push(report.banner.clone());
        }
        if !report.slow_ops.is_empty() {
            summaries.push(format!(
                "Ops slower than 10 seconds (list top {}):",
                report.slow_ops.len()
            ));
            for op in &report.slow_ops {
                summaries.push(format!(
                    "{} => {}",
                    milli_to_time_string(op.millis as f64),
                    op.line
                ));
            }
            summaries.push("\n".to_string());
        }
        summaries.push(patterns_summary(&report.patterns));
        match bincode::serialize(&report) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&self.output_filename, bytes) {
                    warn!(file = %self.output_filename, error = %err,
                          "could not persist analyzer result");
                }
            }
            Err(err) => warn!(error = %err, "could not encode analyzer result"),
        }
        Ok(summaries.join("\n"))
    }

    /// Parse the log file into a report without rendering or persisting.
    pub fn parse(&self) -> Result<LogReport> {
        // Pass one: line count, for the progress meter only.
        let line_count = LineReader::open(&self.filename)?.count_lines()?;

        // Pass two: the configuration banner.
        let mut reader = LineReader::open(&self.filename)?;
        let banner = read_banner(&mut reader)?;

        // Pass three: the slow-op scan.
        let mut reader = LineReader::open(&self.filename)?;
        let mut ops: HashMap<String, OpPattern> = HashMap::new();
        let mut slow_ops: Vec<SlowOp> = Vec::new();
        let mut lineno = 0usize;
        while let Some((mut line, mut continued)) = reader.read_line()? {
            // Reassemble lines the reader cut at its internal limit.
            while continued {
                match reader.read_line()? {
                    Some((more, c)) => {
                        line.push_str(&more);
                        continued = c;
                    }
                    None => break,
                }
            }
            lineno += 1;
            if !self.silent && line_count > 0 && lineno % 25 == 1 {
                eprint!("\r{:3}% ", 100 * lineno / line_count);
            }

            let Some(parsed) = pattern::canonicalize(&line, self.collscan) else {
                continue;
            };

            if parsed.millis >= SLOW_OP_FLOOR_MILLIS {
                slow_ops.push(SlowOp {
                    millis: parsed.millis,
                    line: line.clone(),
                });
                if slow_ops.len() > TOP_SLOW_OPS {
                    // Stable sort: on equal durations the earlier op stays.
                    slow_ops.sort_by(|a, b| b.millis.cmp(&a.millis));
                    slow_ops.truncate(TOP_SLOW_OPS);
                }
            }

            match ops.get_mut(&parsed.key) {
                Some(entry) => {
                    entry.count += 1;
                    entry.total_millis += parsed.millis;
                    entry.max_millis = entry.max_millis.max(parsed.millis);
                    entry.namespace = Ustr::from(parsed.namespace);
                    // Newest plan wins; later records reflect current
                    // planner choices.
                    entry.index = parsed.index;
                }
                None => {
                    ops.insert(
                        parsed.key,
                        OpPattern {
                            command: parsed.op.to_string(),
                            count: 1,
                            filter: parsed.filter,
                            max_millis: parsed.millis,
                            namespace: Ustr::from(parsed.namespace),
                            scan: parsed.scan.to_string(),
                            total_millis: parsed.millis,
                            index: parsed.index,
                        },
                    );
                }
            }
        }
        if !self.silent {
            eprint!("\r     \r");
        }

        let mut patterns: Vec<OpPattern> = ops.into_values().collect();
        patterns.sort_by(|a, b| {
            let x = a.total_millis as f64 / a.count as f64;
            let y = b.total_millis as f64 / b.count as f64;
            y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(LogReport {
            patterns,
            slow_ops,
            banner,
            output_filename: self.output_filename.clone(),
        })
    }
}

/// Reload a previously persisted report.
pub fn load_report(filename: &str) -> Result<LogReport> {
    Ok(bincode::deserialize(&std::fs::read(filename)?)?)
}

// Serde bridge for the interned namespace strings.
mod ustr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use ustr::Ustr;

    pub fn serialize<S: Serializer>(u: &Ustr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(u.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ustr, D::Error> {
        Ok(Ustr::from(&String::deserialize(d)?))
    }
}

// Collect the startup banner: `db` lines verbatim, then the `options:`
// document pretty-printed.  Scanning stops at the first `options:` line; the
// banner is expected early in the file.
fn read_banner(reader: &mut LineReader) -> Result<String> {
    let mut strs: Vec<String> = Vec::new();
    while let Some((line, _)) = reader.read_line()? {
        let Some(caps) = CONTROL.captures(&line) else {
            continue;
        };
        let key = caps.get(1).unwrap().as_str();
        let value = caps.get(3).unwrap().as_str();
        if key == "db" {
            strs.push(format!("db {}", value));
        } else if key == "options:" {
            strs.push("config options:".to_string());
            let quoted = BARE_KEY.replace_all(value, "\"${1}\":");
            match serde_json::from_str::<serde_json::Value>(&quoted) {
                Ok(v) => strs.push(
                    serde_json::to_string_pretty(&v).unwrap_or_else(|_| value.to_string()),
                ),
                // Malformed options are emitted verbatim.
                Err(_) => strs.push(value.to_string()),
            }
            break;
        }
    }
    let mut banner = String::new();
    for s in &strs {
        banner.push_str(s);
        banner.push('\n');
    }
    Ok(banner)
}

/// Render a millisecond count the way a human reads latency: plain
/// milliseconds under a second, then seconds, minutes, hours.
pub fn milli_to_time_string(milli: f64) -> String {
    if milli >= 3_600_000.0 {
        format!("{:4.1}h", milli / 3_600_000.0)
    } else if milli >= 60_000.0 {
        format!("{:3.1}m", milli / 60_000.0)
    } else if milli >= 1000.0 {
        format!("{:3.1}s", milli / 1000.0)
    } else {
        format!("{:6.0}", milli)
    }
}

// The pattern column of the summary table.
const PATTERN_COL: usize = 60;

// Render the bordered table of pattern aggregates.  Collection scans are
// highlighted; long patterns wrap at the pattern column on word boundaries;
// the plan label, when present, follows on its own row.
fn patterns_summary(patterns: &[OpPattern]) -> String {
    let mut buffer = String::new();
    buffer.push_str("\r+---------+--------+------+--------+------+---------------------------------+--------------------------------------------------------------+\n");
    buffer.push_str(&format!(
        "| Command |COLLSCAN|avg ms| max ms | Count| {:<32}| {:<60} |\n",
        "Namespace", "Query Pattern"
    ));
    buffer.push_str("|---------+--------+------+--------+------+---------------------------------+--------------------------------------------------------------|\n");
    for value in patterns {
        let command = cut_at(&value.command, 13);
        let mut namespace = value.namespace.to_string();
        if namespace.len() > 33 {
            namespace = format!(
                "{}*{}",
                cut_at(&namespace, 1),
                tail_at(&namespace, namespace.len() - 31)
            );
        }
        let head = if value.filter.len() > PATTERN_COL {
            let cut = cut_at(&value.filter, PATTERN_COL);
            match cut.rfind(' ') {
                Some(i) if i > 0 => &value.filter[..i],
                _ => cut,
            }
        } else {
            &value.filter[..]
        };
        let avgstr = milli_to_time_string(value.total_millis as f64 / value.count as f64);
        if value.scan == COLLSCAN {
            buffer.push_str(&format!(
                "|{:<9} \x1b[31;1m{:>8}\x1b[0m {:>6} {:>8} {:>6} {:<33} \x1b[31;1m{:<62}\x1b[0m|\n",
                command, value.scan, avgstr, value.max_millis, value.count, namespace, head
            ));
        } else {
            buffer.push_str(&format!(
                "|{:<9} {:>8} {:>6} {:>8} {:>6} {:<33} {:<62}|\n",
                command, value.scan, avgstr, value.max_millis, value.count, namespace, head
            ));
        }
        let mut rest = value.filter[head.len()..].trim_start();
        while !rest.is_empty() {
            let (chunk, next) = if rest.len() <= PATTERN_COL {
                (rest, "")
            } else {
                let cut = cut_at(rest, PATTERN_COL);
                match cut.rfind(' ') {
                    Some(i) if i > 0 => (&rest[..i], rest[i..].trim_start()),
                    _ => (cut, &rest[cut.len()..]),
                }
            };
            if value.scan == COLLSCAN {
                buffer.push_str(&format!(
                    "|{:>73}   \x1b[31;1m{:<62}\x1b[0m|\n",
                    " ", chunk
                ));
            } else {
                buffer.push_str(&format!("|{:>73}   {:<62}|\n", " ", chunk));
            }
            rest = next;
        }
        if !value.index.is_empty() {
            buffer.push_str(&format!(
                "|...index: \x1b[32;1m{:<128}\x1b[0m|\n",
                value.index
            ));
        }
    }
    buffer.push_str("+---------+--------+------+--------+------+---------------------------------+--------------------------------------------------------------+\n");
    buffer
}

// Byte-limited prefix that respects char boundaries.
fn cut_at(s: &str, mut limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    while !s.is_char_boundary(limit) {
        limit -= 1;
    }
    &s[..limit]
}

// Byte-offset suffix that respects char boundaries.
fn tail_at(s: &str, mut from: usize) -> &str {
    while from < s.len() && !s.is_char_boundary(from) {
        from += 1;
    }
    &s[from..]
}

#[cfg(test)]
fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
    f.flush().unwrap();
    f
}

// This tests:
//  - two lines with the same pattern and different literals land in one
//    entry with correct count/total/max
//  - entries come out sorted by descending average latency

#[test]
fn test_parse_aggregates() {
    let f = write_log(&[
        r#"2018-02-08T02:14:55.683+0000 I COMMAND  [conn1] find db.c command: find { filter: { id: 1 } } planSummary: IXSCAN { id: 1 } 50ms"#,
        r#"2018-02-08T02:14:56.683+0000 I COMMAND  [conn2] find db.c command: find { filter: { id: 999999 } } planSummary: IXSCAN { id: 1 } 150ms"#,
        r#"2018-02-08T02:14:57.683+0000 I COMMAND  [conn3] find db.other command: find { filter: { a: "b" } } planSummary: COLLSCAN 900ms"#,
        r#"2018-02-08T02:14:58.683+0000 I NETWORK  [conn3] end connection"#,
    ]);
    let mut analyzer = LogAnalyzer::new(f.path().to_str().unwrap());
    analyzer.set_silent(true);
    let report = analyzer.parse().unwrap();

    assert!(report.patterns.len() == 2);
    // db.other averages 900ms and sorts first.
    assert!(report.patterns[0].namespace.as_str() == "db.other");
    assert!(report.patterns[0].scan == COLLSCAN);
    let p = &report.patterns[1];
    assert!(p.command == "find");
    assert!(p.count == 2);
    assert!(p.total_millis == 200);
    assert!(p.max_millis == 150);
    assert!(p.filter == "{id:1}");
    assert!(report.slow_ops.is_empty());
}

// This tests:
//  - aggregate invariants: count, total, max against contributing lines

#[test]
fn test_parse_invariants() {
    let durations = [5, 40, 40, 75, 120, 3000];
    let lines: Vec<String> = durations
        .iter()
        .map(|ms| {
            format!(
                "2018-02-08T02:14:55.683+0000 I COMMAND  [conn1] find db.c command: find {{ filter: {{ id: 7 }} }} {}ms",
                ms
            )
        })
        .collect();
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let f = write_log(&refs);
    let mut analyzer = LogAnalyzer::new(f.path().to_str().unwrap());
    analyzer.set_silent(true);
    let report = analyzer.parse().unwrap();

    assert!(report.patterns.len() == 1);
    let p = &report.patterns[0];
    assert!(p.count == durations.len());
    assert!(p.total_millis == durations.iter().sum::<usize>());
    assert!(p.max_millis == 3000);
    assert!(p.max_millis as f64 >= p.total_millis as f64 / p.count as f64);
}

// This tests:
//  - the slow-ops list is bounded at ten, sorted descending, floored at ten
//    seconds

#[test]
fn test_slow_ops_top_ten() {
    let lines: Vec<String> = (0..12)
        .map(|i| {
            format!(
                "2018-02-08T02:14:55.683+0000 I COMMAND  [conn1] find db.c command: find {{ filter: {{ id: {} }} }} {}ms",
                i,
                11000 + i * 1000
            )
        })
        .collect();
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let f = write_log(&refs);
    let mut analyzer = LogAnalyzer::new(f.path().to_str().unwrap());
    analyzer.set_silent(true);
    let report = analyzer.parse().unwrap();

    assert!(report.slow_ops.len() == TOP_SLOW_OPS);
    let millis: Vec<usize> = report.slow_ops.iter().map(|s| s.millis).collect();
    assert!(millis == vec![22000, 21000, 20000, 19000, 18000, 17000, 16000, 15000, 14000, 13000]);
    for s in &report.slow_ops {
        assert!(s.millis >= SLOW_OP_FLOOR_MILLIS);
    }
}

// This tests:
//  - the banner collects `db` lines and stops at `options:`, whose document
//    is pretty-printed with quoted keys
//  - a malformed options document is emitted verbatim

#[test]
fn test_banner() {
    let f = write_log(&[
        r#"2018-02-08T02:14:50.000+0000 I CONTROL  [initandlisten] db version v3.6.2"#,
        r#"2018-02-08T02:14:50.001+0000 I CONTROL  [initandlisten] options: { net: { port: 27017 } }"#,
        r#"2018-02-08T02:14:50.002+0000 I CONTROL  [initandlisten] db ignored after options"#,
    ]);
    let mut reader = LineReader::open(f.path().to_str().unwrap()).unwrap();
    let banner = read_banner(&mut reader).unwrap();
    assert!(banner.starts_with("db version v3.6.2\n"));
    assert!(banner.contains("config options:"));
    assert!(banner.contains("\"port\": 27017"));
    assert!(!banner.contains("ignored after options"));

    let f = write_log(&[
        r#"2018-02-08T02:14:50.001+0000 I CONTROL  [initandlisten] options: { net: { port: 27017 "#,
    ]);
    let mut reader = LineReader::open(f.path().to_str().unwrap()).unwrap();
    let banner = read_banner(&mut reader).unwrap();
    assert!(banner.contains("config options:"));
    assert!(banner.contains("{ net: { port: 27017"));
}

// This tests:
//  - the latency rendering thresholds

#[test]
fn test_milli_to_time_string() {
    assert!(milli_to_time_string(42.0) == "    42");
    assert!(milli_to_time_string(999.0) == "   999");
    assert!(milli_to_time_string(1500.0) == "1.5s");
    assert!(milli_to_time_string(90000.0) == "1.5m");
    assert!(milli_to_time_string(5400000.0) == " 1.5h");
}

// This tests:
//  - analyze writes a reloadable report next to nothing else changing, and
//    the summary carries the slow-ops header and the table borders

#[test]
fn test_analyze_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("server.log");
    std::fs::write(
        &log_path,
        concat!(
            "2018-02-08T02:14:55.683+0000 I COMMAND  [conn1] find db.c command: find { filter: { id: 1 } } planSummary: IXSCAN { id: 1 } 12000ms\n",
            "2018-02-08T02:14:56.683+0000 I COMMAND  [conn2] find db.c command: find { filter: { id: 2 } } planSummary: IXSCAN { id: 1 } 50ms\n",
        ),
    )
    .unwrap();

    // Run from the temp dir so the .enc lands there.
    let cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let mut analyzer = LogAnalyzer::new(log_path.to_str().unwrap());
    analyzer.set_silent(true);
    let summary = analyzer.analyze().unwrap();
    let report = load_report(analyzer.output_filename());
    std::env::set_current_dir(cwd).unwrap();

    assert!(analyzer.output_filename() == "server.log.enc");
    assert!(summary.contains("Ops slower than 10 seconds (list top 1):"));
    assert!(summary.contains("12.0s => "));
    assert!(summary.contains("| Command |COLLSCAN|avg ms| max ms | Count|"));

    let report = report.unwrap();
    assert!(report.patterns.len() == 1);
    assert!(report.patterns[0].count == 2);
    assert!(report.slow_ops.len() == 1);
    assert!(report.output_filename == "server.log.enc");
}

// This tests:
//  - the output filename strips a trailing .gz before adding .enc

#[test]
fn test_output_filename() {
    assert!(LogAnalyzer::new("/var/log/db/server.log").output_filename() == "server.log.enc");
    assert!(LogAnalyzer::new("bundle.log.gz").output_filename() == "bundle.log.enc");
}
