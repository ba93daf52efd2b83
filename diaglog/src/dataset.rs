/// In-memory model of decoded diagnostic data.
///
/// A `DiagnosticData` aggregates everything decoded from one or more archive
/// files: the server-info document from the newest type-0 frame, plus three
/// time series of representative samples.  The aggregate is append-only while
/// ingest runs and is not modified afterwards.
///
/// The sample types are decoded tolerantly: a field that is absent or has an
/// unexpected type becomes its zero value.  Diagnostic archives are routinely
/// truncated at collection boundaries and the server's document shapes have
/// drifted across versions, so hard failures on shape are the wrong trade.
/// Since the input shapes vary, the BSON path uses the generic document
/// parser followed by explicit decoding of the fields rather than a derived
/// strongly-typed parser; the JSON path (our own stats snapshots, a stable
/// shape) uses the derived parser.
use crate::dates::{epoch, Timestamp};
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default downsampling granularity, in seconds.
pub const DEFAULT_SPAN_SECONDS: u32 = 300;

#[derive(Debug, Default)]
pub struct DiagnosticData {
    /// Host OS, hardware and build description from the newest type-0 frame.
    pub server_info: Option<Document>,

    /// Server-status samples, in archive order.
    pub server_status: Vec<ServerStatus>,

    /// Replica-set status samples, in archive order.
    pub repl_status: Vec<ReplSetStatus>,

    /// System-metrics samples, in archive order.
    pub system_metrics: Vec<SystemMetrics>,

    // Reserved to drive downsampling when delta-encoded samples are decoded.
    span_seconds: u32,
}

impl DiagnosticData {
    /// Create an empty aggregate.  A zero `span_seconds` selects the default.
    pub fn new(span_seconds: u32) -> DiagnosticData {
        DiagnosticData {
            span_seconds: if span_seconds == 0 {
                DEFAULT_SPAN_SECONDS
            } else {
                span_seconds
            },
            ..Default::default()
        }
    }

    pub fn span_seconds(&self) -> u32 {
        self.span_seconds
    }

    /// Fold another aggregate into this one.  Series are concatenated in call
    /// order; a present `server_info` overwrites ours, so when per-file
    /// buckets are merged in path order the last file's info wins.
    pub fn merge(&mut self, other: DiagnosticData) {
        if other.server_info.is_some() {
            self.server_info = other.server_info;
        }
        self.server_status.extend(other.server_status);
        self.repl_status.extend(other.repl_status);
        self.system_metrics.extend(other.system_metrics);
    }

    /// The local-time range covered by the server-status series, or None when
    /// the series is empty.
    pub fn time_range(&self) -> Option<(Timestamp, Timestamp)> {
        let first = self.server_status.first()?;
        let last = self.server_status.last()?;
        Some((first.local_time, last.local_time))
    }
}

/// A single server-status sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerStatus {
    pub host: String,
    pub process: String,
    pub version: String,
    pub uptime: i64,
    pub local_time: Timestamp,
    pub connections: Connections,
    pub mem: Mem,
    pub opcounters: OpCounters,
}

impl Default for ServerStatus {
    fn default() -> ServerStatus {
        ServerStatus {
            host: String::new(),
            process: String::new(),
            version: String::new(),
            uptime: 0,
            local_time: epoch(),
            connections: Connections::default(),
            mem: Mem::default(),
            opcounters: OpCounters::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Connections {
    pub current: i64,
    pub available: i64,
    pub total_created: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Mem {
    pub resident: i64,
    #[serde(rename = "virtual")]
    pub virtual_mb: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpCounters {
    pub insert: i64,
    pub query: i64,
    pub update: i64,
    pub delete: i64,
    pub getmore: i64,
    pub command: i64,
}

impl ServerStatus {
    pub fn from_document(doc: &Document) -> ServerStatus {
        let mut ss = ServerStatus {
            host: doc_str(doc, "host"),
            process: doc_str(doc, "process"),
            version: doc_str(doc, "version"),
            uptime: doc_i64(doc, "uptime"),
            local_time: doc_time(doc, "localTime"),
            ..Default::default()
        };
        if let Ok(d) = doc.get_document("connections") {
            ss.connections = Connections {
                current: doc_i64(d, "current"),
                available: doc_i64(d, "available"),
                total_created: doc_i64(d, "totalCreated"),
            };
        }
        if let Ok(d) = doc.get_document("mem") {
            ss.mem = Mem {
                resident: doc_i64(d, "resident"),
                virtual_mb: doc_i64(d, "virtual"),
            };
        }
        if let Ok(d) = doc.get_document("opcounters") {
            ss.opcounters = OpCounters {
                insert: doc_i64(d, "insert"),
                query: doc_i64(d, "query"),
                update: doc_i64(d, "update"),
                delete: doc_i64(d, "delete"),
                getmore: doc_i64(d, "getmore"),
                command: doc_i64(d, "command"),
            };
        }
        ss
    }
}

/// A single replica-set status sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplSetStatus {
    pub set: String,
    pub date: Timestamp,
    pub my_state: i32,
    pub members: Vec<ReplMember>,
}

impl Default for ReplSetStatus {
    fn default() -> ReplSetStatus {
        ReplSetStatus {
            set: String::new(),
            date: epoch(),
            my_state: 0,
            members: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplMember {
    pub name: String,
    pub state: i32,
    pub state_str: String,
    pub health: i32,
}

impl ReplSetStatus {
    pub fn from_document(doc: &Document) -> ReplSetStatus {
        let mut rs = ReplSetStatus {
            set: doc_str(doc, "set"),
            date: doc_time(doc, "date"),
            my_state: doc_i64(doc, "myState") as i32,
            ..Default::default()
        };
        if let Ok(members) = doc.get_array("members") {
            for m in members {
                if let Bson::Document(m) = m {
                    rs.members.push(ReplMember {
                        name: doc_str(m, "name"),
                        state: doc_i64(m, "state") as i32,
                        state_str: doc_str(m, "stateStr"),
                        health: doc_i64(m, "health") as i32,
                    });
                }
            }
        }
        rs
    }
}

/// A single system-metrics sample: flat counter maps keyed the way the server
/// reports them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMetrics {
    pub start: Timestamp,
    pub end: Timestamp,
    pub cpu: BTreeMap<String, i64>,
    pub disks: BTreeMap<String, BTreeMap<String, i64>>,
}

impl Default for SystemMetrics {
    fn default() -> SystemMetrics {
        SystemMetrics {
            start: epoch(),
            end: epoch(),
            cpu: BTreeMap::new(),
            disks: BTreeMap::new(),
        }
    }
}

impl SystemMetrics {
    pub fn from_document(doc: &Document) -> SystemMetrics {
        let mut sm = SystemMetrics {
            start: doc_time(doc, "start"),
            end: doc_time(doc, "end"),
            ..Default::default()
        };
        if let Ok(cpu) = doc.get_document("cpu") {
            for (k, v) in cpu {
                sm.cpu.insert(k.clone(), bson_i64(v));
            }
        }
        if let Ok(disks) = doc.get_document("disks") {
            for (name, counters) in disks {
                if let Bson::Document(counters) = counters {
                    let m = counters
                        .iter()
                        .map(|(k, v)| (k.clone(), bson_i64(v)))
                        .collect();
                    sm.disks.insert(name.clone(), m);
                }
            }
        }
        sm
    }
}

// Tolerant field accessors for the explicit BSON decoding path.

pub(crate) fn doc_str(doc: &Document, key: &str) -> String {
    doc.get_str(key).unwrap_or("").to_string()
}

pub(crate) fn doc_i64(doc: &Document, key: &str) -> i64 {
    match doc.get(key) {
        Some(b) => bson_i64(b),
        None => 0,
    }
}

pub(crate) fn doc_time(doc: &Document, key: &str) -> Timestamp {
    match doc.get_datetime(key) {
        Ok(t) => t.to_chrono(),
        Err(_) => epoch(),
    }
}

fn bson_i64(b: &Bson) -> i64 {
    match b {
        Bson::Int32(n) => *n as i64,
        Bson::Int64(n) => *n,
        Bson::Double(n) => *n as i64,
        _ => 0,
    }
}

#[cfg(test)]
use bson::doc;

// This tests:
//  - explicit decoding with nested sub-documents
//  - absent and wrongly-typed fields default to zero values

#[test]
fn test_server_status_from_document() {
    let doc = doc! {
        "host": "db-0.example.com",
        "version": "3.6.4",
        "uptime": 86400_i64,
        "localTime": bson::DateTime::from_millis(1507838933000),
        "connections": { "current": 17, "available": 800, "totalCreated": 3000_i64 },
        "mem": { "resident": 1024, "virtual": 2048 },
        "opcounters": { "insert": 5, "query": 7 },
    };
    let ss = ServerStatus::from_document(&doc);
    assert!(ss.host == "db-0.example.com");
    assert!(ss.version == "3.6.4");
    assert!(ss.uptime == 86400);
    assert!(ss.local_time == crate::dates::parse_timestamp("2017-10-12T20:08:53Z").unwrap());
    assert!(ss.connections.current == 17);
    assert!(ss.connections.total_created == 3000);
    assert!(ss.mem.virtual_mb == 2048);
    assert!(ss.opcounters.query == 7);
    assert!(ss.opcounters.delete == 0);

    let empty = ServerStatus::from_document(&doc! { "uptime": "soon" });
    assert!(empty.host.is_empty());
    assert!(empty.uptime == 0);
    assert!(empty.local_time == epoch());
}

#[test]
fn test_repl_and_system_from_document() {
    let rs = ReplSetStatus::from_document(&doc! {
        "set": "rs0",
        "myState": 1,
        "date": bson::DateTime::from_millis(1507838933000),
        "members": [
            { "name": "db-0:27017", "state": 1, "stateStr": "PRIMARY", "health": 1 },
            { "name": "db-1:27017", "state": 2, "stateStr": "SECONDARY", "health": 1 },
        ],
    });
    assert!(rs.set == "rs0" && rs.my_state == 1);
    assert!(rs.members.len() == 2);
    assert!(rs.members[1].state_str == "SECONDARY");

    let sm = SystemMetrics::from_document(&doc! {
        "start": bson::DateTime::from_millis(1507838933000),
        "end": bson::DateTime::from_millis(1507838934000),
        "cpu": { "user_ms": 10_i64, "idle_ms": 90_i64 },
        "disks": { "xvda": { "reads": 4_i64, "writes": 2_i64 } },
    });
    assert!(sm.cpu["user_ms"] == 10);
    assert!(sm.disks["xvda"]["writes"] == 2);
    assert!(sm.end > sm.start);
}

// This tests:
//  - merge concatenates series in call order and keeps them time-sorted when
//    the inputs were
//  - a later server_info overwrites an earlier one; absent info does not

#[test]
fn test_merge() {
    fn at(ms: i64) -> ServerStatus {
        let mut ss = ServerStatus::default();
        ss.local_time = epoch() + chrono::Duration::milliseconds(ms);
        ss
    }

    let mut all = DiagnosticData::new(0);
    assert!(all.span_seconds() == DEFAULT_SPAN_SECONDS);

    let mut a = DiagnosticData::new(0);
    a.server_info = Some(doc! { "file": "a" });
    a.server_status.push(at(1000));
    a.server_status.push(at(2000));

    let mut b = DiagnosticData::new(0);
    b.server_info = Some(doc! { "file": "b" });
    b.server_status.push(at(3000));

    all.merge(a);
    all.merge(b);
    all.merge(DiagnosticData::new(0));

    assert!(all.server_status.len() == 3);
    for w in all.server_status.windows(2) {
        assert!(w[0].local_time <= w[1].local_time);
    }
    assert!(all.server_info.as_ref().unwrap().get_str("file").unwrap() == "b");
    let (first, last) = all.time_range().unwrap();
    assert!(first < last);
}
