/// Compression-transparent buffered line reader.
///
/// The reader sniffs the first two bytes of its source: the gzip magic wraps
/// the source in a decompression layer, anything else passes through.  Lines
/// are read in chunks of at most MAXLINE bytes; a line longer than that is
/// returned in pieces with a continuation flag set on every piece but the
/// last, and callers reassemble.  This bounds the reader's memory against
/// pathological input while still tolerating arbitrarily long lines.
use anyhow::Result;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// Longest piece returned from a single read_line call.
const MAXLINE: usize = 65536;

pub struct LineReader {
    reader: BufReader<Box<dyn Read>>,
}

impl LineReader {
    /// Open `filename` and sniff for compression.
    pub fn open(filename: &str) -> Result<LineReader> {
        LineReader::new(Box::new(File::open(filename)?))
    }

    /// Wrap an arbitrary byte source, sniffing for compression.
    pub fn new(mut source: Box<dyn Read>) -> Result<LineReader> {
        let mut magic = [0u8; 2];
        let mut have = 0;
        while have < 2 {
            let n = source.read(&mut magic[have..])?;
            if n == 0 {
                break;
            }
            have += n;
        }
        // The sniffed bytes are chained back in front of the source so the
        // decompressor (or the plain reader) sees the full stream.
        let head = Cursor::new(magic[..have].to_vec());
        let reader: Box<dyn Read> = if have == 2 && magic == GZIP_MAGIC {
            Box::new(GzDecoder::new(head.chain(source)))
        } else {
            Box::new(head.chain(source))
        };
        Ok(LineReader {
            reader: BufReader::new(reader),
        })
    }

    /// Read the next line, without its terminator.  Returns None at end of
    /// input.  The flag is true when the line was cut at MAXLINE and the next
    /// call continues it.
    pub fn read_line(&mut self) -> Result<Option<(String, bool)>> {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some((to_line(buf, false), false)));
            }
            let room = MAXLINE - buf.len();
            let window = &available[..available.len().min(room)];
            if let Some(i) = window.iter().position(|&b| b == b'\n') {
                buf.extend_from_slice(&window[..i]);
                self.reader.consume(i + 1);
                return Ok(Some((to_line(buf, false), false)));
            }
            let taken = window.len();
            buf.extend_from_slice(window);
            self.reader.consume(taken);
            if buf.len() == MAXLINE {
                return Ok(Some((to_line(buf, true), true)));
            }
        }
    }

    /// Consume the rest of the input and count the lines in it.  Used for
    /// progress reporting before a second pass over a fresh reader.
    pub fn count_lines(&mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Ok(count);
            }
            count += available.iter().filter(|&&b| b == b'\n').count();
            let n = available.len();
            self.reader.consume(n);
        }
    }
}

// A \r is only a terminator on a complete line; a cut piece keeps its bytes.
fn to_line(mut buf: Vec<u8>, continued: bool) -> String {
    if !continued && buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// This tests:
//  - plain text line splitting, \r\n handling, missing final newline

#[test]
fn test_linereader_plain() {
    let text = b"first\nsecond\r\nthird".to_vec();
    let mut r = LineReader::new(Box::new(Cursor::new(text))).unwrap();
    assert!(r.read_line().unwrap() == Some(("first".to_string(), false)));
    assert!(r.read_line().unwrap() == Some(("second".to_string(), false)));
    assert!(r.read_line().unwrap() == Some(("third".to_string(), false)));
    assert!(r.read_line().unwrap().is_none());
}

// This tests:
//  - gzip sniffing and transparent decompression

#[test]
fn test_linereader_gzip() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(b"alpha\nbeta\n").unwrap();
    let compressed = enc.finish().unwrap();
    let mut r = LineReader::new(Box::new(Cursor::new(compressed))).unwrap();
    assert!(r.read_line().unwrap() == Some(("alpha".to_string(), false)));
    assert!(r.read_line().unwrap() == Some(("beta".to_string(), false)));
    assert!(r.read_line().unwrap().is_none());
}

// This tests:
//  - a line longer than MAXLINE arrives in pieces with the continuation flag
//    set, and the pieces reassemble to the original line

#[test]
fn test_linereader_long_line() {
    let long = "x".repeat(MAXLINE + 100);
    let text = format!("{}\nshort\n", long).into_bytes();
    let mut r = LineReader::new(Box::new(Cursor::new(text))).unwrap();

    let (mut line, mut continued) = r.read_line().unwrap().unwrap();
    assert!(continued);
    while continued {
        let (more, c) = r.read_line().unwrap().unwrap();
        line.push_str(&more);
        continued = c;
    }
    assert!(line == long);
    assert!(r.read_line().unwrap() == Some(("short".to_string(), false)));
    assert!(r.read_line().unwrap().is_none());
}

// This tests:
//  - line counting, with and without a trailing newline

#[test]
fn test_linereader_count() {
    let mut r = LineReader::new(Box::new(Cursor::new(b"a\nb\nc\n".to_vec()))).unwrap();
    assert!(r.count_lines().unwrap() == 3);
    let mut r = LineReader::new(Box::new(Cursor::new(b"a\nb".to_vec()))).unwrap();
    assert!(r.count_lines().unwrap() == 1);
    let mut r = LineReader::new(Box::new(Cursor::new(Vec::new()))).unwrap();
    assert!(r.count_lines().unwrap() == 0);
}

// This tests:
//  - a two-byte non-gzip input is not eaten by the sniffer

#[test]
fn test_linereader_tiny_input() {
    let mut r = LineReader::new(Box::new(Cursor::new(b"ab".to_vec()))).unwrap();
    assert!(r.read_line().unwrap() == Some(("ab".to_string(), false)));
    let mut r = LineReader::new(Box::new(Cursor::new(b"a".to_vec()))).unwrap();
    assert!(r.read_line().unwrap() == Some(("a".to_string(), false)));
}
