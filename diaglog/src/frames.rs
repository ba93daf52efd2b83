/// Walk a byte buffer as a sequence of length-prefixed framed documents.
///
/// An archive file is a flat concatenation of BSON documents.  Each document
/// begins with its own length as an unsigned 32-bit little-endian integer, so
/// the length prefix of a frame is simply the first field of the document it
/// carries: reading the prefix, slicing that many bytes, and decoding the
/// slice yields one frame, and the cursor advances by the prefix whether or
/// not decoding succeeded.  Frames remain self-delimited even when one of
/// them is corrupt.
///
/// A frame that cannot be decoded is logged and skipped.  A prefix that would
/// read past the end of the buffer ends iteration; diagnostic archives are
/// routinely truncated at collection boundaries and trailing partial frames
/// are not an error.
use bson::Document;
use tracing::{debug, warn};

pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> FrameReader<'a> {
        FrameReader { buf, pos: 0 }
    }

    /// Bytes consumed so far, including any skipped frames.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        while self.pos < self.buf.len() {
            if self.pos + 4 > self.buf.len() {
                debug!(trailing = self.buf.len() - self.pos, "ignoring trailing bytes");
                self.pos = self.buf.len();
                return None;
            }
            let prefix = [
                self.buf[self.pos],
                self.buf[self.pos + 1],
                self.buf[self.pos + 2],
                self.buf[self.pos + 3],
            ];
            let len = u32::from_le_bytes(prefix) as usize;
            if len == 0 {
                // A zero prefix cannot advance the cursor; treat the rest of
                // the buffer as truncation.
                debug!(at = self.pos, "zero-length frame, stopping");
                self.pos = self.buf.len();
                return None;
            }
            if self.pos + len > self.buf.len() {
                debug!(at = self.pos, len, "truncated frame, stopping");
                self.pos = self.buf.len();
                return None;
            }
            let frame = &self.buf[self.pos..self.pos + len];
            self.pos += len;
            match Document::from_reader(frame) {
                Ok(doc) => return Some(doc),
                Err(err) => {
                    warn!(at = self.pos - len, len, error = %err, "skipping undecodable frame");
                }
            }
        }
        None
    }
}

#[cfg(test)]
use bson::doc;

// This tests:
//  - a well-formed buffer yields every frame and consumes every byte (the
//    frame lengths tile the buffer exactly)

#[test]
fn test_frames_roundtrip() {
    let docs = vec![
        doc! { "type": 0, "doc": { "os": "linux" } },
        doc! { "type": 1, "data": "abc" },
        doc! { "type": 1, "data": "def" },
    ];
    let mut buf: Vec<u8> = Vec::new();
    for d in &docs {
        buf.extend(bson::to_vec(d).unwrap());
    }

    let mut reader = FrameReader::new(&buf);
    let mut seen = 0;
    while let Some(d) = reader.next() {
        assert!(d == docs[seen]);
        seen += 1;
    }
    assert!(seen == docs.len());
    assert!(reader.position() == buf.len());
}

// This tests:
//  - a frame whose length prefix counts only itself carries an empty body;
//    the decoder rejects it and no document is produced

#[test]
fn test_frames_empty_body() {
    let buf = [0x04u8, 0x00, 0x00, 0x00];
    let mut reader = FrameReader::new(&buf);
    assert!(reader.next().is_none());
    assert!(reader.position() == buf.len());
}

// This tests:
//  - a corrupt frame is skipped and iteration resumes at the next frame

#[test]
fn test_frames_skip_corrupt() {
    let good = bson::to_vec(&doc! { "type": 0 }).unwrap();
    let mut buf: Vec<u8> = Vec::new();
    // 16 bytes whose prefix is right but whose element list is junk.
    buf.extend(16u32.to_le_bytes());
    buf.extend([0xffu8; 12]);
    buf.extend(&good);

    let frames: Vec<Document> = FrameReader::new(&buf).collect();
    assert!(frames.len() == 1);
    assert!(frames[0] == doc! { "type": 0 });
}

// This tests:
//  - a prefix pointing past the end of the buffer ends iteration cleanly
//  - ditto a zero prefix, which could never advance the cursor

#[test]
fn test_frames_truncation() {
    let good = bson::to_vec(&doc! { "n": 1 }).unwrap();

    let mut buf = good.clone();
    buf.extend(400u32.to_le_bytes());
    buf.extend([0u8; 8]);
    let frames: Vec<Document> = FrameReader::new(&buf).collect();
    assert!(frames.len() == 1);

    let mut buf = good.clone();
    buf.extend(0u32.to_le_bytes());
    buf.extend([0u8; 64]);
    let frames: Vec<Document> = FrameReader::new(&buf).collect();
    assert!(frames.len() == 1);

    // Fewer than four trailing bytes cannot even hold a prefix.
    let mut buf = good.clone();
    buf.extend([0x05u8, 0x00]);
    let frames: Vec<Document> = FrameReader::new(&buf).collect();
    assert!(frames.len() == 1);
}
