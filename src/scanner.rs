//! Streaming ESI tag scanner
//!
//! A byte-oriented state machine that finds `<esi:... />` tags in a stream of
//! unknown length. Input can be fed in arbitrary chunks; offsets are tracked
//! across chunks so the reported tag boundaries are absolute positions in the
//! whole document. Only the interior of the tag currently being matched is
//! buffered, and that buffer is capped at a maximum tag size.
//!
//! ```text
//! Start -'<'-> Tag -'e'-> TagE -'s'-> TagES -'i'-> TagESI -':'-> Data
//! Data  -'/'-> Slash -'>'-> (emit) Start
//! Slash -other-> Data (the '/' is kept as content)
//! ```

use crate::entity::{Entities, Entity};
use crate::error::{EsiError, Result};
use bytes::Bytes;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Default cap on the interior size of a single tag
pub const DEFAULT_MAX_TAG_SIZE: usize = 4096;

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Start,
    Tag,
    TagE,
    TagES,
    TagESI,
    Data,
    Slash,
}

/// Incremental ESI tag scanner
///
/// Not shareable between concurrent scans; use [`ScannerPool`] to reuse
/// instances, which resets them between uses.
#[derive(Debug)]
pub struct TagScanner {
    state: ScanState,
    max_tag_size: usize,
    buf: Vec<u8>,
    /// Absolute offset of the next byte to be fed
    pos: usize,
    /// Absolute offset of the '<' that opened the current candidate tag
    tag_start: usize,
}

impl TagScanner {
    pub fn new(max_tag_size: usize) -> Self {
        TagScanner {
            state: ScanState::Start,
            max_tag_size,
            buf: Vec::with_capacity(256),
            pos: 0,
            tag_start: 0,
        }
    }

    /// Placeholder left behind when a pooled scanner goes back to its pool
    fn detached() -> Self {
        TagScanner {
            state: ScanState::Start,
            max_tag_size: 0,
            buf: Vec::new(),
            pos: 0,
            tag_start: 0,
        }
    }

    /// Clear all scan state so the scanner can be reused for a new document
    pub fn reset(&mut self) {
        self.state = ScanState::Start;
        self.buf.clear();
        self.pos = 0;
        self.tag_start = 0;
    }

    /// Number of bytes fed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether the scanner is in the middle of a candidate tag
    pub fn in_tag(&self) -> bool {
        self.state != ScanState::Start
    }

    /// Feed the next chunk of the document
    ///
    /// Returns every tag completed within this chunk, in stream order. A tag
    /// may have started in an earlier chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Entity>> {
        let mut found = Vec::new();

        for &b in chunk {
            match self.state {
                ScanState::Start => {
                    if b == b'<' {
                        self.tag_start = self.pos;
                        self.state = ScanState::Tag;
                    }
                }
                ScanState::Tag => self.expect(b, b'e', ScanState::TagE),
                ScanState::TagE => self.expect(b, b's', ScanState::TagES),
                ScanState::TagES => self.expect(b, b'i', ScanState::TagESI),
                ScanState::TagESI => {
                    if b == b':' {
                        self.buf.clear();
                        self.state = ScanState::Data;
                    } else {
                        self.restart(b);
                    }
                }
                ScanState::Data => {
                    if b == b'/' {
                        self.state = ScanState::Slash;
                    } else {
                        self.push(b)?;
                    }
                }
                ScanState::Slash => match b {
                    b'>' => {
                        let end = self.pos + 1;
                        let raw = Bytes::copy_from_slice(&self.buf);
                        debug!("Found ESI tag at {}..{} ({} bytes)", self.tag_start, end, raw.len());
                        found.push(Entity::new(raw, self.tag_start, end));
                        self.buf.clear();
                        self.state = ScanState::Start;
                    }
                    b'/' => {
                        self.push(b'/')?;
                    }
                    other => {
                        self.push(b'/')?;
                        self.push(other)?;
                        self.state = ScanState::Data;
                    }
                },
            }
            self.pos += 1;
        }

        Ok(found)
    }

    fn expect(&mut self, b: u8, want: u8, next: ScanState) {
        if b == want {
            self.state = next;
        } else {
            self.restart(b);
        }
    }

    /// Abandon the current candidate; a '<' immediately opens a new one
    fn restart(&mut self, b: u8) {
        if b == b'<' {
            self.tag_start = self.pos;
            self.state = ScanState::Tag;
        } else {
            self.state = ScanState::Start;
        }
    }

    fn push(&mut self, b: u8) -> Result<()> {
        if self.buf.len() >= self.max_tag_size {
            return Err(EsiError::MalformedTag {
                offset: self.tag_start,
                max_size: self.max_tag_size,
            });
        }
        self.buf.push(b);
        Ok(())
    }
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TAG_SIZE)
    }
}

/// Pool of reusable scanners
///
/// Scanners handed out are always in the reset state.
#[derive(Debug)]
pub struct ScannerPool {
    max_tag_size: usize,
    idle: Mutex<Vec<TagScanner>>,
}

impl ScannerPool {
    pub fn new(max_tag_size: usize) -> Self {
        ScannerPool {
            max_tag_size,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn max_tag_size(&self) -> usize {
        self.max_tag_size
    }

    /// Take a scanner from the pool, creating one if none is idle
    pub fn get(&self) -> PooledScanner<'_> {
        let scanner = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| TagScanner::new(self.max_tag_size));

        PooledScanner {
            pool: self,
            scanner,
        }
    }

    /// Number of idle scanners waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Scan a fully buffered document
    pub fn scan(&self, data: &[u8]) -> Result<Entities> {
        let mut scanner = self.get();
        Ok(Entities::from(scanner.feed(data)?))
    }

    /// Scan a document from an async reader without buffering it
    pub async fn scan_reader<R>(&self, reader: &mut R) -> Result<Entities>
    where
        R: AsyncRead + Unpin,
    {
        let mut scanner = self.get();
        let mut found = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            found.extend(scanner.feed(&chunk[..n])?);
        }

        Ok(Entities::from(found))
    }
}

impl Default for ScannerPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TAG_SIZE)
    }
}

/// A scanner borrowed from a [`ScannerPool`]; returned reset on drop
pub struct PooledScanner<'a> {
    pool: &'a ScannerPool,
    scanner: TagScanner,
}

impl Deref for PooledScanner<'_> {
    type Target = TagScanner;

    fn deref(&self) -> &TagScanner {
        &self.scanner
    }
}

impl DerefMut for PooledScanner<'_> {
    fn deref_mut(&mut self) -> &mut TagScanner {
        &mut self.scanner
    }
}

impl Drop for PooledScanner<'_> {
    fn drop(&mut self) {
        let mut scanner = std::mem::replace(&mut self.scanner, TagScanner::detached());
        scanner.reset();
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(scanner);
        }
    }
}

/// Scan a fully buffered document with a fresh scanner
pub fn scan(data: &[u8], max_tag_size: usize) -> Result<Entities> {
    let mut scanner = TagScanner::new(max_tag_size);
    Ok(Entities::from(scanner.feed(data)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_tags(entities: &Entities) -> Vec<(String, usize, usize)> {
        entities
            .iter()
            .map(|e| {
                (
                    String::from_utf8_lossy(e.raw_tag()).to_string(),
                    e.tag_start(),
                    e.tag_end(),
                )
            })
            .collect()
    }

    #[test]
    fn test_scan_two_tags() {
        let input = b"abcdefg<esi:include src=\"url1\"/>u p<esi:include src=\"url2\" />k";
        let entities = scan(input, DEFAULT_MAX_TAG_SIZE).unwrap();
        let tags = raw_tags(&entities);

        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].0, "include src=\"url1\"");
        assert_eq!(tags[0].1, 7);
        assert_eq!(tags[0].2, 32);
        assert_eq!(&input[tags[0].1..tags[0].2], b"<esi:include src=\"url1\"/>");

        assert_eq!(tags[1].0, "include src=\"url2\" ");
        assert_eq!(&input[tags[1].1..tags[1].2], b"<esi:include src=\"url2\" />");
        assert_eq!(tags[1].2, input.len() - 1);
    }

    #[test]
    fn test_scan_no_tags() {
        let entities = scan(b"<html><body>plain</body></html>", DEFAULT_MAX_TAG_SIZE).unwrap();
        assert!(entities.is_empty());
    }

    #[test]
    fn test_slash_inside_tag_is_content() {
        let input = b"<esi:include src=\"http://host/path\" />";
        let entities = scan(input, DEFAULT_MAX_TAG_SIZE).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].raw_tag(), &b"include src=\"http://host/path\" "[..]);
        assert_eq!(entities[0].tag_end(), input.len());
    }

    #[test]
    fn test_near_miss_prefixes_are_text() {
        let input = b"<e <es <esx <esi <esi:include src=\"a\"/>";
        let entities = scan(input, DEFAULT_MAX_TAG_SIZE).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].tag_start(), 17);
    }

    #[test]
    fn test_double_open_bracket() {
        let input = b"<<esi:include src=\"a\"/>";
        let entities = scan(input, DEFAULT_MAX_TAG_SIZE).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].tag_start(), 1);
    }

    #[test]
    fn test_unterminated_tag_is_not_error() {
        let entities = scan(b"text <esi:include src=\"a\"", DEFAULT_MAX_TAG_SIZE).unwrap();
        assert!(entities.is_empty());
    }

    #[test]
    fn test_tag_over_max_size_errors() {
        let mut input = b"<esi:include src=\"".to_vec();
        input.extend(std::iter::repeat(b'a').take(100));
        input.extend_from_slice(b"\"/>");

        let result = scan(&input, 32);
        assert!(matches!(
            result,
            Err(EsiError::MalformedTag { offset: 0, max_size: 32 })
        ));
    }

    #[test]
    fn test_chunked_feed_matches_whole() {
        let input = b"xx<esi:include src=\"a\" key=\"k/1\"/>yy<esi:include src=\"b\"/>";
        let whole = raw_tags(&scan(input, DEFAULT_MAX_TAG_SIZE).unwrap());

        for split in 1..input.len() {
            let mut scanner = TagScanner::default();
            let mut found = scanner.feed(&input[..split]).unwrap();
            found.extend(scanner.feed(&input[split..]).unwrap());
            assert_eq!(raw_tags(&Entities::from(found)), whole, "split at {}", split);
        }
    }

    #[test]
    fn test_pool_reuses_reset_scanner() {
        let pool = ScannerPool::new(DEFAULT_MAX_TAG_SIZE);
        {
            let mut scanner = pool.get();
            scanner.feed(b"abc <esi:inc").unwrap();
            assert!(scanner.in_tag());
        }
        assert_eq!(pool.idle_count(), 1);

        let scanner = pool.get();
        assert_eq!(scanner.position(), 0);
        assert!(!scanner.in_tag());
    }

    #[tokio::test]
    async fn test_scan_reader() {
        let pool = ScannerPool::default();
        let input: &[u8] = b"head<esi:include src=\"a\"/>tail";
        let mut reader = input;
        let entities = pool.scan_reader(&mut reader).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].tag_start(), 4);
        assert_eq!(entities[0].tag_end(), 26);
    }
}
