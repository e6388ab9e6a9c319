//! Splicing resolved content into the original byte stream
//!
//! Bytes before the first tag are copied verbatim, each tag's `[start, end)`
//! range is replaced by its data, and everything after the last tag is
//! copied verbatim. [`inject_content`] does this for a buffered document;
//! [`StreamInjector`] does it across any number of sequential writes.

use crate::error::{EsiError, Result};
use crate::models::DataTags;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const SNIFF_LEN: usize = 512;
const COPY_BUF_SIZE: usize = 8 * 1024;

/// Signatures of common binary payloads
const BINARY_SIGNATURES: &[&[u8]] = &[
    b"\x89PNG\r\n\x1a\n",
    b"GIF87a",
    b"GIF89a",
    b"\xff\xd8\xff",
    b"%PDF-",
    b"PK\x03\x04",
    b"\x1f\x8b",
    b"RIFF",
    b"OggS",
    b"ID3",
    b"\x00asm",
    b"wOFF",
    b"wOF2",
];

/// Whether a payload's first bytes look like text worth scanning
pub fn looks_like_text(head: &[u8]) -> bool {
    let head = &head[..head.len().min(SNIFF_LEN)];
    if BINARY_SIGNATURES.iter().any(|sig| head.starts_with(sig)) {
        return false;
    }
    !head.contains(&0)
}

/// Inject into a fully buffered document
///
/// # Returns
/// * `Err(EsiError::InjectionError)` if a tag reaches past the end of `source`
pub fn inject_content(source: &[u8], tags: &DataTags) -> Result<Bytes> {
    let capacity = (source.len() as i64 + tags.content_length_delta()).max(0) as usize;
    let mut out = BytesMut::with_capacity(capacity);
    let mut last = 0;

    for (index, tag) in tags.iter().enumerate() {
        if tag.end > source.len() {
            return Err(EsiError::injection(
                index,
                tag.start,
                tag.end,
                format!("tag ends past document of {} bytes", source.len()),
            ));
        }
        out.extend_from_slice(&source[last..tag.start]);
        out.extend_from_slice(&tag.data);
        last = tag.end;
    }
    out.extend_from_slice(&source[last..]);

    Ok(out.freeze())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Waiting for the first non-empty write to sniff
    Pending,
    Inject,
    Bypass,
}

/// Incremental injector
///
/// Tracks the absolute position of the next input byte across writes, so a
/// tag split over several writes is still replaced exactly once.
#[derive(Debug)]
pub struct StreamInjector {
    tags: DataTags,
    next_tag: usize,
    pos: usize,
    mode: Mode,
}

impl StreamInjector {
    /// Injector that sniffs the first write and bypasses binary payloads
    pub fn new(tags: DataTags) -> Self {
        StreamInjector {
            tags,
            next_tag: 0,
            pos: 0,
            mode: Mode::Pending,
        }
    }

    /// Injector that passes everything through unchanged
    pub fn bypass() -> Self {
        StreamInjector {
            tags: DataTags::empty(),
            next_tag: 0,
            pos: 0,
            mode: Mode::Bypass,
        }
    }

    /// Absolute offset of the next byte to be written
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_bypassed(&self) -> bool {
        self.mode == Mode::Bypass
    }

    pub fn tags(&self) -> &DataTags {
        &self.tags
    }

    /// Content-Length to declare for a response whose origin declared `original`
    pub fn content_length(&self, original: u64) -> Result<u64> {
        if self.mode == Mode::Bypass {
            Ok(original)
        } else {
            self.tags.adjust_content_length(original)
        }
    }

    /// `(index, start, end)` of the tag being worked on, for error context
    pub fn current_tag(&self) -> (usize, usize, usize) {
        match self.tags.as_slice().get(self.next_tag) {
            Some(tag) => (self.next_tag, tag.start, tag.end),
            None => (self.next_tag, self.pos, self.pos),
        }
    }

    /// Process one chunk, returning the bytes to emit for it
    pub fn write(&mut self, chunk: &[u8]) -> Result<Bytes> {
        if chunk.is_empty() {
            return Ok(Bytes::new());
        }
        if self.mode == Mode::Pending {
            self.mode = if looks_like_text(chunk) {
                Mode::Inject
            } else {
                debug!("Payload looks binary, bypassing injection");
                Mode::Bypass
            };
        }
        if self.mode == Mode::Bypass || self.next_tag >= self.tags.len() {
            self.pos += chunk.len();
            return Ok(Bytes::copy_from_slice(chunk));
        }

        let mut out = BytesMut::with_capacity(chunk.len());
        let tags = self.tags.as_slice();
        let mut i = 0;

        while i < chunk.len() {
            let abs = self.pos + i;
            let Some(tag) = tags.get(self.next_tag) else {
                out.extend_from_slice(&chunk[i..]);
                break;
            };

            if abs < tag.start {
                let n = (tag.start - abs).min(chunk.len() - i);
                out.extend_from_slice(&chunk[i..i + n]);
                i += n;
                continue;
            }

            if abs == tag.start {
                out.extend_from_slice(&tag.data);
            }
            let skip = (tag.end - abs).min(chunk.len() - i);
            i += skip;
            if self.pos + i == tag.end {
                self.next_tag += 1;
            }
        }

        self.pos += chunk.len();
        Ok(out.freeze())
    }

    /// Signal end of input
    ///
    /// # Returns
    /// * `Err(EsiError::InjectionError)` if the stream ended before every tag was consumed
    pub fn finish(&self) -> Result<()> {
        if self.mode != Mode::Bypass && self.next_tag < self.tags.len() {
            let (index, start, end) = self.current_tag();
            return Err(EsiError::injection(
                index,
                start,
                end,
                format!("stream ended at offset {}", self.pos),
            ));
        }
        Ok(())
    }
}

/// Copy `reader` to `writer`, splicing in `tags`
///
/// Read and write failures are reported with the tag being processed at
/// the time.
///
/// # Returns
/// The number of bytes written
pub async fn copy_injected<R, W>(reader: &mut R, writer: &mut W, tags: DataTags) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut injector = StreamInjector::new(tags);
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let (index, start, end) = injector.current_tag();
                return Err(EsiError::injection(index, start, end, format!("read: {}", e)));
            }
        };
        if n == 0 {
            break;
        }

        let context = injector.current_tag();
        let out = injector.write(&buf[..n])?;
        if let Err(e) = writer.write_all(&out).await {
            let (index, start, end) = context;
            return Err(EsiError::injection(index, start, end, format!("write: {}", e)));
        }
        written += out.len() as u64;
    }

    injector.finish()?;
    writer.flush().await.map_err(|e| {
        let (index, start, end) = injector.current_tag();
        EsiError::injection(index, start, end, format!("flush: {}", e))
    })?;
    Ok(written)
}
