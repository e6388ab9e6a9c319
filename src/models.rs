//! Core data models for resolved ESI replacements

use crate::error::{EsiError, Result};
use bytes::Bytes;

/// One resolved replacement: `data` is written in place of `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTag {
    /// Fetched bytes to splice in (may be empty)
    pub data: Bytes,
    /// Offset of the first byte of the tag in the source stream (inclusive)
    pub start: usize,
    /// Offset one past the last byte of the tag in the source stream (exclusive)
    pub end: usize,
}

impl DataTag {
    /// Create a new DataTag
    ///
    /// # Returns
    /// * `Ok(DataTag)` if `start < end`
    /// * `Err(EsiError)` otherwise
    pub fn new(start: usize, end: usize, data: impl Into<Bytes>) -> Result<Self> {
        if start >= end {
            return Err(EsiError::NotValid(format!(
                "tag start ({}) must be < end ({})",
                start, end
            )));
        }
        Ok(DataTag {
            data: data.into(),
            start,
            end,
        })
    }

    /// Number of source bytes this tag replaces
    pub fn replaced_len(&self) -> usize {
        self.end - self.start
    }

    /// Change in body length caused by this replacement
    pub fn delta(&self) -> i64 {
        self.data.len() as i64 - self.replaced_len() as i64
    }
}

/// An ordered, non-overlapping set of replacements for one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTags {
    tags: Vec<DataTag>,
}

impl DataTags {
    /// Build a DataTags set, sorting by `start`
    ///
    /// Fetches complete in arbitrary order, so the input may be unsorted.
    /// Overlapping ranges are rejected because tags never nest in the source.
    pub fn new(mut tags: Vec<DataTag>) -> Result<Self> {
        tags.sort_by_key(|t| t.start);

        for pair in tags.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(EsiError::NotValid(format!(
                    "overlapping tags: {}..{} and {}..{}",
                    pair[0].start, pair[0].end, pair[1].start, pair[1].end
                )));
            }
        }

        Ok(DataTags { tags })
    }

    /// An empty set (page without tags)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataTag> {
        self.tags.iter()
    }

    pub fn as_slice(&self) -> &[DataTag] {
        &self.tags
    }

    /// Total number of bytes spliced in across all tags
    pub fn injected_len(&self) -> usize {
        self.tags.iter().map(|t| t.data.len()).sum()
    }

    /// `Σ(len(data) − (end − start))` across all tags
    pub fn content_length_delta(&self) -> i64 {
        self.tags.iter().map(DataTag::delta).sum()
    }

    /// Rewrite a declared Content-Length to account for the replacements
    ///
    /// # Returns
    /// * `Ok(u64)` with the corrected length
    /// * `Err(EsiError)` if the tags reach past the declared body
    pub fn adjust_content_length(&self, original: u64) -> Result<u64> {
        if let Some(last) = self.tags.last() {
            if last.end as u64 > original {
                return Err(EsiError::NotValid(format!(
                    "tag end {} exceeds declared content length {}",
                    last.end, original
                )));
            }
        }
        let adjusted = original as i64 + self.content_length_delta();
        if adjusted < 0 {
            return Err(EsiError::InternalError(format!(
                "negative content length after adjustment: {}",
                adjusted
            )));
        }
        Ok(adjusted as u64)
    }
}

impl<'a> IntoIterator for &'a DataTags {
    type Item = &'a DataTag;
    type IntoIter = std::slice::Iter<'a, DataTag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}
