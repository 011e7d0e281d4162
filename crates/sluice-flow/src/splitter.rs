//! Line-oriented content splitting.
//!
//! The splitter scans a content value line by line and emits a sequence of
//! sub-referenced chunks bounded by a maximum row count and a maximum byte
//! size. It can exclude comment lines and stitch a header line into every
//! output chunk, so each chunk is independently processable downstream.
//!
//! No stored bytes are copied: every chunk is a [`Content`] whose segments
//! point back into the source content's byte ranges.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::segment::{Content, ContentStore};

/// Parameters controlling a split.
#[derive(Debug, Clone)]
pub struct SplitParameters {
    /// Lines starting with this prefix are excluded from every chunk.
    pub comment_chars: Option<String>,
    /// Treat the first non-comment line as a header and stitch it into each
    /// output chunk.
    pub include_headers: bool,
    /// Maximum number of data lines per chunk.
    pub max_rows: usize,
    /// Maximum chunk size in bytes, header included.
    pub max_size: u64,
}

impl Default for SplitParameters {
    fn default() -> Self {
        Self {
            comment_chars: None,
            include_headers: false,
            max_rows: 1000,
            max_size: 10 * 1024 * 1024,
        }
    }
}

/// A line's byte range within the logical content, end-exclusive and
/// including the trailing newline when present.
#[derive(Debug, Clone, Copy)]
struct LineRange {
    start: u64,
    end: u64,
}

impl LineRange {
    const fn len(self) -> u64 {
        self.end - self.start
    }
}

/// Splits content into bounded, sub-referenced chunks.
pub struct Splitter {
    store: ContentStore,
}

impl Splitter {
    /// Creates a splitter reading through the given content store.
    #[must_use]
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }

    /// Loads the content and splits it according to `params`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SplitConfiguration`] when the bounds cannot fit even
    /// a minimal chunk, or a storage error if the content cannot be read.
    pub async fn split(&self, content: &Content, params: &SplitParameters) -> Result<Vec<Content>> {
        let data = self.store.load(content).await?;
        split_content(content, &data, params)
    }
}

/// Splits already-loaded content bytes into sub-referenced chunks.
///
/// `data` must be the logical bytes of `content`.
///
/// # Errors
///
/// Returns [`Error::SplitConfiguration`] if the header plus a single data
/// line (or, without headers, a single data line) exceeds `max_size`;
/// emitting a silently truncated chunk is never acceptable.
pub fn split_content(
    content: &Content,
    data: &Bytes,
    params: &SplitParameters,
) -> Result<Vec<Content>> {
    if params.max_rows == 0 {
        return Err(Error::SplitConfiguration {
            message: "maxRows must be at least 1".to_string(),
        });
    }

    let lines = scan_lines(data);
    let is_comment = |line: &LineRange| {
        params.comment_chars.as_deref().is_some_and(|chars| {
            !chars.is_empty() && data[to_usize(line.start)..to_usize(line.end)].starts_with(chars.as_bytes())
        })
    };

    let mut lines = lines.into_iter().filter(|l| !is_comment(l));

    let header = if params.include_headers {
        let Some(header) = lines.next() else {
            return Ok(Vec::new());
        };
        Some(header)
    } else {
        None
    };
    let header_size = header.map_or(0, LineRange::len);

    let mut chunks: Vec<Vec<LineRange>> = Vec::new();
    let mut current: Vec<LineRange> = Vec::new();
    let mut current_size = header_size;

    for line in lines {
        if header_size + line.len() > params.max_size {
            let message = if header.is_some() {
                format!(
                    "header ({header_size} bytes) plus one data line ({} bytes) exceeds maxSize {}",
                    line.len(),
                    params.max_size
                )
            } else {
                format!(
                    "a single data line ({} bytes) exceeds maxSize {}",
                    line.len(),
                    params.max_size
                )
            };
            return Err(Error::SplitConfiguration { message });
        }

        if !current.is_empty()
            && (current.len() >= params.max_rows || current_size + line.len() > params.max_size)
        {
            chunks.push(std::mem::take(&mut current));
            current_size = header_size;
        }

        current_size += line.len();
        current.push(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let base_name = content.name.clone();
    let mut out = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let name = base_name
            .as_ref()
            .map(|n| format!("{n}.{}", index + 1));

        let mut piece = match header {
            Some(h) => content.subreference(h.start, h.len(), name.clone(), None)?,
            None => Content {
                name: name.clone(),
                media_type: content.media_type.clone(),
                segments: Vec::new(),
                metadata: content.metadata.clone(),
            },
        };

        // Contiguous data lines collapse into one sub-reference.
        let mut run_start = chunk[0].start;
        let mut run_end = chunk[0].end;
        for line in &chunk[1..] {
            if line.start == run_end {
                run_end = line.end;
            } else {
                let range = content.subreference(run_start, run_end - run_start, None, None)?;
                piece.segments.extend(range.segments);
                run_start = line.start;
                run_end = line.end;
            }
        }
        let range = content.subreference(run_start, run_end - run_start, None, None)?;
        piece.segments.extend(range.segments);

        out.push(piece);
    }

    Ok(out)
}

/// Scans line ranges, each including its trailing newline when present.
fn scan_lines(data: &Bytes) -> Vec<LineRange> {
    let mut lines = Vec::new();
    let mut start = 0u64;
    for (i, byte) in data.iter().enumerate() {
        if *byte == b'\n' {
            let end = (i + 1) as u64;
            lines.push(LineRange { start, end });
            start = end;
        }
    }
    if start < data.len() as u64 {
        lines.push(LineRange {
            start,
            end: data.len() as u64,
        });
    }
    lines
}

fn to_usize(v: u64) -> usize {
    usize::try_from(v).unwrap_or(usize::MAX)
}
