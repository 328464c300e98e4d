//! Chunking: raw text in, ordered chunks with stable `(index, text, char_start, char_end)` out.
//!
//! Splitting prefers paragraph breaks (within the last 20% of the window), then single
//! newlines (last 30%), then sentence terminals followed by whitespace (last 30%), then word
//! boundaries (last 20%). If none are found, the window is cut hard at its end.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub overlap: usize,
    pub min_chunk: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        ChunkParams {
            chunk_size: 2000,
            overlap: 200,
            min_chunk: 100,
        }
    }
}

impl ChunkParams {
    /// Overlap at or beyond the chunk size is clamped to a quarter of the chunk size.
    fn effective_overlap(&self) -> usize {
        if self.overlap >= self.chunk_size {
            self.chunk_size / 4
        } else {
            self.overlap
        }
    }
}

/// Find the last occurrence of `needle` inside `text[zone_start..zone_end]`, returning the
/// byte offset (relative to `text`) immediately after the match.
fn last_occurrence_end(text: &str, zone_start: usize, zone_end: usize, needle: &str) -> Option<usize> {
    if zone_start >= zone_end || zone_end > text.len() {
        return None;
    }
    let zone = &text[zone_start..zone_end];
    zone.rfind(needle).map(|pos| zone_start + pos + needle.len())
}

/// Find the last sentence terminal (`.`, `!`, `?`) followed by whitespace inside the zone,
/// returning the offset just after the whitespace.
fn last_sentence_boundary(text: &str, zone_start: usize, zone_end: usize) -> Option<usize> {
    if zone_start >= zone_end || zone_end > text.len() {
        return None;
    }
    let bytes = text.as_bytes();
    let mut best: Option<usize> = None;
    let mut i = zone_start;
    while i + 1 < zone_end {
        let c = bytes[i];
        if (c == b'.' || c == b'!' || c == b'?') && bytes[i + 1].is_ascii_whitespace() {
            best = Some(i + 2);
        }
        i += 1;
    }
    best
}

/// Find the last whitespace run inside the zone, returning the offset just after it.
fn last_word_boundary(text: &str, zone_start: usize, zone_end: usize) -> Option<usize> {
    if zone_start >= zone_end || zone_end > text.len() {
        return None;
    }
    let bytes = text.as_bytes();
    for i in (zone_start..zone_end).rev() {
        if bytes[i].is_ascii_whitespace() {
            return Some(i + 1);
        }
    }
    None
}

fn choose_split_point(text: &str, start: usize, window_end: usize, params: &ChunkParams) -> usize {
    let window_len = window_end - start;

    let paragraph_zone_start = start + window_len.saturating_sub(window_len / 5);
    if let Some(end) = last_occurrence_end(text, paragraph_zone_start, window_end, "\n\n") {
        return end;
    }

    let newline_zone_start = start + window_len - (window_len * 3 / 10);
    if let Some(end) = last_occurrence_end(text, newline_zone_start, window_end, "\n") {
        return end;
    }

    if let Some(end) = last_sentence_boundary(text, newline_zone_start, window_end) {
        return end;
    }

    let word_zone_start = paragraph_zone_start;
    if let Some(end) = last_word_boundary(text, word_zone_start, window_end) {
        return end;
    }

    let _ = params;
    window_end
}

/// Chunk `text` into ordered, stable-addressed spans.
pub fn chunk_text(text: &str, params: ChunkParams) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }
    let overlap = params.effective_overlap();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut start = 0usize;
    let len = text.len();

    while start < len {
        let window_end = (start + params.chunk_size).min(len);
        let end = if window_end >= len {
            len
        } else {
            choose_split_point(text, start, window_end, &params).max(start + 1)
        };

        let raw = &text[start..end];
        let leading_trim = raw.len() - raw.trim_start().len();
        let trimmed = raw.trim();
        let char_start = start + leading_trim;
        let char_end = char_start + trimmed.len();

        if !trimmed.is_empty() {
            chunks.push(Chunk {
                index: chunks.len(),
                text: trimmed.to_string(),
                char_start,
                char_end,
            });
        }

        if end >= len {
            break;
        }
        let next_start = end.saturating_sub(overlap);
        start = if next_start > start { next_start } else { end };
    }

    // Merge an undersized trailing chunk into its predecessor rather than emit a fragment
    // shorter than min_chunk.
    if chunks.len() > 1 {
        let last_len = chunks.last().unwrap().text.len();
        if last_len < params.min_chunk {
            let last = chunks.pop().unwrap();
            let prev = chunks.last_mut().unwrap();
            prev.char_end = last.char_end;
            prev.text = text[prev.char_start..prev.char_end].to_string();
        }
    }

    for (i, c) in chunks.iter_mut().enumerate() {
        c.index = i;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", ChunkParams::default()).is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("hello world", ChunkParams::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks[0].char_end, 11);
    }

    #[test]
    fn round_trip_recovers_source_up_to_trimming() {
        let text = "word ".repeat(3000);
        let params = ChunkParams { chunk_size: 500, overlap: 50, min_chunk: 50 };
        let chunks = chunk_text(&text, params);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(&text[c.char_start..c.char_end], c.text);
        }
    }

    #[test]
    fn overlap_at_or_above_chunk_size_is_clamped() {
        let params = ChunkParams { chunk_size: 400, overlap: 400, min_chunk: 50 };
        assert_eq!(params.effective_overlap(), 100);
        let params2 = ChunkParams { chunk_size: 400, overlap: 1000, min_chunk: 50 };
        assert_eq!(params2.effective_overlap(), 100);
    }

    #[test]
    fn prefers_paragraph_break_when_available() {
        let mut text = "a".repeat(1600);
        text.push_str("\n\n");
        text.push_str(&"b".repeat(600));
        let chunks = chunk_text(&text, ChunkParams { chunk_size: 2000, overlap: 0, min_chunk: 50 });
        assert!(chunks[0].text.ends_with('a'));
    }

    #[test]
    fn indexes_are_sequential() {
        let text = "sentence one. ".repeat(400);
        let chunks = chunk_text(&text, ChunkParams { chunk_size: 300, overlap: 30, min_chunk: 50 });
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }
}
