//! Boundary-preserving chunker.
//!
//! Text is cut into contiguous units, first at structural boundaries
//! (headings, hints, blank-line paragraphs, fenced code blocks), then at
//! lines, sentences and finally word groups for units that are still over
//! budget. Units are packed greedily into chunks; each chunk after the first
//! starts with up to `overlap_tokens` words repeated from the tail of its
//! predecessor and records that prefix length in `overlap_bytes`.
//!
//! Tokens are whitespace-delimited words and every cut lands right after
//! whitespace, so no token is ever split and token counts add up across units.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{content_hash, Chunk, IngestRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_chunk_tokens: 256, overlap_tokens: 32 }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_tokens == 0 {
            return Err(Error::InvalidConfig("chunking.max_chunk_tokens must be at least 1".into()));
        }
        if self.overlap_tokens >= self.max_chunk_tokens {
            return Err(Error::InvalidConfig(format!(
                "chunking.overlap_tokens ({}) must be smaller than max_chunk_tokens ({})",
                self.overlap_tokens, self.max_chunk_tokens
            )));
        }
        Ok(())
    }

    /// Tokens left for new content once a full overlap prefix is in place.
    fn content_budget(&self) -> usize {
        self.max_chunk_tokens - self.overlap_tokens
    }
}

/// A chunk as a byte range of its source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub overlap_bytes: usize,
    pub token_count: usize,
}

pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    tokens: usize,
    atomic: bool,
    section_start: bool,
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Lines,
    Sentences,
    Words,
}

impl Level {
    fn next(self) -> Option<Level> {
        match self {
            Level::Lines => Some(Level::Sentences),
            Level::Sentences => Some(Level::Words),
            Level::Words => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk an ingestion record into immutable chunk records.
    pub fn chunk_record(&self, record: &IngestRecord) -> Vec<Chunk> {
        let spans = self.split(&record.text, &record.structural_hints);
        let total_chunks = spans.len();
        let citation_url = record.resolved_citation_url();
        let chunks: Vec<Chunk> = spans
            .into_iter()
            .enumerate()
            .map(|(chunk_index, span)| {
                let text = record.text[span.start..span.end].to_string();
                Chunk {
                    id: format!("{}:{}", record.doc_id, chunk_index),
                    source_doc_id: record.doc_id.clone(),
                    content_hash: content_hash(&text),
                    text,
                    token_count: span.token_count,
                    byte_start: span.start,
                    byte_end: span.end,
                    overlap_bytes: span.overlap_bytes,
                    chunk_index,
                    total_chunks,
                    citation_url: citation_url.clone(),
                    metadata: record.metadata.clone(),
                }
            })
            .collect();
        debug!(doc_id = %record.doc_id, chunks = chunks.len(), "chunked document");
        chunks
    }

    /// Split `text` into spans. Blank input yields no spans.
    pub fn split(&self, text: &str, hints: &[usize]) -> Vec<Span> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let budget = self.config.content_budget();
        let mut units = Vec::new();
        for unit in structural_units(text, hints) {
            refine(text, unit, Level::Lines, budget, &mut units);
        }
        let units = coalesce_blank_units(units);
        self.pack(text, &units)
    }

    fn pack(&self, text: &str, units: &[Unit]) -> Vec<Span> {
        let max = self.config.max_chunk_tokens;
        let budget = self.config.content_budget();
        let mut spans: Vec<Span> = Vec::new();
        let mut current: Option<Span> = None;

        for unit in units {
            let oversized = unit.atomic && unit.tokens > budget;
            if let Some(span) = current {
                if unit.section_start || oversized || span.token_count + unit.tokens > max {
                    spans.push(span);
                    current = None;
                }
            }
            match current.as_mut() {
                Some(span) => {
                    span.end = unit.end;
                    span.token_count += unit.tokens;
                }
                None => {
                    let wanted = if oversized {
                        self.config.overlap_tokens.min(max.saturating_sub(unit.tokens))
                    } else {
                        self.config.overlap_tokens
                    };
                    let (start, overlap_tokens) = match spans.last() {
                        Some(prev) => overlap_start(text, prev, wanted),
                        None => (unit.start, 0),
                    };
                    current = Some(Span {
                        start,
                        end: unit.end,
                        overlap_bytes: unit.start - start,
                        token_count: overlap_tokens + unit.tokens,
                    });
                }
            }
        }
        spans.extend(current);
        spans
    }
}

/// Start of the overlap prefix for the chunk following `prev`: the first byte
/// of the `wanted`-th last word of `prev`'s fresh content.
fn overlap_start(text: &str, prev: &Span, wanted: usize) -> (usize, usize) {
    if wanted == 0 {
        return (prev.end, 0);
    }
    let fresh_start = prev.start + prev.overlap_bytes;
    let starts = word_starts(text, fresh_start, prev.end);
    let take = wanted.min(starts.len());
    if take == 0 {
        return (prev.end, 0);
    }
    (starts[starts.len() - take], take)
}

fn word_starts(text: &str, start: usize, end: usize) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut prev_ws = true;
    for (i, c) in text[start..end].char_indices() {
        let ws = c.is_whitespace();
        if !ws && prev_ws {
            starts.push(start + i);
        }
        prev_ws = ws;
    }
    starts
}

fn is_heading(line: &str) -> bool {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    (1..=6).contains(&hashes) && line[hashes..].chars().next().map_or(true, char::is_whitespace)
}

fn is_fence(line: &str) -> bool {
    line.starts_with("```") || line.starts_with("~~~")
}

/// Snap hint offsets to the start of the line that contains them.
fn snap_hints(text: &str, hints: &[usize]) -> BTreeSet<usize> {
    hints
        .iter()
        .map(|&h| {
            let mut h = h.min(text.len());
            while !text.is_char_boundary(h) {
                h -= 1;
            }
            text[..h].rfind('\n').map_or(0, |i| i + 1)
        })
        .collect()
}

fn structural_units(text: &str, hints: &[usize]) -> Vec<Unit> {
    let hints = snap_hints(text, hints);
    let mut units = Vec::new();
    let mut push = |start: usize, end: usize, atomic: bool, section_start: bool| {
        if end > start {
            units.push(Unit { start, end, tokens: count_tokens(&text[start..end]), atomic, section_start });
        }
    };

    let mut block_start = 0;
    let mut block_section = false;
    let mut fence: Option<(usize, bool)> = None;
    let mut prev_blank = false;
    let mut line_start = 0;

    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        let trimmed = line.trim_start();

        if let Some((fence_start, fence_section)) = fence {
            if is_fence(trimmed) {
                push(fence_start, line_end, true, fence_section);
                fence = None;
                block_start = line_end;
                block_section = false;
                prev_blank = false;
            }
            line_start = line_end;
            continue;
        }

        let blank = trimmed.is_empty();
        let opens_fence = is_fence(trimmed);
        let section = is_heading(trimmed) || hints.contains(&line_start);
        if line_start > block_start && (opens_fence || section || (prev_blank && !blank)) {
            push(block_start, line_start, false, block_section);
            block_start = line_start;
            block_section = false;
        }
        if section && block_start == line_start {
            block_section = true;
        }
        if opens_fence {
            fence = Some((line_start, block_section));
            block_section = false;
        }
        prev_blank = blank;
        line_start = line_end;
    }

    match fence {
        // An unterminated fence runs to the end of the text.
        Some((fence_start, fence_section)) => push(fence_start, text.len(), true, fence_section),
        None => push(block_start, text.len(), false, block_section),
    }
    units
}

fn refine(text: &str, unit: Unit, level: Level, budget: usize, out: &mut Vec<Unit>) {
    if unit.atomic || unit.tokens <= budget {
        out.push(unit);
        return;
    }
    let cuts = match level {
        Level::Lines => line_cuts(text, unit.start, unit.end),
        Level::Sentences => sentence_cuts(text, unit.start, unit.end),
        Level::Words => word_starts(text, unit.start, unit.end)
            .into_iter()
            .skip(budget)
            .step_by(budget)
            .filter(|&c| c > unit.start)
            .collect(),
    };
    if cuts.is_empty() {
        match level.next() {
            Some(next) => refine(text, unit, next, budget, out),
            None => out.push(unit),
        }
        return;
    }
    let mut start = unit.start;
    for (i, end) in cuts.into_iter().chain(std::iter::once(unit.end)).enumerate() {
        let piece = Unit {
            start,
            end,
            tokens: count_tokens(&text[start..end]),
            atomic: false,
            section_start: unit.section_start && i == 0,
        };
        match level.next() {
            Some(next) if piece.tokens > budget => refine(text, piece, next, budget, out),
            _ => out.push(piece),
        }
        start = end;
    }
}

fn line_cuts(text: &str, start: usize, end: usize) -> Vec<usize> {
    text[start..end]
        .match_indices('\n')
        .map(|(i, _)| start + i + 1)
        .filter(|&c| c < end)
        .collect()
}

/// Cut after sentence-ending punctuation and the whitespace that follows it.
fn sentence_cuts(text: &str, start: usize, end: usize) -> Vec<usize> {
    let mut cuts = Vec::new();
    let mut after_terminator = false;
    let mut in_gap = false;
    for (i, c) in text[start..end].char_indices() {
        let pos = start + i;
        if c.is_whitespace() {
            if after_terminator {
                in_gap = true;
            }
            continue;
        }
        if in_gap {
            cuts.push(pos);
        }
        in_gap = false;
        after_terminator = matches!(c, '.' | '!' | '?');
    }
    cuts
}

/// Fold zero-token units into a neighbour so that no chunk is pure whitespace.
fn coalesce_blank_units(units: Vec<Unit>) -> Vec<Unit> {
    let mut out: Vec<Unit> = Vec::with_capacity(units.len());
    let mut pending_start: Option<usize> = None;
    for mut unit in units {
        if unit.tokens == 0 {
            match out.last_mut() {
                Some(last) => last.end = unit.end,
                None => {
                    pending_start.get_or_insert(unit.start);
                }
            }
            continue;
        }
        if let Some(start) = pending_start.take() {
            unit.start = start;
        }
        out.push(unit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingConfig { max_chunk_tokens: max, overlap_tokens: overlap }).unwrap()
    }

    fn reconstruct(text: &str, spans: &[Span]) -> String {
        spans.iter().map(|s| &text[s.start + s.overlap_bytes..s.end]).collect()
    }

    #[test]
    fn rejects_overlap_not_below_max() {
        let err = Chunker::new(ChunkingConfig { max_chunk_tokens: 4, overlap_tokens: 4 }).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn headings_start_new_chunks() {
        let text = "# One\nalpha beta\n\n# Two\ngamma delta\n";
        let spans = chunker(100, 0).split(text, &[]);
        assert_eq!(spans.len(), 2);
        assert!(text[spans[1].start..spans[1].end].starts_with("# Two"));
        assert_eq!(reconstruct(text, &spans), text);
    }

    #[test]
    fn small_paragraphs_merge() {
        let text = "one two\n\nthree four\n\nfive six";
        let spans = chunker(100, 0).split(text, &[]);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].token_count, 6);
    }

    #[test]
    fn hints_force_boundaries() {
        let text = "one two\nthree four\nfive six\n";
        let hint = text.find("three").unwrap() + 2;
        let spans = chunker(100, 0).split(text, &[hint]);
        assert_eq!(spans.len(), 2);
        assert_eq!(&text[spans[1].start..spans[1].end], "three four\nfive six\n");
    }

    #[test]
    fn word_fallback_respects_budget_and_overlap() {
        let text = (0..50).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let spans = chunker(10, 3).split(&text, &[]);
        assert!(spans.len() > 1);
        for (i, s) in spans.iter().enumerate() {
            assert!(s.token_count <= 10, "span {i} has {} tokens", s.token_count);
            assert_eq!(count_tokens(&text[s.start..s.end]), s.token_count);
            if i > 0 {
                assert_eq!(count_tokens(&text[s.start..s.start + s.overlap_bytes]), 3);
                let prev = spans[i - 1];
                assert!(text[prev.start..prev.end].ends_with(&text[s.start..s.start + s.overlap_bytes]));
            }
        }
        assert_eq!(reconstruct(&text, &spans), text);
    }

    #[test]
    fn sentences_split_before_words() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota.";
        let spans = chunker(4, 0).split(text, &[]);
        let pieces: Vec<&str> = spans.iter().map(|s| &text[s.start..s.end]).collect();
        assert_eq!(pieces, vec!["Alpha beta gamma. ", "Delta epsilon zeta. ", "Eta theta iota."]);
    }

    #[test]
    fn oversized_code_block_is_emitted_whole() {
        let code = "```python\nfrom kfp import dsl\n\n@dsl.component\ndef my_component():\n    return 'hello'\n```\n";
        let text = format!("Intro words here.\n\n{code}\nOutro words.");
        let spans = chunker(5, 1).split(&text, &[]);
        let block = spans
            .iter()
            .find(|s| text[s.start + s.overlap_bytes..s.end].starts_with("```python"))
            .expect("code block chunk");
        assert_eq!(block.overlap_bytes, 0);
        assert!(block.token_count > 5);
        assert!(text[block.start..block.end].contains("return 'hello'\n```"));
        for s in &spans {
            if s != block {
                assert!(s.token_count <= 5);
            }
        }
        assert_eq!(reconstruct(&text, &spans), text);
    }

    #[test]
    fn blank_input_yields_nothing() {
        assert!(chunker(10, 2).split("", &[]).is_empty());
        assert!(chunker(10, 2).split(" \n\n\t", &[]).is_empty());
    }

    #[test]
    fn leading_and_trailing_whitespace_is_kept() {
        let text = "\n\n  lead\n\nbody text\n\n\n";
        let spans = chunker(1, 0).split(text, &[]);
        assert_eq!(reconstruct(text, &spans), text);
        assert!(spans.iter().all(|s| s.token_count >= 1));
    }

    #[test]
    fn unicode_is_preserved() {
        let text = "Kubeflow 支持中文安装 and more words after it";
        let spans = chunker(3, 1).split(text, &[]);
        assert_eq!(reconstruct(text, &spans), text);
    }
}
