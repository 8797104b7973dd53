//! Structural markdown chunker.
//!
//! Splits note and transcript text into overlapping chunks sized by an
//! estimated token budget. Boundaries prefer markdown structure (headings,
//! blank-line paragraph breaks); a single block larger than the budget falls
//! back to fixed line windows. Line ranges are 1-based and inclusive, and the
//! output is deterministic for a given input and configuration.

use sha2::{Digest, Sha256};

/// One chunk of a source file, ready for embedding and indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
    /// sha256 hex of `text`.
    pub hash: String,
}

/// Rough token count. Embedding providers bill by tokens but the exact
/// tokenizer varies per model; chars/4 is close enough for budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A contiguous run of lines forming one structural unit.
struct Block {
    /// (1-based line number, line text)
    lines: Vec<(usize, String)>,
    tokens: usize,
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') && trimmed.chars().take_while(|c| *c == '#').count() <= 6
}

/// Split into structural blocks: a heading starts a new block, a blank line
/// ends the current one. Blank lines themselves are dropped.
fn split_blocks(content: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Vec<(usize, String)> = Vec::new();

    let mut flush = |current: &mut Vec<(usize, String)>, blocks: &mut Vec<Block>| {
        if current.is_empty() {
            return;
        }
        let tokens = current
            .iter()
            .map(|(_, l)| estimate_tokens(l))
            .sum::<usize>();
        blocks.push(Block {
            lines: std::mem::take(current),
            tokens,
        });
    };

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            flush(&mut current, &mut blocks);
            continue;
        }
        if is_heading(line) {
            flush(&mut current, &mut blocks);
        }
        current.push((line_no, line.to_string()));
    }
    flush(&mut current, &mut blocks);
    blocks
}

fn make_chunk(lines: &[(usize, String)]) -> Option<Chunk> {
    let text = lines
        .iter()
        .map(|(_, l)| l.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return None;
    }
    let start_line = lines.first().map(|(n, _)| *n)?;
    let end_line = lines.last().map(|(n, _)| *n)?;
    let hash = sha256_hex(&text);
    Some(Chunk {
        text,
        start_line,
        end_line,
        hash,
    })
}

/// Trailing lines of `lines` that fit within `overlap_tokens`, in order.
fn overlap_tail(lines: &[(usize, String)], overlap_tokens: usize) -> Vec<(usize, String)> {
    if overlap_tokens == 0 {
        return Vec::new();
    }
    let mut tail: Vec<(usize, String)> = Vec::new();
    let mut budget = 0usize;
    for entry in lines.iter().rev() {
        let cost = estimate_tokens(&entry.1);
        if budget + cost > overlap_tokens {
            break;
        }
        budget += cost;
        tail.push(entry.clone());
    }
    tail.reverse();
    tail
}

/// Split an oversized block into fixed line windows of at most `max_tokens`.
fn split_oversized(block: &Block, max_tokens: usize, chunks: &mut Vec<Chunk>) {
    let mut window: Vec<(usize, String)> = Vec::new();
    let mut tokens = 0usize;
    for entry in &block.lines {
        let cost = estimate_tokens(&entry.1);
        if !window.is_empty() && tokens + cost > max_tokens {
            chunks.extend(make_chunk(&window));
            window.clear();
            tokens = 0;
        }
        tokens += cost;
        window.push(entry.clone());
    }
    chunks.extend(make_chunk(&window));
}

/// Chunk markdown (or plain text) into token-budgeted pieces with overlap.
///
/// `max_tokens` bounds the estimated size of every chunk; `overlap_tokens`
/// bounds how many trailing lines of a flushed chunk are repeated at the head
/// of the next one so context spanning a boundary stays searchable.
pub fn chunk_markdown(content: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    let max_tokens = max_tokens.max(1);
    let blocks = split_blocks(content);
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<(usize, String)> = Vec::new();
    let mut current_tokens = 0usize;

    for block in &blocks {
        if block.tokens > max_tokens {
            // flush what accumulated so far, then window the big block alone
            if !current.is_empty() {
                chunks.extend(make_chunk(&current));
                current.clear();
                current_tokens = 0;
            }
            split_oversized(block, max_tokens, &mut chunks);
            continue;
        }
        if !current.is_empty() && current_tokens + block.tokens > max_tokens {
            chunks.extend(make_chunk(&current));
            let tail = overlap_tail(&current, overlap_tokens);
            current_tokens = tail.iter().map(|(_, l)| estimate_tokens(l)).sum();
            current = tail;
        }
        current_tokens += block.tokens;
        current.extend(block.lines.iter().cloned());
    }
    chunks.extend(make_chunk(&current));
    chunks
}
