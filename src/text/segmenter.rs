//! Sentence chunking for the text front-end
//!
//! Normalizes punctuation, splits raw input into sentence-sized chunks
//! under a named strategy, merges fragments that are too short to
//! featurize well, and guarantees every chunk ends with terminal
//! punctuation. Chunks that survive segmentation are what the feature
//! extractor and decoder actually see.

use anyhow::{bail, Result};
use regex::Regex;
use tracing::debug;

/// Characters that terminate a clause.
const SPLIT_CHARS: &[char] = &[
    '，', '。', '？', '！', ',', '.', '?', '!', '~', ':', '：', '—', '…',
];

/// Longest chunk the feature extractor accepts, in characters.
const MAX_CHUNK_CHARS: usize = 510;

/// Minimum chunk length before merging kicks in, in characters.
const MERGE_THRESHOLD: usize = 5;

fn is_split_char(c: char) -> bool {
    SPLIT_CHARS.contains(&c)
}

/// Chunking strategy, selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Split at every clause-terminating punctuation mark
    ByPunct,
    /// Pack clauses into chunks of at most this many words
    AutoCut(usize),
    /// No splitting
    Whole,
}

impl ChunkStrategy {
    /// Parse a strategy name. `auto_cut_<n>` takes a word cap, clamped to
    /// [5, 1000] with 20 as the fallback; unknown names mean `by_punct`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "whole" => ChunkStrategy::Whole,
            "by_punct" => ChunkStrategy::ByPunct,
            "auto_cut" => ChunkStrategy::AutoCut(20),
            _ => {
                if let Some(rest) = name.strip_prefix("auto_cut_") {
                    let n = rest.parse::<usize>().unwrap_or(20);
                    let n = if (5..=1000).contains(&n) { n } else { 20 };
                    ChunkStrategy::AutoCut(n)
                } else {
                    ChunkStrategy::ByPunct
                }
            }
        }
    }
}

/// Collapse any run of punctuation or spaces to its first character.
pub fn collapse_punctuation(text: &str) -> String {
    // The class mirrors the front-end's punctuation set plus space.
    let re = Regex::new(r"([!?…,.\- ])[!?…,.\- ]+").unwrap();
    re.replace_all(text, "$1").into_owned()
}

/// Number of "words" in a clause: whitespace-separated tokens for latin
/// text, one per ideograph/kana otherwise.
fn word_count(text: &str) -> usize {
    let mut count = 0;
    let mut in_latin_word = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if !in_latin_word {
                count += 1;
                in_latin_word = true;
            }
        } else {
            in_latin_word = false;
            if c.is_alphabetic() {
                count += 1;
            }
        }
    }
    count
}

/// Split into clauses, each keeping its trailing split character.
fn clauses(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if is_split_char(c) {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

fn apply_strategy(text: &str, strategy: ChunkStrategy) -> Vec<String> {
    match strategy {
        ChunkStrategy::Whole => vec![text.to_string()],
        ChunkStrategy::ByPunct => clauses(text),
        ChunkStrategy::AutoCut(cap) => {
            let mut out = Vec::new();
            let mut current = String::new();
            let mut words = 0;
            for clause in clauses(text) {
                let clause_words = word_count(&clause);
                if !current.is_empty() && words + clause_words > cap {
                    out.push(std::mem::take(&mut current));
                    words = 0;
                }
                current.push_str(&clause);
                words += clause_words;
            }
            if !current.is_empty() {
                out.push(current);
            }
            out
        }
    }
}

/// Merge chunks shorter than `threshold` chars into their successor; a
/// short remainder is appended to the last chunk. Concatenation of the
/// output always equals concatenation of the input.
pub fn merge_short_chunks(chunks: Vec<String>, threshold: usize) -> Vec<String> {
    if chunks.len() < 2 {
        return chunks;
    }
    let mut result: Vec<String> = Vec::new();
    let mut current = String::new();
    for chunk in chunks {
        current.push_str(&chunk);
        if current.chars().count() >= threshold {
            result.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        match result.last_mut() {
            Some(last) => last.push_str(&current),
            None => result.push(current),
        }
    }
    result
}

/// Cut an oversized chunk into pieces of at most `max_chars` characters,
/// preferring clause boundaries.
fn split_long_chunk(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for clause in clauses(text) {
        let clause_len = clause.chars().count();
        if current_len + clause_len > max_chars && !current.is_empty() {
            out.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if clause_len > max_chars {
            // A single clause over the cap is cut at character boundaries.
            let chars: Vec<char> = clause.chars().collect();
            for piece in chars.chunks(max_chars) {
                out.push(piece.iter().collect());
            }
        } else {
            current.push_str(&clause);
            current_len += clause_len;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Whether a chunk has any speakable content left after stripping
/// punctuation and whitespace.
fn has_content(text: &str) -> bool {
    text.chars().any(|c| c.is_alphanumeric())
}

/// Segment raw text into featurizable chunks.
///
/// `lang_tag` only affects which sentence terminator is inserted; language
/// run splitting happens later per chunk. Fails with an `invalid input`
/// error when nothing speakable remains.
pub fn segment(text: &str, lang_tag: &str, strategy: ChunkStrategy) -> Result<Vec<String>> {
    let text = collapse_punctuation(text.trim());
    if text.is_empty() {
        bail!("invalid input: empty text");
    }

    // A too-short leading clause destabilizes splitting; pin it behind a
    // sentence terminator.
    let terminator = if lang_tag == "en" { "." } else { "。" };
    let first_clause_len = text
        .chars()
        .take_while(|c| !is_split_char(*c))
        .count();
    let starts_with_split = text.chars().next().map(is_split_char).unwrap_or(false);
    let text = if !starts_with_split && first_clause_len < 4 {
        format!("{}{}", terminator, text)
    } else {
        text
    };

    let chunks = apply_strategy(&text, strategy);
    let chunks = merge_short_chunks(chunks, MERGE_THRESHOLD);

    let mut out = Vec::new();
    for chunk in chunks {
        let chunk = chunk.trim().to_string();
        if !has_content(&chunk) {
            continue;
        }
        let chunk = if chunk.ends_with(is_split_char) {
            chunk
        } else {
            format!("{}{}", chunk, terminator)
        };
        if chunk.chars().count() > MAX_CHUNK_CHARS {
            for piece in split_long_chunk(&chunk, MAX_CHUNK_CHARS) {
                if has_content(&piece) {
                    out.push(piece);
                }
            }
        } else {
            out.push(chunk);
        }
    }

    if out.is_empty() {
        bail!("invalid input: no speakable content after segmentation");
    }
    debug!(chunks = out.len(), "text segmented");
    Ok(out)
}
