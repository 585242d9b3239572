//! Break point detection for chunking

use regex::Regex;
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;

/// Priority levels for break points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakPriority {
    /// Word boundary (lowest)
    Word = 1,
    /// Sentence boundary
    Sentence = 2,
    /// Paragraph boundary (highest)
    Paragraph = 3,
}

fn blank_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n[ \t\r]*\n").unwrap())
}

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Paragraphs separated by blank lines, trimmed, empties removed
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    blank_line()
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split `text` into pieces of at most `max_chars`, preferring the highest
/// priority boundary that fits.
pub fn split_oversized(text: &str, max_chars: usize, priority: BreakPriority) -> Vec<String> {
    if char_len(text) <= max_chars {
        return vec![text.trim().to_string()];
    }

    let segments: Vec<&str> = match priority {
        BreakPriority::Paragraph | BreakPriority::Sentence => text.split_sentence_bounds().collect(),
        BreakPriority::Word => text.split_word_bounds().collect(),
    };

    // A single segment that covers everything means this level cannot split it
    if segments.len() <= 1 {
        return match priority {
            BreakPriority::Word => hard_split(text, max_chars),
            _ => split_oversized(text, max_chars, BreakPriority::Word),
        };
    }

    let lower = match priority {
        BreakPriority::Word => None,
        _ => Some(BreakPriority::Word),
    };

    let mut pieces = Vec::new();
    let mut current = String::new();
    for segment in segments {
        if char_len(segment) > max_chars {
            flush(&mut current, &mut pieces);
            match lower {
                Some(level) => pieces.extend(split_oversized(segment, max_chars, level)),
                None => pieces.extend(hard_split(segment, max_chars)),
            }
            continue;
        }
        if char_len(&current) + char_len(segment) > max_chars {
            flush(&mut current, &mut pieces);
        }
        current.push_str(segment);
    }
    flush(&mut current, &mut pieces);
    pieces
}

fn flush(current: &mut String, pieces: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        pieces.push(trimmed.to_string());
    }
    current.clear();
}

/// Cut by characters when no boundary exists
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
