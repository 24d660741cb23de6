//! Inline markup found in model responses.
//!
//! Three kinds are recognized:
//! - emotion tags, `<开心>` or `[happy]`: removed from the text and recorded as
//!   [`EmotionMarker`]s at the character position where they appeared
//! - parenthetical asides, `(...)` or `（...）`: removed
//! - stage directions wrapped in asterisks, `*waves*`: removed
//!
//! Openers without a matching closer are kept as plain text, except a lone `*`,
//! which is dropped.

use serde::{Deserialize, Serialize};

/// Longest bracketed run still treated as an emotion tag.
pub(crate) const MAX_TAG_CHARS: usize = 24;

/// An emotion tag and the display-text character offset it was found at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmotionMarker {
    pub tag: String,
    pub char_position: usize,
}

/// Text with all markup removed, plus the markers that were in it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedText {
    pub display: String,
    pub markers: Vec<EmotionMarker>,
}

impl ParsedText {
    pub fn char_len(&self) -> usize {
        self.display.chars().count()
    }
}

/// Split `text` into display text and emotion markers.
pub fn parse_markup(text: &str) -> ParsedText {
    let chars: Vec<char> = text.chars().collect();
    let mut out = ParsedText::default();
    let mut display_len = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '<' | '[' => {
                let close = if c == '<' { '>' } else { ']' };
                if let Some(end) = find_close(&chars, i + 1, close) {
                    let inner: String = chars[i + 1..end].iter().collect();
                    if is_tag(&inner) {
                        out.markers.push(EmotionMarker {
                            tag: inner.trim().to_string(),
                            char_position: display_len,
                        });
                        i = end + 1;
                        continue;
                    }
                }
            }
            '(' | '（' => {
                let close = if c == '(' { ')' } else { '）' };
                if let Some(end) = find_close(&chars, i + 1, close) {
                    i = end + 1;
                    continue;
                }
            }
            '*' => {
                i = match find_close(&chars, i + 1, '*') {
                    Some(end) => end + 1,
                    None => i + 1,
                };
                continue;
            }
            _ => {}
        }
        out.display.push(c);
        display_len += 1;
        i += 1;
    }
    out
}

/// Display text only.
pub fn strip_markup(text: &str) -> String {
    parse_markup(text).display
}

/// Whether anything but punctuation, whitespace and markup remains.
pub fn is_speakable(text: &str) -> bool {
    strip_markup(text).chars().any(char::is_alphanumeric)
}

/// Closing character for a markup opener.
pub(crate) fn markup_closer(opener: char) -> Option<char> {
    match opener {
        '<' => Some('>'),
        '[' => Some(']'),
        '(' => Some(')'),
        '（' => Some('）'),
        '*' => Some('*'),
        _ => None,
    }
}

fn find_close(chars: &[char], from: usize, close: char) -> Option<usize> {
    chars[from.min(chars.len())..]
        .iter()
        .position(|&c| c == close)
        .map(|offset| from + offset)
}

fn is_tag(inner: &str) -> bool {
    let trimmed = inner.trim();
    !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_TAG_CHARS
        && !trimmed
            .chars()
            .any(|c| matches!(c, '<' | '>' | '[' | ']' | '\n'))
}
