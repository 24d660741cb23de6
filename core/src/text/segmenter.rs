//! Punctuation-driven segmentation of streamed or complete text.
//!
//! A segment ends at the first punctuation character that closes a run. Punctuation
//! inside a markup span (an aside, a stage direction or an emotion tag) is not a
//! boundary, so `"好的（小声，慢慢地）。"` stays one segment and its aside is stripped
//! whole. A span that outgrows its limit, or is still open at end of stream, is taken
//! as literal text and the punctuation inside it splits as usual.
//!
//! Runs that carry nothing speakable once markup is stripped are consumed and dropped,
//! so the synthesis queue never sees a segment like `"<开心>。"`. Every decision depends
//! only on the characters after the last cut, which makes chunked feeding equivalent
//! to whole-text segmentation.

use super::markup::{is_speakable, markup_closer, MAX_TAG_CHARS};
use crate::config::DEFAULT_PUNCTUATION;

/// Longest aside or stage direction held open while waiting for its closer.
const MAX_ASIDE_CHARS: usize = 80;

#[derive(Clone, Debug)]
pub struct TextSegmenter {
    punctuation: Vec<char>,
    buffer: String,
}

/// A markup opener still waiting for its closer.
struct OpenSpan {
    /// Char index of the opener in the buffer.
    at: usize,
    close: char,
    tag: bool,
}

impl OpenSpan {
    /// Whether `c` at char index `i` proves this opener is not markup.
    fn abandoned_at(&self, i: usize, c: char) -> bool {
        let inner = i - self.at;
        if self.tag {
            inner > MAX_TAG_CHARS || matches!(c, '<' | '>' | '[' | ']' | '\n')
        } else {
            inner > MAX_ASIDE_CHARS
        }
    }
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_PUNCTUATION)
    }
}

impl TextSegmenter {
    pub fn new(punctuation: &str) -> Self {
        Self {
            punctuation: punctuation.chars().filter(|c| !c.is_whitespace()).collect(),
            buffer: String::new(),
        }
    }

    /// Append a streamed chunk; returns every segment it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        self.cut(false)
    }

    /// Flush the carried remainder at end of stream.
    pub fn finalize(&mut self) -> Vec<String> {
        self.cut(true)
    }

    /// Segment a complete text with this segmenter's punctuation set.
    pub fn segment_whole(&self, text: &str) -> Vec<String> {
        let mut fresh = TextSegmenter {
            punctuation: self.punctuation.clone(),
            buffer: String::new(),
        };
        let mut segments = fresh.feed(text);
        segments.extend(fresh.finalize());
        segments
    }

    /// Unconsumed text carried to the next `feed`.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// True when the carried remainder would become a segment on finalize.
    pub fn has_pending(&self) -> bool {
        is_speakable(&self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    // Scans the buffer from the last cut. Without `at_end`, a span still open when the
    // buffer runs out stops the scan and everything from the last cut is carried.
    fn cut(&mut self, at_end: bool) -> Vec<String> {
        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        let mut segments = Vec::new();
        let mut start = 0usize;
        let mut open: Option<OpenSpan> = None;
        let mut i = 0usize;

        loop {
            if i >= chars.len() {
                match open.take() {
                    Some(span) if at_end => {
                        i = span.at + 1;
                        continue;
                    }
                    _ => break,
                }
            }
            let (idx, c) = chars[i];

            if let Some(span) = &open {
                if c == span.close {
                    open = None;
                } else if span.abandoned_at(i, c) {
                    // Rescan from just after the opener, which is now plain text.
                    i = span.at + 1;
                    open = None;
                    continue;
                }
                i += 1;
                continue;
            }

            if let Some(close) = markup_closer(c) {
                open = Some(OpenSpan {
                    at: i,
                    close,
                    tag: matches!(c, '<' | '['),
                });
            } else if self.punctuation.contains(&c) {
                let end = idx + c.len_utf8();
                let run = &self.buffer[start..end];
                if is_speakable(run) {
                    segments.push(run.trim().to_string());
                }
                start = end;
            }
            i += 1;
        }

        if at_end {
            let rest = std::mem::take(&mut self.buffer);
            let rest = &rest[start..];
            if is_speakable(rest) {
                segments.push(rest.trim().to_string());
            }
        } else {
            self.buffer.drain(..start);
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_partial_run_between_feeds() {
        let mut seg = TextSegmenter::default();
        assert!(seg.feed("今天天").is_empty());
        assert_eq!(seg.pending(), "今天天");
        assert_eq!(seg.feed("气不错。明"), vec!["今天天气不错。"]);
        assert_eq!(seg.pending(), "明");
        assert_eq!(seg.finalize(), vec!["明"]);
        assert_eq!(seg.pending(), "");
    }

    #[test]
    fn consecutive_punctuation_does_not_emit_empty_runs() {
        let seg = TextSegmenter::default();
        assert_eq!(seg.segment_whole("真的吗？！好。"), vec!["真的吗？", "好。"]);
    }

    #[test]
    fn open_aside_holds_back_punctuation() {
        let mut seg = TextSegmenter::default();
        assert_eq!(seg.feed("好的。（小声，"), vec!["好的。"]);
        assert_eq!(seg.pending(), "（小声，");
        assert_eq!(seg.feed("慢慢地）走吧。"), vec!["（小声，慢慢地）走吧。"]);
    }

    #[test]
    fn unclosed_aside_splits_at_end_of_stream() {
        let mut seg = TextSegmenter::default();
        assert!(seg.feed("（小声，慢慢地。走吧").is_empty());
        assert_eq!(seg.finalize(), vec!["（小声，", "慢慢地。", "走吧"]);
    }
}
