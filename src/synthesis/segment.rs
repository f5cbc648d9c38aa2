//! Sentence/clause segmentation of reply text for low-latency synthesis.

/// Sentences longer than this are split again at clause punctuation.
pub const MAX_SEGMENT_CHARS: usize = 100;

const SENTENCE_END: &[char] = &['.', '!', '?'];
const CLAUSE_END: &[char] = &[',', ';', ':'];

/// Split complete text into speakable segments.
#[must_use]
pub fn split_for_speech(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for sentence in split_after(text, SENTENCE_END) {
        let sentence = sentence.trim();
        if sentence.chars().count() <= MAX_SEGMENT_CHARS {
            push_trimmed(&mut out, sentence);
        } else {
            for clause in split_after(sentence, CLAUSE_END) {
                push_trimmed(&mut out, clause);
            }
        }
    }
    out
}

/// Pieces ending right after a mark that is followed by whitespace.
fn split_after<'a>(text: &'a str, marks: &[char]) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !marks.contains(&c) {
            continue;
        }
        if let Some(&(next_idx, next)) = chars.peek() {
            if next.is_whitespace() {
                pieces.push(&text[start..next_idx]);
                start = next_idx;
            }
        }
    }
    pieces.push(&text[start..]);
    pieces
}

fn last_boundary(text: &str, marks: &[char]) -> Option<usize> {
    let mut found = None;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if marks.contains(&c) {
            if let Some(&(next_idx, next)) = chars.peek() {
                if next.is_whitespace() {
                    found = Some(next_idx);
                }
            }
        }
    }
    found
}

fn push_trimmed(out: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
}

/// Turns a token stream into segments as soon as a safe boundary is seen.
#[derive(Debug, Default)]
pub struct Segmenter {
    pending: String,
}

impl Segmenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one increment; returns the segments it completed.
    pub fn push(&mut self, increment: &str) -> Vec<String> {
        self.pending.push_str(increment);
        let mut out = Vec::new();

        if let Some(end) = last_boundary(&self.pending, SENTENCE_END) {
            let complete: String = self.pending.drain(..end).collect();
            out.extend(split_for_speech(&complete));
        }

        if self.pending.trim().chars().count() > MAX_SEGMENT_CHARS {
            if let Some(end) = last_boundary(&self.pending, CLAUSE_END) {
                let head: String = self.pending.drain(..end).collect();
                for clause in split_after(&head, CLAUSE_END) {
                    push_trimmed(&mut out, clause);
                }
            }
        }
        out
    }

    /// Flush whatever is left once the increments are exhausted.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        split_for_speech(&rest)
    }
}
