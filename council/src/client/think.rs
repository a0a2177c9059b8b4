//! Splits `<think>…</think>` delimited reasoning out of a token stream.
//!
//! Reasoning models without a structured thinking field inline their
//! reasoning between think tags. The splitter routes inner text to
//! thinking and everything else to content, holding back stream tails
//! that could be the start of a tag split across deltas.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// A routed piece of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Thinking(String),
    Content(String),
}

/// Stateful tag splitter fed with stream deltas.
#[derive(Debug, Default)]
pub struct ThinkSplitter {
    in_think: bool,
    pending: String,
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta, returning any fully classified segments.
    pub fn feed(&mut self, delta: &str) -> Vec<Segment> {
        self.pending.push_str(delta);
        let mut out = Vec::new();

        loop {
            let tag = if self.in_think { CLOSE_TAG } else { OPEN_TAG };
            if let Some(pos) = self.pending.find(tag) {
                let before: String = self.pending[..pos].to_string();
                self.pending.drain(..pos + tag.len());
                self.push(&mut out, before);
                self.in_think = !self.in_think;
                continue;
            }

            // No full tag: emit all but a tail that could still become one.
            let keep = holdback_len(&self.pending, tag);
            let emit_to = self.pending.len() - keep;
            if emit_to > 0 {
                let text: String = self.pending[..emit_to].to_string();
                self.pending.drain(..emit_to);
                self.push(&mut out, text);
            }
            return out;
        }
    }

    /// Flush any held-back tail when the stream ends.
    pub fn flush(&mut self) -> Vec<Segment> {
        let rest = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        self.push(&mut out, rest);
        out
    }

    fn push(&self, out: &mut Vec<Segment>, text: String) {
        if text.is_empty() {
            return;
        }
        match (self.in_think, out.last_mut()) {
            (true, Some(Segment::Thinking(prev))) => prev.push_str(&text),
            (false, Some(Segment::Content(prev))) => prev.push_str(&text),
            (true, _) => out.push(Segment::Thinking(text)),
            (false, _) => out.push(Segment::Content(text)),
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of
/// `tag` (the part we must hold back in case the tag continues in the
/// next delta).
fn holdback_len(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        if tag.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

/// One-shot split for whole (non-streamed) responses: returns
/// `(content, thinking)` with think segments removed from the content.
pub fn split_thinking(text: &str) -> (String, Option<String>) {
    let mut splitter = ThinkSplitter::new();
    let mut segments = splitter.feed(text);
    segments.extend(splitter.flush());

    let mut content = String::new();
    let mut thinking = String::new();
    for segment in segments {
        match segment {
            Segment::Content(s) => content.push_str(&s),
            Segment::Thinking(s) => thinking.push_str(&s),
        }
    }
    let thinking = thinking.trim().to_string();
    (
        content.trim().to_string(),
        (!thinking.is_empty()).then_some(thinking),
    )
}
