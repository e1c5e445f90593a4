//! Tool-tag filtering.
//!
//! Some models emit textual `<tool_call>…</tool_call>` spans in their
//! content alongside (or instead of) structured tool calls. Consumers must
//! never see them, and filtering has to happen at stream-read time: a tag
//! may be split across chunk boundaries, so post-processing the accumulated
//! string would still have leaked partial tags to chunk listeners.
//!
//! [`ToolTagFilter`] is the stateful streaming filter; [`strip_tool_tags`]
//! handles at-rest content (historical messages loaded from storage).

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streaming filter that removes `<tool_call>…</tool_call>` spans.
///
/// Feed each content chunk through [`ToolTagFilter::push`]; the returned
/// text is safe to display. Call [`ToolTagFilter::finish`] at stream end to
/// flush a trailing partial prefix that turned out not to be a tag.
#[derive(Debug, Default)]
pub struct ToolTagFilter {
    /// Inside a `<tool_call>` span, discarding until the close tag.
    in_tag: bool,
    /// Bytes that might be the start of an open/close tag, held back until
    /// disambiguated.
    pending: String,
}

impl ToolTagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk, returning the displayable text it contributes.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::new();
        self.pending.push_str(chunk);

        loop {
            if self.in_tag {
                if let Some(pos) = self.pending.find(CLOSE_TAG) {
                    self.pending.drain(..pos + CLOSE_TAG.len());
                    self.in_tag = false;
                } else {
                    // Keep only a potential close-tag prefix; drop the rest.
                    let keep = partial_suffix_len(&self.pending, CLOSE_TAG);
                    let cut = self.pending.len() - keep;
                    self.pending.drain(..cut);
                    return out;
                }
            } else if let Some(pos) = self.pending.find(OPEN_TAG) {
                out.push_str(&self.pending[..pos]);
                self.pending.drain(..pos + OPEN_TAG.len());
                self.in_tag = true;
            } else {
                let keep = partial_suffix_len(&self.pending, OPEN_TAG);
                let cut = self.pending.len() - keep;
                out.push_str(&self.pending[..cut]);
                self.pending.drain(..cut);
                return out;
            }
        }
    }

    /// Flush at stream end. A held-back prefix that never became a tag is
    /// returned; an unterminated tag span is dropped.
    pub fn finish(&mut self) -> String {
        if self.in_tag {
            self.pending.clear();
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of `tag`.
fn partial_suffix_len(s: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(s.len());
    for len in (1..=max).rev() {
        if s.is_char_boundary(s.len() - len) && tag.starts_with(&s[s.len() - len..]) {
            return len;
        }
    }
    0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// At-rest sanitizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strip complete tag spans (and any dangling open tag) from stored
/// content. Used when sending historical messages back to the LLM.
pub fn strip_tool_tags(content: &str) -> String {
    let mut filter = ToolTagFilter::new();
    let mut out = filter.push(content);
    out.push_str(&filter.finish());
    out
}
