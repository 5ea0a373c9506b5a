//! SummarizationSegmenter: partitions a message history into overlapping
//! segments for later compaction.
//!
//! Pure and window-independent. Boundaries only; generating replacement
//! text is left to the completion collaborator (see [`crate::enrichment`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CtxwardenError, Result};
use crate::tokens::approx_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
        }
    }
}

/// True when the history is long enough by count or by approximate tokens.
pub fn should_summarize(messages: &[Message], token_threshold: u64, count_threshold: usize) -> bool {
    if messages.len() >= count_threshold {
        return true;
    }
    let total: u64 = messages.iter().map(|m| approx_tokens(&m.content)).sum();
    total >= token_threshold
}

/// A contiguous, inclusive slice `[start_idx, end_idx]` of the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub start_idx: usize,
    pub end_idx: usize,
    pub messages: &'a [Message],
}

impl<'a> Segment<'a> {
    pub fn start_id(&self) -> &'a str {
        self.messages.first().map(|m| m.id.as_str()).unwrap_or_default()
    }

    pub fn end_id(&self) -> &'a str {
        self.messages.last().map(|m| m.id.as_str()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// SHA-256 (hex) over the member message ids.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for message in self.messages {
            hasher.update(message.id.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// `"<start_id>..<end_id>"`, the back-reference carried by summary items.
    pub fn source_ref(&self) -> String {
        format!("{}..{}", self.start_id(), self.end_id())
    }
}

/// Lazily computed segment boundaries over a borrowed history.
#[derive(Debug, Clone, Copy)]
pub struct SegmentPlan<'a> {
    messages: &'a [Message],
    size: usize,
    step: usize,
    count: usize,
}

impl<'a> SegmentPlan<'a> {
    /// A fresh iterator from the first segment; call again to restart.
    pub fn iter(&self) -> Segments<'a> {
        Segments {
            plan: *self,
            next_start: Some(0),
        }
        .primed()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn segment_size(&self) -> usize {
        self.size
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

impl<'a> IntoIterator for &SegmentPlan<'a> {
    type Item = Segment<'a>;
    type IntoIter = Segments<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`SegmentPlan`].
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    plan: SegmentPlan<'a>,
    next_start: Option<usize>,
}

impl<'a> Segments<'a> {
    fn primed(mut self) -> Self {
        if self.plan.count == 0 {
            self.next_start = None;
        }
        self
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next_start?;
        let len = self.plan.messages.len();
        let end = (start + self.plan.size - 1).min(len - 1);

        self.next_start = if end == len - 1 {
            None
        } else {
            Some(start + self.plan.step)
        };

        Some(Segment {
            start_idx: start,
            end_idx: end,
            messages: &self.plan.messages[start..=end],
        })
    }
}

fn count_segments(len: usize, size: usize, step: usize) -> usize {
    if len <= size {
        return 0;
    }
    // starts 0, step, 2*step, ... until a segment reaches the last index
    (len - size).div_ceil(step) + 1
}

/// Overlapping windows of `segment_size` messages advancing by
/// `segment_size - overlap`. Empty when the history fits in one segment.
pub fn segments(messages: &[Message], segment_size: usize, overlap: usize) -> Result<SegmentPlan<'_>> {
    if segment_size == 0 {
        return Err(CtxwardenError::InvalidSegmentation(
            "segment size must be at least 1".to_string(),
        ));
    }
    if overlap >= segment_size {
        return Err(CtxwardenError::InvalidSegmentation(format!(
            "overlap ({overlap}) must be smaller than segment size ({segment_size})"
        )));
    }
    let step = segment_size - overlap;
    Ok(SegmentPlan {
        messages,
        size: segment_size,
        step,
        count: count_segments(messages.len(), segment_size, step),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::new(format!("m{i}"), Role::User, "hi"))
            .collect()
    }

    fn bounds(plan: &SegmentPlan<'_>) -> Vec<(usize, usize)> {
        plan.iter().map(|s| (s.start_idx, s.end_idx)).collect()
    }

    #[test]
    fn ten_by_four_overlap_one() {
        let msgs = history(10);
        let plan = segments(&msgs, 4, 1).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(bounds(&plan), vec![(0, 3), (3, 6), (6, 9)]);
    }

    #[test]
    fn short_history_has_no_segments() {
        let msgs = history(4);
        let plan = segments(&msgs, 4, 1).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.iter().count(), 0);
    }

    #[test]
    fn final_segment_may_be_shorter() {
        let msgs = history(11);
        let plan = segments(&msgs, 4, 1).unwrap();
        assert_eq!(bounds(&plan), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn zero_overlap_tiles_exactly() {
        let msgs = history(9);
        let plan = segments(&msgs, 3, 0).unwrap();
        assert_eq!(bounds(&plan), vec![(0, 2), (3, 5), (6, 8)]);
    }

    #[test]
    fn iteration_is_restartable() {
        let msgs = history(10);
        let plan = segments(&msgs, 4, 1).unwrap();
        let mut first = plan.iter();
        first.next();
        assert_eq!(bounds(&plan), vec![(0, 3), (3, 6), (6, 9)]);
        assert_eq!((&plan).into_iter().count(), 3);
    }

    #[test]
    fn invalid_parameters() {
        let msgs = history(10);
        assert!(matches!(
            segments(&msgs, 4, 4),
            Err(CtxwardenError::InvalidSegmentation(_))
        ));
        assert!(segments(&msgs, 0, 0).is_err());
    }

    #[test]
    fn segment_ids_and_digest() {
        let msgs = history(10);
        let plan = segments(&msgs, 4, 1).unwrap();
        let segs: Vec<Segment<'_>> = plan.iter().collect();
        assert_eq!(segs[1].start_id(), "m3");
        assert_eq!(segs[1].end_id(), "m6");
        assert_eq!(segs[1].source_ref(), "m3..m6");
        assert_eq!(segs[0].digest().len(), 64);
        assert_ne!(segs[0].digest(), segs[1].digest());
        assert_eq!(segs[0].digest(), plan.iter().next().unwrap().digest());
    }

    #[test]
    fn summarize_thresholds() {
        let msgs = history(10);
        assert!(should_summarize(&msgs, 100_000, 5));
        assert!(!should_summarize(&msgs, 100_000, 11));

        let long = vec![Message::new("m0", Role::Assistant, "x".repeat(400))];
        assert!(should_summarize(&long, 100, 5));
        assert!(!should_summarize(&long, 101, 5));
    }
}
