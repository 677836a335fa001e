use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_REASONING_START: &str = "<think>";
pub const DEFAULT_REASONING_END: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningMarkers {
    pub start: String,
    pub end: String,
}

impl Default for ReasoningMarkers {
    fn default() -> Self {
        Self {
            start: DEFAULT_REASONING_START.to_string(),
            end: DEFAULT_REASONING_END.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub visible: String,
    /// Unique trimmed segments in order of first appearance, the open tail last.
    pub segments: Vec<String>,
    /// Content after a start marker that has no end marker yet.
    pub open_tail: Option<String>,
}

/// Splits delimited reasoning out of answer text. Holds no state between
/// calls, so it can be rerun on every growth of the same text.
#[derive(Debug, Clone)]
pub struct ReasoningExtractor {
    markers: ReasoningMarkers,
    /// `None` when either marker is empty; extraction is then a plain trim.
    stray: Option<Regex>,
}

impl ReasoningExtractor {
    pub fn new(markers: ReasoningMarkers) -> Self {
        if markers.start.is_empty() || markers.end.is_empty() {
            tracing::warn!(
                event = "reasoning_markers_disabled",
                start = %markers.start,
                end = %markers.end
            );
            return Self {
                markers,
                stray: None,
            };
        }
        let pattern = format!(
            "{}|{}",
            regex::escape(&markers.start),
            regex::escape(&markers.end)
        );
        let stray = Regex::new(&pattern).expect("escaped markers form a valid regex");
        Self {
            markers,
            stray: Some(stray),
        }
    }

    pub fn markers(&self) -> &ReasoningMarkers {
        &self.markers
    }

    pub fn extract(&self, text: &str) -> Extraction {
        let Some(stray) = self.stray.as_ref() else {
            return Extraction {
                visible: text.trim().to_string(),
                ..Extraction::default()
            };
        };
        let start = self.markers.start.as_str();
        let end = self.markers.end.as_str();
        let mut segments: Vec<String> = Vec::new();
        let mut remaining = String::with_capacity(text.len());
        let mut cursor = 0;

        while let Some(found) = text[cursor..].find(start) {
            let open_idx = cursor + found;
            let body_idx = open_idx + start.len();
            let Some(close_rel) = text[body_idx..].find(end) else {
                break;
            };
            remaining.push_str(&text[cursor..open_idx]);
            let body = stray.replace_all(&text[body_idx..body_idx + close_rel], "");
            push_unique(&mut segments, &body);
            cursor = body_idx + close_rel + end.len();
        }
        remaining.push_str(&text[cursor..]);

        let mut open_tail = None;
        if let Some(open_idx) = remaining.find(start) {
            let tail = remaining[open_idx + start.len()..].to_string();
            remaining.truncate(open_idx);
            let tail = stray.replace_all(&tail, "").trim().to_string();
            if !tail.is_empty() {
                push_unique(&mut segments, &tail);
                open_tail = Some(tail);
            }
        }

        let visible = stray.replace_all(&remaining, "").trim().to_string();
        Extraction {
            visible,
            segments,
            open_tail,
        }
    }
}

impl Default for ReasoningExtractor {
    fn default() -> Self {
        Self::new(ReasoningMarkers::default())
    }
}

/// Extraction with the default `<think>` markers.
pub fn extract_reasoning(text: &str) -> Extraction {
    static DEFAULT: OnceLock<ReasoningExtractor> = OnceLock::new();
    DEFAULT.get_or_init(ReasoningExtractor::default).extract(text)
}

fn push_unique(segments: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || segments.iter().any(|existing| existing == trimmed) {
        return;
    }
    segments.push(trimmed.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_in_one_shot() {
        let extraction = extract_reasoning("<think>step1</think>Answer A");
        assert_eq!(extraction.segments, vec!["step1".to_string()]);
        assert_eq!(extraction.visible, "Answer A");
        assert_eq!(extraction.open_tail, None);
    }

    #[test]
    fn multiple_segments_keep_order_and_drop_duplicates() {
        let text = "<think> plan </think>First.<think>check</think> Second.<think>plan</think>";
        let extraction = extract_reasoning(text);
        assert_eq!(
            extraction.segments,
            vec!["plan".to_string(), "check".to_string()]
        );
        assert_eq!(extraction.visible, "First. Second.");
        assert!(!extraction.visible.contains("<think>"));
        assert!(!extraction.visible.contains("</think>"));
    }

    #[test]
    fn unterminated_segment_is_pulled_out_of_visible_text() {
        let extraction = extract_reasoning("Intro <think>partial thought");
        assert_eq!(extraction.visible, "Intro");
        assert_eq!(extraction.segments, vec!["partial thought".to_string()]);
        assert_eq!(extraction.open_tail.as_deref(), Some("partial thought"));
    }

    #[test]
    fn open_segment_becomes_closed_as_text_grows() {
        let early = extract_reasoning("<think>weigh options");
        assert_eq!(early.visible, "");
        assert_eq!(early.open_tail.as_deref(), Some("weigh options"));

        let later = extract_reasoning("<think>weigh options</think>Pick B");
        assert_eq!(later.visible, "Pick B");
        assert_eq!(later.segments, vec!["weigh options".to_string()]);
        assert_eq!(later.open_tail, None);
    }

    #[test]
    fn stray_markers_are_stripped() {
        let extraction = extract_reasoning("answer</think> continues");
        assert_eq!(extraction.visible, "answer continues");
        assert!(extraction.segments.is_empty());

        let nested = extract_reasoning("<think>a<think>b</think>tail");
        assert_eq!(nested.visible, "tail");
        assert_eq!(nested.segments, vec!["ab".to_string()]);
    }

    #[test]
    fn custom_markers_are_honoured() {
        let extractor = ReasoningExtractor::new(ReasoningMarkers {
            start: "[thinking]".to_string(),
            end: "[/thinking]".to_string(),
        });
        let extraction = extractor.extract("[thinking]hmm[/thinking]Result (1+1)");
        assert_eq!(extraction.segments, vec!["hmm".to_string()]);
        assert_eq!(extraction.visible, "Result (1+1)");
    }

    #[test]
    fn empty_markers_leave_text_alone() {
        for (start, end) in [("", ""), ("<think>", ""), ("", "</think>")] {
            let extractor = ReasoningExtractor::new(ReasoningMarkers {
                start: start.to_string(),
                end: end.to_string(),
            });
            let extraction = extractor.extract(" <think>a</think>b ");
            assert_eq!(extraction.visible, "<think>a</think>b");
            assert!(extraction.segments.is_empty());
            assert_eq!(extraction.open_tail, None);
        }
    }

    #[test]
    fn text_without_markers_passes_through_trimmed() {
        let extraction = extract_reasoning("  plain answer \n");
        assert_eq!(extraction.visible, "plain answer");
        assert!(extraction.segments.is_empty());
    }
}
