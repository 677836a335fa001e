//! Response reconciliation: merges upstream fragments into one growing answer,
//! decides what the client gets to see, and finalizes exactly once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use std::fmt;

use crate::interpret::{interpret_payload, EventKind, Fragment};
use crate::reasoning::ReasoningExtractor;
use crate::store::SessionStore;
use crate::stream::{EventLineDecoder, LineReport};
use crate::wire::{answer_id, format_ts, MessageRole, MessageView, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Accumulating,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatedAnswer {
    pub visible_text: String,
    pub reasoning_segments: Vec<String>,
    pub open_reasoning_tail: Option<String>,
    pub last_emitted_text: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Unchanged,
    /// Candidate contained the current text; whatever followed it was appended.
    Extended,
    /// No containment either way; candidate appended after a space.
    Appended,
}

/// Applies one candidate to the running text. Never shortens `visible`, and
/// applying the same candidate twice changes nothing the second time.
pub fn merge_fragment(visible: &mut String, candidate: &str) -> MergeOutcome {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate == visible.as_str() {
        return MergeOutcome::Unchanged;
    }
    if visible.contains(candidate) {
        return MergeOutcome::Unchanged;
    }
    if let Some(start) = candidate.find(visible.as_str()) {
        let suffix = &candidate[start + visible.len()..];
        if suffix.is_empty() {
            return MergeOutcome::Unchanged;
        }
        visible.push_str(suffix);
        return MergeOutcome::Extended;
    }
    if !visible.is_empty() {
        visible.push(' ');
    }
    visible.push_str(candidate);
    MergeOutcome::Appended
}

/// Identity of the request a reconciler works for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub conversation_id: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    /// Upstream session already cached for the conversation, if any.
    pub known_upstream_session: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    pub update: Option<ServerEvent>,
    pub new_upstream_session: Option<String>,
    pub final_requested: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Finalization {
    Answer {
        update: ServerEvent,
        text: String,
        reasoning: Vec<String>,
    },
    /// Nothing usable arrived; the caller owes a fallback reply.
    Empty,
    AlreadyFinalized,
}

pub struct Reconciler {
    scope: RequestScope,
    extractor: ReasoningExtractor,
    state: ReconcileState,
    answer: AccumulatedAnswer,
    upstream_session: Option<String>,
    fragments_merged: usize,
}

impl Reconciler {
    pub fn new(scope: RequestScope, extractor: ReasoningExtractor) -> Self {
        let upstream_session = scope.known_upstream_session.clone();
        Self {
            scope,
            extractor,
            state: ReconcileState::Accumulating,
            answer: AccumulatedAnswer::default(),
            upstream_session,
            fragments_merged: 0,
        }
    }

    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    pub fn answer(&self) -> &AccumulatedAnswer {
        &self.answer
    }

    pub fn upstream_session(&self) -> Option<&str> {
        self.upstream_session.as_deref()
    }

    pub fn apply(&mut self, fragment: &Fragment) -> Step {
        let mut step = Step::default();
        if self.state != ReconcileState::Accumulating {
            tracing::debug!(
                event = "fragment_after_final",
                message_id = %self.scope.message_id,
                upstream_event = %fragment.source_event
            );
            return step;
        }

        if let Some(session) = fragment.upstream_session_id.as_deref() {
            if self.upstream_session.as_deref() != Some(session) {
                self.upstream_session = Some(session.to_string());
                step.new_upstream_session = Some(session.to_string());
            }
        }

        if matches!(fragment.kind, EventKind::Content | EventKind::Final) && fragment.has_text() {
            let previous = self.answer.visible_text.clone();
            let outcome = merge_fragment(&mut self.answer.visible_text, &fragment.text);
            self.fragments_merged += 1;
            tracing::trace!(
                event = "fragment_merged",
                message_id = %self.scope.message_id,
                upstream_event = %fragment.source_event,
                mode = ?fragment.mode,
                outcome = ?outcome
            );
            if outcome != MergeOutcome::Unchanged {
                step.update = self.incremental_update(previous);
            }
        }

        step.final_requested = fragment.kind == EventKind::Final;
        step
    }

    /// Extracts the merged text and pushes it when the visible part changed.
    /// A merge whose stripped text no longer contains what the client already
    /// saw is rolled back to `previous`.
    fn incremental_update(&mut self, previous: String) -> Option<ServerEvent> {
        let extraction = self.extractor.extract(&self.answer.visible_text);
        if !extraction.visible.contains(self.answer.last_emitted_text.as_str()) {
            tracing::debug!(
                event = "visible_regression_withheld",
                message_id = %self.scope.message_id,
                emitted_chars = self.answer.last_emitted_text.chars().count(),
                stripped_chars = extraction.visible.chars().count()
            );
            self.answer.visible_text = previous;
            return None;
        }
        self.answer.reasoning_segments = extraction.segments;
        self.answer.open_reasoning_tail = extraction.open_tail;
        if extraction.visible == self.answer.last_emitted_text {
            return None;
        }
        self.answer.last_emitted_text = extraction.visible.clone();
        Some(self.update_event(extraction.visible, false))
    }

    /// Moves to `Finalizing` and returns what must be pushed and persisted.
    /// Call [`Reconciler::finish`] once both are done.
    pub fn finalize(&mut self) -> Finalization {
        if self.state != ReconcileState::Accumulating {
            return Finalization::AlreadyFinalized;
        }
        let extraction = self.extractor.extract(&self.answer.visible_text);
        self.answer.reasoning_segments = extraction.segments.clone();
        self.answer.open_reasoning_tail = extraction.open_tail;

        if extraction.visible.is_empty() {
            self.state = ReconcileState::Done;
            return Finalization::Empty;
        }

        self.state = ReconcileState::Finalizing;
        self.answer.is_final = true;
        self.answer.last_emitted_text = extraction.visible.clone();
        let update = self.update_event(extraction.visible.clone(), true);
        Finalization::Answer {
            update,
            text: extraction.visible,
            reasoning: extraction.segments,
        }
    }

    pub fn finish(&mut self) {
        self.state = ReconcileState::Done;
    }

    pub fn fragments_merged(&self) -> usize {
        self.fragments_merged
    }

    fn update_event(&self, content: String, is_final: bool) -> ServerEvent {
        ServerEvent::StreamingMessage(MessageView {
            id: answer_id(&self.scope.message_id),
            conversation_id: self.scope.conversation_id.clone(),
            role: MessageRole::Assistant,
            content,
            thinks: self.answer.reasoning_segments.clone(),
            is_streaming: !is_final,
            created_at: format_ts(self.scope.created_at),
        })
    }
}

/// Outbound path to the one client session that owns a request. Pushing to a
/// closed session is a silent no-op.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn push(&self, event: ServerEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    EmptyResult,
    Transport(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::EmptyResult => f.write_str("empty_result"),
            FallbackReason::Transport(err) => write!(f, "transport: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed {
        text: String,
        reasoning: Vec<String>,
        upstream_session_id: Option<String>,
    },
    Fallback(FallbackReason),
}

/// Drives one reconciler over an upstream byte stream until a final event,
/// stream exhaustion, or a transport error.
pub async fn reconcile_stream<S, B, E>(
    mut stream: S,
    mut reconciler: Reconciler,
    store: &dyn SessionStore,
    sink: &dyn DeliverySink,
) -> ReconcileOutcome
where
    S: Stream<Item = Result<B, E>> + Unpin + Send,
    B: AsRef<[u8]> + Send,
    E: fmt::Display + Send,
{
    let mut decoder = EventLineDecoder::default();
    let mut final_seen = false;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(
                    event = "upstream_read_error",
                    message_id = %reconciler.scope().message_id,
                    error = %err
                );
                return ReconcileOutcome::Fallback(FallbackReason::Transport(err.to_string()));
            }
        };
        let report = decoder.push_chunk(chunk.as_ref());
        if apply_report(report, &mut reconciler, store, sink).await {
            final_seen = true;
            break;
        }
    }
    drop(stream);

    if !final_seen {
        let report = decoder.finish();
        apply_report(report, &mut reconciler, store, sink).await;
        tracing::info!(
            event = "upstream_exhausted",
            message_id = %reconciler.scope().message_id,
            fragments = reconciler.fragments_merged()
        );
    }

    match reconciler.finalize() {
        Finalization::Answer {
            update,
            text,
            reasoning,
        } => {
            sink.push(update).await;
            let scope = reconciler.scope();
            if let Err(err) = store.finalize_answer(&scope.message_id, &text, &reasoning) {
                tracing::error!(
                    event = "finalize_persist_failed",
                    message_id = %scope.message_id,
                    error = %err
                );
            }
            reconciler.finish();
            tracing::info!(
                event = "answer_finalized",
                message_id = %reconciler.scope().message_id,
                chars = text.chars().count(),
                reasoning = reasoning.len()
            );
            ReconcileOutcome::Completed {
                text,
                reasoning,
                upstream_session_id: reconciler.upstream_session().map(str::to_string),
            }
        }
        Finalization::Empty | Finalization::AlreadyFinalized => {
            ReconcileOutcome::Fallback(FallbackReason::EmptyResult)
        }
    }
}

/// Returns true once a final event has been applied.
async fn apply_report(
    report: LineReport,
    reconciler: &mut Reconciler,
    store: &dyn SessionStore,
    sink: &dyn DeliverySink,
) -> bool {
    for err in report.errors {
        tracing::warn!(
            event = "upstream_line_dropped",
            message_id = %reconciler.scope().message_id,
            error = %err
        );
    }
    for payload in report.payloads {
        let fragment = match interpret_payload(&payload) {
            Ok(fragment) => fragment,
            Err(err) => {
                tracing::warn!(
                    event = "upstream_record_dropped",
                    message_id = %reconciler.scope().message_id,
                    error = %err
                );
                continue;
            }
        };
        let step = reconciler.apply(&fragment);
        if let Some(session) = step.new_upstream_session.as_deref() {
            let conversation_id = &reconciler.scope().conversation_id;
            match store.set_upstream_session_id(conversation_id, Some(session)) {
                Ok(()) => tracing::info!(
                    event = "upstream_session_learned",
                    conversation_id = %conversation_id,
                    upstream_session_id = session
                ),
                Err(err) => tracing::warn!(
                    event = "upstream_session_persist_failed",
                    conversation_id = %conversation_id,
                    error = %err
                ),
            }
        }
        if let Some(update) = step.update {
            sink.push(update).await;
        }
        if step.final_requested {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpret::TextMode;
    use chrono::TimeZone;

    fn scope() -> RequestScope {
        RequestScope {
            conversation_id: "c-1".to_string(),
            message_id: "m-1".to_string(),
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 10, 0, 0)
                .single()
                .expect("valid timestamp"),
            known_upstream_session: None,
        }
    }

    fn content(text: &str) -> Fragment {
        Fragment {
            text: text.to_string(),
            kind: EventKind::Content,
            mode: TextMode::Delta,
            upstream_session_id: None,
            source_event: "message".to_string(),
        }
    }

    fn update_content(step: &Step) -> Option<String> {
        match &step.update {
            Some(ServerEvent::StreamingMessage(view)) => Some(view.content.clone()),
            _ => None,
        }
    }

    #[test]
    fn merge_rule_cases() {
        let mut visible = String::new();
        assert_eq!(merge_fragment(&mut visible, "  Hello "), MergeOutcome::Extended);
        assert_eq!(visible, "Hello");
        assert_eq!(merge_fragment(&mut visible, "Hello"), MergeOutcome::Unchanged);
        assert_eq!(merge_fragment(&mut visible, "ell"), MergeOutcome::Unchanged);
        assert_eq!(
            merge_fragment(&mut visible, "Hello world"),
            MergeOutcome::Extended
        );
        assert_eq!(visible, "Hello world");
        assert_eq!(
            merge_fragment(&mut visible, "Oh. Hello world!"),
            MergeOutcome::Extended
        );
        assert_eq!(visible, "Hello world!");
        assert_eq!(
            merge_fragment(&mut visible, "<think>Hello world!"),
            MergeOutcome::Unchanged
        );
        assert_eq!(merge_fragment(&mut visible, "Next"), MergeOutcome::Appended);
        assert_eq!(visible, "Hello world! Next");
        assert_eq!(merge_fragment(&mut visible, "   "), MergeOutcome::Unchanged);
    }

    #[test]
    fn merge_is_idempotent_and_monotonic() {
        let inputs = [
            "alpha",
            "alpha beta",
            "gamma",
            "beta",
            "alpha beta gamma delta",
            "<think>x</think>",
            "zeta",
        ];
        let mut visible = String::new();
        for input in inputs {
            let before = visible.clone();
            merge_fragment(&mut visible, input);
            let once = visible.clone();
            merge_fragment(&mut visible, input);
            assert_eq!(visible, once, "reapplying {input:?} changed the text");
            assert!(
                visible.contains(&before),
                "{before:?} regressed to {visible:?}"
            );
        }
    }

    #[test]
    fn stripped_text_never_regresses_across_updates() {
        let mut reconciler = Reconciler::new(scope(), ReasoningExtractor::default());
        let complete = |text: &str| Fragment {
            mode: TextMode::Complete,
            ..content(text)
        };
        let fragments = [
            content("Hello world"),
            complete("<think>Hello world"),
            content("and <think"),
            complete("Hello world and <think>plan"),
            content("<think>aside</think>more"),
            complete("Intro. Hello world and <think more"),
        ];

        let extractor = ReasoningExtractor::default();
        let mut seen = String::new();
        for fragment in &fragments {
            let step = reconciler.apply(fragment);
            let stripped = extractor.extract(&reconciler.answer().visible_text).visible;
            assert!(
                stripped.contains(&seen),
                "{seen:?} regressed to {stripped:?} after {:?}",
                fragment.text
            );
            if let Some(pushed) = update_content(&step) {
                assert!(pushed.contains(&seen), "{seen:?} regressed to {pushed:?}");
                seen = pushed;
            }
            assert_eq!(reconciler.answer().last_emitted_text, seen);
        }
        assert!(seen.starts_with("Hello world"));

        match reconciler.finalize() {
            Finalization::Answer { text, .. } => assert!(text.contains(&seen)),
            other => panic!("pushed answer fell back: {other:?}"),
        }
    }

    #[test]
    fn think_prefixed_resend_does_not_blank_the_answer() {
        let mut reconciler = Reconciler::new(scope(), ReasoningExtractor::default());
        let first = reconciler.apply(&content("Hello world"));
        assert_eq!(update_content(&first).as_deref(), Some("Hello world"));

        let mut resend = content("<think>Hello world");
        resend.mode = TextMode::Complete;
        assert!(reconciler.apply(&resend).update.is_none());
        assert_eq!(reconciler.answer().visible_text, "Hello world");
        assert!(matches!(
            reconciler.finalize(),
            Finalization::Answer { ref text, .. } if text == "Hello world"
        ));
    }

    #[test]
    fn duplicate_fragment_does_not_push() {
        let mut reconciler = Reconciler::new(scope(), ReasoningExtractor::default());

        let first = reconciler.apply(&content("Hello"));
        assert_eq!(update_content(&first).as_deref(), Some("Hello"));

        let second = reconciler.apply(&content("Hello world"));
        assert_eq!(update_content(&second).as_deref(), Some("Hello world"));

        let third = reconciler.apply(&content("Hello world"));
        assert!(third.update.is_none());
        assert_eq!(reconciler.answer().visible_text, "Hello world");
        assert_eq!(reconciler.answer().last_emitted_text, "Hello world");
    }

    #[test]
    fn reasoning_is_stripped_from_updates() {
        let mut reconciler = Reconciler::new(scope(), ReasoningExtractor::default());

        let open = reconciler.apply(&content("<think>step1"));
        assert!(open.update.is_none(), "hidden reasoning alone is not visible");
        assert_eq!(
            reconciler.answer().open_reasoning_tail.as_deref(),
            Some("step1")
        );

        let step = reconciler.apply(&content("<think>step1</think>Answer A"));
        match step.update {
            Some(ServerEvent::StreamingMessage(view)) => {
                assert_eq!(view.content, "Answer A");
                assert_eq!(view.thinks, vec!["step1".to_string()]);
                assert!(view.is_streaming);
                assert_eq!(view.id, "m-1:answer");
            }
            other => panic!("unexpected update: {other:?}"),
        }
        assert_eq!(reconciler.answer().open_reasoning_tail, None);
    }

    #[test]
    fn session_ids_surface_once_even_without_text() {
        let mut reconciler = Reconciler::new(
            RequestScope {
                known_upstream_session: Some("up-old".to_string()),
                ..scope()
            },
            ReasoningExtractor::default(),
        );
        let mut lifecycle = content("");
        lifecycle.kind = EventKind::Lifecycle;
        lifecycle.upstream_session_id = Some("up-old".to_string());
        assert_eq!(reconciler.apply(&lifecycle).new_upstream_session, None);

        lifecycle.upstream_session_id = Some("up-new".to_string());
        assert_eq!(
            reconciler.apply(&lifecycle).new_upstream_session.as_deref(),
            Some("up-new")
        );
        assert_eq!(reconciler.apply(&lifecycle).new_upstream_session, None);
        assert_eq!(reconciler.upstream_session(), Some("up-new"));
    }

    #[test]
    fn final_event_merges_trailing_text_and_requests_finalize() {
        let mut reconciler = Reconciler::new(scope(), ReasoningExtractor::default());
        reconciler.apply(&content("Part one."));
        let mut last = content("Part two.");
        last.kind = EventKind::Final;
        let step = reconciler.apply(&last);
        assert!(step.final_requested);
        assert_eq!(update_content(&step).as_deref(), Some("Part one. Part two."));
    }

    #[test]
    fn finalize_pushes_unconditionally_and_only_once() {
        let mut reconciler = Reconciler::new(scope(), ReasoningExtractor::default());
        reconciler.apply(&content("<think>why</think>Because."));

        match reconciler.finalize() {
            Finalization::Answer {
                update,
                text,
                reasoning,
            } => {
                assert_eq!(text, "Because.");
                assert_eq!(reasoning, vec!["why".to_string()]);
                match update {
                    ServerEvent::StreamingMessage(view) => {
                        assert!(!view.is_streaming);
                        assert_eq!(view.content, "Because.");
                    }
                    other => panic!("unexpected update: {other:?}"),
                }
            }
            other => panic!("unexpected finalization: {other:?}"),
        }
        assert_eq!(reconciler.state(), ReconcileState::Finalizing);
        assert!(reconciler.answer().is_final);
        reconciler.finish();
        assert_eq!(reconciler.state(), ReconcileState::Done);
        assert_eq!(reconciler.finalize(), Finalization::AlreadyFinalized);
        assert!(reconciler.apply(&content("late")).update.is_none());
    }

    #[test]
    fn empty_answer_requires_fallback() {
        let mut reconciler = Reconciler::new(scope(), ReasoningExtractor::default());
        reconciler.apply(&content("<think>only thinking</think>"));
        assert_eq!(reconciler.finalize(), Finalization::Empty);
        assert_eq!(reconciler.state(), ReconcileState::Done);
    }
}
