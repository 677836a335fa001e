pub mod interpret;
pub mod reasoning;
pub mod reconcile;
pub mod store;
pub mod stream;
pub mod wire;

pub use interpret::{interpret_payload, EventKind, Fragment, InterpretError, TextMode};
pub use reasoning::{extract_reasoning, Extraction, ReasoningExtractor, ReasoningMarkers};
pub use reconcile::{
    merge_fragment, reconcile_stream, AccumulatedAnswer, DeliverySink, FallbackReason,
    Finalization, MergeOutcome, ReconcileOutcome, ReconcileState, Reconciler, RequestScope, Step,
};
pub use store::{ConversationRecord, MessageRecord, SessionStore, StoreError};
pub use stream::{EventLineDecoder, LineError, LineReport};
pub use wire::{ClientRequest, MessageRole, MessageView, ServerEvent, WireError};
