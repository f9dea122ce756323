//! Message dispatch: everything between an inbound channel message and the
//! chunks posted back in reply.

pub mod chunker;
pub mod classifier;
pub mod context;
pub mod delivery;
pub mod error;
pub mod guard;
pub mod pipeline;

pub use chunker::{chunk_text, split_message, Chunk};
pub use classifier::{mention_token, should_process, ClassifierMode, MessageClassifier};
pub use context::{
    build_prompt, ContextAssembler, ConversationEntry, ConversationRecord, HistoryStrategy,
};
pub use delivery::DeliveryScheduler;
pub use error::DispatchError;
pub use guard::{InFlightTicket, SingleFlightGuard};
pub use pipeline::{DispatchPipeline, DispatchReport, Stage};
