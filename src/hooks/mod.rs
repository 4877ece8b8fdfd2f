//! Hook-driven learning.
//!
//! Streams of tool-failure, subagent-completion, and error events are
//! folded into durable experience and knowledge artifacts:
//!
//! - repeated tool failures become `tool-failure` case experiences
//! - subagent failures (and significant successes) are recorded
//! - error storms inside a time window become `error-pattern` experiences
//! - successful tool output is mined for knowledge when enabled
//!
//! Every created experience feeds an analysis counter that invokes the
//! librarian once it crosses the configured threshold.

mod events;
mod extraction;
mod learning;

pub use events::{
    ErrorNotificationEvent, HookEvent, SubagentCompletionEvent, ToolFailureEvent, ToolSuccessEvent,
};
pub use extraction::{extract_knowledge, KnowledgeCandidate};
pub use learning::LearningService;
