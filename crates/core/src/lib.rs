//! Session orchestration for a push-to-talk voice assistant.
//!
//! The [`orchestrator::Orchestrator`] owns the conversation state and drives the
//! collaborators behind the [`audio::AudioIo`], [`transport::Transport`],
//! [`event_source::EventSource`] and [`tools::Tool`] traits.
pub mod audio;
pub mod error;
pub mod event_source;
pub mod orchestrator;
pub mod tools;
pub mod transport;

pub use orchestrator::{Mode, Orchestrator, OrchestratorConfig, SessionHandle, SessionSnapshot};

/// A normalized trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a turn when idle, end it when recording, barge in while the assistant talks.
    Toggle,
    /// End the current recording.
    Confirm,
}

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    User,
    Assistant,
}

/// A piece of transcript surfaced to observers of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub direction: Direction,
}

/// A function call issued by the backend, answered under the same `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}
