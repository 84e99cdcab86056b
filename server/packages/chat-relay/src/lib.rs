//! OpenAI-compatible relay that serializes chat completions onto a single
//! browser-automated chat session.

pub mod auth;
pub mod automation;
pub mod cli;
pub mod completion;
pub mod config;
pub mod delta;
pub mod liveness;
pub mod monitor;
pub mod openai;
pub mod processor;
pub mod prompt;
pub mod queue;
pub mod relay;
pub mod router;
pub mod slot;
pub mod source;
pub mod sse;
pub mod state;
pub mod usage;
pub mod worker;
