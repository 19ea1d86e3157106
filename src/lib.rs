//! A language model navigates a live web page, one tool call per turn, until
//! it can answer an extraction goal.

pub mod agent;
pub mod brain;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod dom;
pub mod hands;
pub mod journal;
pub mod policy;
pub mod screenshots;
pub mod server;
pub mod session;
pub mod store;
pub mod tools;
pub mod types;

pub use agent::{Agent, AgentSettings, ExtractionRequest, JobFailure, JobOutcome, RunError};
pub use types::{Job, JobStatus, Message, MessageKind, Role, ToolCall, ToolName};
