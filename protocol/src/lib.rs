//! Shared vocabulary between the agent subprocess, the per-session pipeline,
//! and the chat front-ends: the agent's wire events, the message operations
//! produced by the transform layer, and the typed events a session's message
//! manager emits back to its owner.

pub mod agent;
pub mod manager_event;
pub mod operation;
