// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! lbp-core
//!
//! The stable contract for the LLM Backplane.

/// Backend, pool, and model catalog entities.
pub mod backend;
/// Chat roles and capability vocabulary shared by resolver/providers/clients.
pub mod capability;
/// Job and leased-job queue entities.
pub mod job;
/// Prefix-scoped key-value cache entries.
pub mod kv;
/// Reconciled per-backend runtime state.
pub mod llm_state;
/// Conversation stream entities: message indices and messages.
pub mod message;

pub use backend::{Backend, BackendKind, Model, Pool, PoolPurpose};
pub use capability::{Capability, ChatMessage, FinishReason, Role};
pub use job::{Job, LeasedJob};
pub use kv::KvEntry;
pub use llm_state::{LlmState, PulledModel, PulledModelStatus};
pub use message::{Message, MessageIndex};

/// Current contract version string, for wire messages and diagnostics.
pub const CONTRACT_VERSION: &str = "lbp/v0.1";
