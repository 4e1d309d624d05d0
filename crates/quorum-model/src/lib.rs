// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Backend adapter contract: streaming chat with typed chunks.
//!
//! Real wire-format adapters (Anthropic/OpenAI/Gemini HTTP drivers) are
//! supplied by the embedder; this crate defines the seam they implement and
//! ships deterministic mock backends for the test suite and the `mock`
//! config driver.

mod backend;
mod mock;
mod types;

pub use backend::{ChatBackend, ChunkStream};
pub use mock::{EchoBackend, ScriptedBackend, WorkflowEchoBackend};
pub use types::*;
