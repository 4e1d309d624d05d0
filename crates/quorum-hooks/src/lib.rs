// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The extension seam around tool execution.
//!
//! `PreToolUse` hooks may deny a call, rewrite its input, or request
//! interactive approval; `PostToolUse` hooks may inject content back into
//! the conversation.  Handlers run outside core locks on a copy of the tool
//! event, with a per-hook timeout: timeouts and runtime failures fail open,
//! spawn failures fail closed.

mod event;
mod external;
mod registry;

pub use event::{
    HookDecision, HookError, HookEvent, HookEventKind, HookResult, Injection, InjectionStrategy,
};
pub use external::ExternalCommandHook;
pub use registry::{HookHandler, HookRegistry, PostToolOutcome, PreToolOutcome, RegisteredHook};
