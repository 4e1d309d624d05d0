// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, StreamEvent};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Contract between the coordination core and one model backend.
///
/// A backend owns only the wire format: it turns a [`CompletionRequest`]
/// into a stream of typed chunks and classifies its transport errors into
/// [`crate::BackendErrorKind`].  It never makes policy decisions; restarts,
/// injection, and retries all live upstream.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend driver name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users and in display names.
    fn model_name(&self) -> &str;

    /// Start one streamed completion.
    ///
    /// Errors returned here (as opposed to [`StreamEvent::Error`] chunks)
    /// mean the call could not start at all.  A context-size failure must be
    /// reported as [`crate::BackendError::context_overflow`] either way so
    /// the runner can hand the turn to the compression adapter.
    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream>;

    /// Declared context window, when the backend knows it.
    fn context_window(&self) -> Option<u32> {
        None
    }

    /// Whether this backend accepts tool schemas at all.  Backends without
    /// tool support get the schema-free prompt rendering.
    fn supports_tools(&self) -> bool {
        true
    }
}
