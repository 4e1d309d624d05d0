// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Number of leading characters kept in enforcement previews.
const PREVIEW_CHARS: usize = 500;

/// Captured view of a streaming buffer at an enforcement or recovery point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferCapture {
    /// First 500 characters.
    pub preview: String,
    /// Full character count at capture time.
    pub chars: usize,
}

/// Per-agent append-only capture of in-flight streamed content: text,
/// reasoning blocks, and tool calls in progress.
///
/// The buffer exists for recovery.  On a context-length failure it is handed
/// to the compression adapter; on an enforcement restart its preview and
/// size are recorded before the turn is discarded.  It is cleared on turn
/// completion or acknowledged restart, but preserved while a compression
/// retry is in flight.
#[derive(Debug, Default)]
pub struct StreamingBuffer {
    content: String,
    compression_retry: bool,
}

impl StreamingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_text(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    pub fn append_reasoning(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    pub fn append_tool_call(&mut self, name: &str, args_fragment: &str) {
        if !name.is_empty() {
            self.content.push_str(&format!("\n[tool call: {name}] "));
        }
        self.content.push_str(args_fragment);
    }

    pub fn chars(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn contents(&self) -> &str {
        &self.content
    }

    pub fn capture(&self) -> BufferCapture {
        BufferCapture {
            preview: self.content.chars().take(PREVIEW_CHARS).collect(),
            chars: self.chars(),
        }
    }

    /// Mark that a compression retry is in flight; [`clear`] becomes a
    /// no-op until the retried call succeeds.
    pub fn set_compression_retry(&mut self, active: bool) {
        self.compression_retry = active;
    }

    pub fn compression_retry(&self) -> bool {
        self.compression_retry
    }

    /// Clear on turn completion or acknowledged restart.  Suppressed during
    /// compression retries so in-flight work survives into the retried call.
    pub fn clear(&mut self) {
        if !self.compression_retry {
            self.content.clear();
        }
    }

    /// Unconditional clear, used once a compression retry has succeeded and
    /// the buffered content is safely part of the rebuilt conversation.
    pub fn force_clear(&mut self) {
        self.content.clear();
        self.compression_retry = false;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_limits_preview_to_500_chars() {
        let mut b = StreamingBuffer::new();
        b.append_text(&"x".repeat(1200));
        let cap = b.capture();
        assert_eq!(cap.preview.len(), 500);
        assert_eq!(cap.chars, 1200);
    }

    #[test]
    fn capture_of_short_buffer_is_whole() {
        let mut b = StreamingBuffer::new();
        b.append_text("brief");
        let cap = b.capture();
        assert_eq!(cap.preview, "brief");
        assert_eq!(cap.chars, 5);
    }

    #[test]
    fn tool_calls_are_labeled_in_the_buffer() {
        let mut b = StreamingBuffer::new();
        b.append_tool_call("grep", r#"{"pattern":"#);
        b.append_tool_call("", r#""x"}"#);
        assert!(b.contents().contains("[tool call: grep]"));
        assert!(b.contents().contains(r#""x"}"#));
    }

    #[test]
    fn clear_is_suppressed_during_compression_retry() {
        let mut b = StreamingBuffer::new();
        b.append_text("in-flight work");
        b.set_compression_retry(true);
        b.clear();
        assert_eq!(b.contents(), "in-flight work");
        b.force_clear();
        assert!(b.is_empty());
        assert!(!b.compression_retry());
    }

    #[test]
    fn clear_works_normally_otherwise() {
        let mut b = StreamingBuffer::new();
        b.append_text("done");
        b.clear();
        assert!(b.is_empty());
    }
}
