// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

/// Results whose estimated token count exceeds this are written to disk and
/// replaced in-context by a reference message.
pub const EVICTION_THRESHOLD_TOKENS: usize = 20_000;

/// Size of the preview embedded in the reference message.
const PREVIEW_TOKENS: usize = 2_000;

/// 4-chars-per-token estimate, shared with the rest of the system.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// An evicted tool result: the on-disk file plus the in-context reference.
#[derive(Debug, Clone)]
pub struct EvictedResult {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub reference_message: String,
}

/// Write `content` to `.tool_results/<tool>_<ts>_<hash>.txt` under
/// `agent_dir` when it exceeds the eviction threshold.
///
/// Returns `None` when the result is small enough to stay in context.
/// Eviction files are per-agent, so concurrent runners never contend on
/// the same directory.
pub fn evict_if_large(
    agent_dir: &Path,
    tool_name: &str,
    content: &str,
) -> std::io::Result<Option<EvictedResult>> {
    if estimate_tokens(content) <= EVICTION_THRESHOLD_TOKENS {
        return Ok(None);
    }

    let dir = agent_dir.join(".tool_results");
    std::fs::create_dir_all(&dir)?;

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = hex::encode(&hasher.finalize()[..4]);
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    // Namespaced tool names contain `__`; keep them as-is, they are
    // filesystem-safe.
    let path = dir.join(format!("{tool_name}_{ts}_{hash}.txt"));
    std::fs::write(&path, content)?;

    let total_bytes = content.len() as u64;
    let preview = preview_slice(content, PREVIEW_TOKENS * 4);
    let reference_message = format!(
        "[Tool result evicted to disk: too large for context]\n\
         file: {path}\n\
         bytes: 0..{total_bytes} ({total_bytes} bytes total, ~{tokens} tokens)\n\
         To retrieve a portion, read the file with explicit byte offsets \
         (e.g. start=0 end=65536); slices concatenate to the original.\n\
         --- preview (first ~{preview_tokens} tokens) ---\n\
         {preview}",
        path = path.display(),
        tokens = estimate_tokens(content),
        preview_tokens = PREVIEW_TOKENS,
    );

    debug!(
        tool = tool_name,
        bytes = total_bytes,
        path = %path.display(),
        "large tool result evicted"
    );

    Ok(Some(EvictedResult {
        path,
        total_bytes,
        reference_message,
    }))
}

/// Read the byte range `[start, end)` of an evicted result.
///
/// Ranges are clamped to the file length.  Adjacent ranges concatenate to
/// the original content exactly, which is what makes re-reading an evicted
/// reference idempotent.
pub fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = start.min(len);
    let end = end.min(len);
    if end <= start {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// First `max_bytes` of `s`, cut back to a char boundary.
fn preview_slice(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
