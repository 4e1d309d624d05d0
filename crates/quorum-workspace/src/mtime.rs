// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// `(path → mtime)` index over a set of directory roots.
///
/// Captured just before write access is granted; diffed against a fresh
/// capture after the write window closes to report which files the winner
/// actually touched.
#[derive(Debug, Clone, Default)]
pub struct MtimeIndex {
    entries: HashMap<PathBuf, SystemTime>,
}

impl MtimeIndex {
    pub fn capture(roots: &[PathBuf]) -> Self {
        let mut entries = HashMap::new();
        for root in roots {
            for entry in walkdir::WalkDir::new(root)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(mtime) = meta.modified() {
                        entries.insert(entry.path().to_path_buf(), mtime);
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Files in `current` that are new, or whose mtime advanced, relative
    /// to this (earlier) index.  Sorted for deterministic reports.
    pub fn diff_against(&self, current: &MtimeIndex) -> Vec<PathBuf> {
        let mut written: Vec<PathBuf> = current
            .entries
            .iter()
            .filter(|(path, mtime)| match self.entries.get(*path) {
                None => true,
                Some(prior) => *mtime > prior,
            })
            .map(|(path, _)| path.clone())
            .collect();
        written.sort();
        written
    }
}

/// How many written files are listed inline in the final answer before the
/// report moves to a side file.
const INLINE_FILE_LIMIT: usize = 5;

/// The write report attached to the final answer.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub files: Vec<PathBuf>,
}

impl WriteReport {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    pub fn is_inline(&self) -> bool {
        self.files.len() <= INLINE_FILE_LIMIT
    }

    /// Markdown rendering of the report.  Inline form lists every file;
    /// the side-file form is the full list written next to the answer with
    /// a one-line pointer embedded instead.
    pub fn render(&self) -> String {
        if self.files.is_empty() {
            return "No context files were modified.".to_string();
        }
        let mut out = format!("Files modified ({}):\n", self.files.len());
        for f in &self.files {
            out.push_str(&format!("- {}\n", f.display()));
        }
        out
    }

    /// Inline summary when small, else `(summary_line, full_report)` where
    /// the full report belongs in a side file.
    pub fn render_for_answer(&self, side_file_name: &str) -> (String, Option<String>) {
        if self.is_inline() {
            (self.render(), None)
        } else {
            (
                format!(
                    "{} files modified; full list in {side_file_name}.",
                    self.files.len()
                ),
                Some(self.render()),
            )
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
