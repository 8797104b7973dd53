//! Session transcript extraction and delta tracking.
//!
//! Transcripts are `.jsonl` files, one JSON object per line. Only
//! `{"type":"message"}` lines with a user or assistant role contribute text;
//! tool calls, system events, and malformed lines are skipped. Extracted text
//! is labeled `User:` / `Assistant:` and whitespace-normalized so chunk hashes
//! stay stable across formatting-only rewrites.
//!
//! Re-embedding every transcript on each append would dominate sync cost, so
//! [`SessionTracker`] accumulates how much transcript data changed since the
//! last session sync and the coordinator only marks sessions dirty past the
//! configured byte/message thresholds.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::chunker::sha256_hex;
use crate::config::SyncConfig;
use crate::index::types::FileEntry;

#[derive(Deserialize)]
struct TranscriptLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<TranscriptMessage>,
}

#[derive(Deserialize)]
struct TranscriptMessage {
    role: String,
    #[serde(default)]
    content: serde_json::Value,
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pull plain text out of a message `content` value, which is either a string
/// or an array of content blocks of which only `{"type":"text"}` carry text.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Convert raw transcript JSONL into labeled plain text, one message per line.
pub fn extract_transcript(raw: &str) -> String {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<TranscriptLine>(line) else {
            continue;
        };
        if parsed.kind != "message" {
            continue;
        }
        let Some(message) = parsed.message else {
            continue;
        };
        let label = match message.role.as_str() {
            "user" => "User",
            "assistant" => "Assistant",
            _ => continue,
        };
        let text = normalize_whitespace(&content_text(&message.content));
        if text.is_empty() {
            continue;
        }
        out.push(format!("{label}: {text}"));
    }
    out.join("\n")
}

/// Scan a sessions directory for transcripts, extracting their text up front.
/// Transcripts whose extraction yields nothing are skipped entirely.
pub fn list_session_files(dir: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    if !dir.is_dir() {
        return Ok(entries);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read sessions directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl") && p.is_file())
        .collect();
    paths.sort();

    for abs_path in paths {
        let metadata = std::fs::metadata(&abs_path)?;
        let raw = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("failed to read transcript {}", abs_path.display()))?;
        let content = extract_transcript(&raw);
        if content.is_empty() {
            continue;
        }
        let name = abs_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        entries.push(FileEntry {
            path: format!("sessions/{name}"),
            abs_path,
            mtime_ms,
            size: metadata.len(),
            hash: sha256_hex(&content),
            content: Some(content),
        });
    }
    Ok(entries)
}

/// Accumulates transcript churn between session syncs.
#[derive(Debug, Default)]
pub struct SessionTracker {
    pending_bytes: u64,
    pending_messages: u64,
    known_sizes: HashMap<PathBuf, u64>,
}

impl SessionTracker {
    /// Record an append to `path`. Reads only the appended suffix to count new
    /// messages; a truncated or rewritten file counts as fully new.
    pub fn note_update(&mut self, path: &Path) {
        let Ok(metadata) = std::fs::metadata(path) else {
            return;
        };
        let size = metadata.len();
        let previous = self.known_sizes.insert(path.to_path_buf(), size);
        let offset = match previous {
            Some(prev) if prev <= size => prev,
            _ => 0,
        };
        let added = size.saturating_sub(offset);
        if added == 0 {
            return;
        }
        self.pending_bytes += added;
        self.pending_messages += count_messages_from(path, offset);
        debug!(
            path = %path.display(),
            pending_bytes = self.pending_bytes,
            pending_messages = self.pending_messages,
            "transcript delta recorded"
        );
    }

    /// Whether accumulated churn crosses either configured threshold.
    pub fn should_sync(&self, config: &SyncConfig) -> bool {
        (config.session_delta_bytes > 0 && self.pending_bytes >= config.session_delta_bytes)
            || (config.session_delta_messages > 0
                && self.pending_messages >= config.session_delta_messages)
    }

    /// Called after a session sync: deltas are accounted for.
    pub fn reset(&mut self) {
        self.pending_bytes = 0;
        self.pending_messages = 0;
    }

    #[cfg(test)]
    pub fn pending(&self) -> (u64, u64) {
        (self.pending_bytes, self.pending_messages)
    }
}

fn count_messages_from(path: &Path, offset: u64) -> u64 {
    use std::io::{Read, Seek, SeekFrom};
    let Ok(mut file) = std::fs::File::open(path) else {
        return 0;
    };
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return 0;
    }
    let mut tail = String::new();
    if file.read_to_string(&mut tail).is_err() {
        return 0;
    }
    tail.lines()
        .filter(|l| {
            serde_json::from_str::<TranscriptLine>(l.trim())
                .map(|p| p.kind == "message")
                .unwrap_or(false)
        })
        .count() as u64
}
