//! Capture logger: atomic per-request JSON capture files with session-based
//! retention. Per spec.md §4.6.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timings {
    pub send_ms: u64,
    pub wait_ms: u64,
    pub receive_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureData {
    pub timestamp: String,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub method: String,
    pub path: String,
    pub source: Option<String>,
    pub provider: String,
    #[serde(rename = "apiFormat")]
    pub api_format: String,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    #[serde(rename = "requestHeaders")]
    pub request_headers: std::collections::BTreeMap<String, String>,
    #[serde(rename = "requestBody")]
    pub request_body: Option<serde_json::Value>,
    #[serde(rename = "requestBytes")]
    pub request_bytes: usize,
    #[serde(rename = "responseStatus")]
    pub response_status: u16,
    #[serde(rename = "responseHeaders")]
    pub response_headers: std::collections::BTreeMap<String, String>,
    #[serde(rename = "responseBody")]
    pub response_body: String,
    #[serde(rename = "responseIsStreaming")]
    pub response_is_streaming: bool,
    #[serde(rename = "responseBytes")]
    pub response_bytes: usize,
    pub timings: Timings,
}

/// Replaces any character outside `[A-Za-z0-9_-]` with `_`.
fn sanitize_source(source: &str) -> String {
    source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct CaptureLogger {
    dir: PathBuf,
    max_sessions: usize,
    seq: AtomicU64,
}

impl CaptureLogger {
    /// Creates the logger, ensuring `dir` exists, and performs an initial
    /// retention scan if `max_sessions > 0`.
    pub fn new(dir: PathBuf, max_sessions: usize) -> Self {
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::error!(error = %err, path = %dir.display(), "capture logger failed to create directory");
        }

        let logger = Self {
            dir,
            max_sessions,
            seq: AtomicU64::new(0),
        };

        if max_sessions > 0 {
            logger.prune_on_startup();
        }

        logger
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn filename(&self, source: Option<&str>, session_id: Option<&str>, wall_ms: u128) -> String {
        let source_part = sanitize_source(source.unwrap_or("unknown"));
        let seq = self.next_seq();
        match session_id {
            Some(session) => format!("{source_part}_{session}_{wall_ms}-{seq:06}.json"),
            None => format!("{source_part}_{wall_ms}-{seq:06}.json"),
        }
    }

    /// Writes `capture` atomically: serialize to `<final>.tmp`, then rename
    /// to `<final>`. Failures are logged, never propagated to the caller's
    /// client-facing path.
    pub fn write(&self, capture: &CaptureData, wall_ms: u128) {
        let filename = self.filename(
            capture.source.as_deref(),
            capture.session_id.as_deref(),
            wall_ms,
        );
        let final_path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{filename}.tmp"));

        let serialized = match serde_json::to_vec_pretty(capture) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "capture serialization failed");
                return;
            }
        };

        if let Err(err) = fs::write(&tmp_path, &serialized) {
            tracing::error!(error = %err, path = %tmp_path.display(), "capture write failed");
            let _ = fs::remove_file(&tmp_path);
            return;
        }

        if let Err(err) = fs::rename(&tmp_path, &final_path) {
            tracing::error!(error = %err, path = %final_path.display(), "capture rename failed");
            let _ = fs::remove_file(&tmp_path);
        }
    }

    fn prune_on_startup(&self) {
        if let Err(err) = self.prune() {
            tracing::warn!(error = %err, "capture retention scan failed");
        }
    }

    /// Groups existing capture files by their 8-hex-char session segment,
    /// keeps the `max_sessions` most-recent groups (by max wall-ms), and
    /// unlinks every file belonging to an older group. Files with no
    /// session segment are never pruned.
    fn prune(&self) -> std::io::Result<()> {
        let entries = fs::read_dir(&self.dir)?;
        // session_id -> (max_wall_ms, file paths)
        let mut sessions: HashMap<String, (u128, Vec<PathBuf>)> = HashMap::new();

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let Some((session_id, wall_ms)) = parse_capture_filename(name) else {
                continue;
            };
            let Some(session_id) = session_id else {
                continue;
            };

            let group = sessions.entry(session_id).or_insert((0, Vec::new()));
            group.0 = group.0.max(wall_ms);
            group.1.push(path);
        }

        if sessions.len() <= self.max_sessions {
            return Ok(());
        }

        let mut by_recency: Vec<(String, u128, Vec<PathBuf>)> = sessions
            .into_iter()
            .map(|(session, (max_ms, paths))| (session, max_ms, paths))
            .collect();
        by_recency.sort_by(|a, b| b.1.cmp(&a.1));

        for (_, _, paths) in by_recency.into_iter().skip(self.max_sessions) {
            for path in paths {
                if let Err(err) = fs::remove_file(&path) {
                    tracing::warn!(error = %err, path = %path.display(), "capture retention unlink failed");
                }
            }
        }

        Ok(())
    }
}

/// Parses `{source}_{sessionId}_{wallMs}-{seq}.json` or
/// `{source}_{wallMs}-{seq}.json`, returning `(session_id, wall_ms)`.
fn parse_capture_filename(name: &str) -> Option<(Option<String>, u128)> {
    let stem = name.strip_suffix(".json")?;
    let (body, _seq) = stem.rsplit_once('-')?;
    let parts: Vec<&str> = body.rsplit('_').collect();
    // parts[0] is wall_ms; parts[1], if it looks like an 8-hex session id, is the session.
    let wall_ms_str = parts.first()?;
    let wall_ms: u128 = wall_ms_str.parse().ok()?;

    let session_id = parts
        .get(1)
        .filter(|s| s.len() == 8 && s.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|s| s.to_string());

    Some((session_id, wall_ms))
}
