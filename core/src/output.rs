//! Output pipeline: display truncation, artifact persistence, sweeps,
//! and the run-history log.

use crate::config::ARTIFACT_TTL;
use crate::config::HISTORY_TASK_PREFIX;
use crate::config::JSONL_CAP_BYTES;
use crate::result::ProgressSummary;
use crate::result::TruncationInfo;
use crate::result::TruncationReason;
use chrono::DateTime;
use chrono::Utc;
use overseer_common::append_jsonl_line;
use overseer_common::ensure_accessible_dir;
use overseer_common::write_json_atomic;
use overseer_protocol::ArtifactConfig;
use overseer_protocol::OutputLimits;
use overseer_protocol::TokenUsage;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::debug;
use tracing::warn;

/// Result of applying display limits to a run's output.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedOutput {
    pub text: String,
    pub info: Option<TruncationInfo>,
}

/// Apply byte/line limits to the final concatenated display output.
/// Whichever limit triggers first wins; the kept text is the head slice.
/// `saved_to` names the artifact holding the untruncated body and is
/// referenced by the appended marker.
pub fn truncate_display(
    text: &str,
    limits: OutputLimits,
    saved_to: Option<&Path>,
) -> TruncatedOutput {
    let mut reason = None;

    let mut head_end = text.len();
    if text.len() > limits.max_bytes {
        // Cut on a char boundary at or below the byte limit.
        let mut cut = limits.max_bytes;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        head_end = cut;
        reason = Some(TruncationReason::Bytes);
    }

    let head = &text[..head_end];
    let line_limited: Option<usize> = head
        .char_indices()
        .filter(|(_, c)| *c == '\n')
        .nth(limits.max_lines.saturating_sub(1))
        .map(|(i, _)| i);
    if let Some(cut) = line_limited
        && cut < head_end
    {
        head_end = cut;
        reason = Some(TruncationReason::Lines);
    }

    match reason {
        None => TruncatedOutput {
            text: text.to_string(),
            info: None,
        },
        Some(reason) => {
            let marker = match saved_to {
                Some(path) => format!("\n…truncated, see {}", path.display()),
                None => "\n…truncated".to_string(),
            };
            TruncatedOutput {
                text: format!("{}{marker}", &text[..head_end]),
                info: Some(TruncationInfo {
                    was_truncated: true,
                    reason,
                    saved_to_path: saved_to.map(Path::to_path_buf),
                }),
            }
        }
    }
}

/// Metadata document persisted next to each run's input/output pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub agent: String,
    pub model: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub usage: TokenUsage,
    pub skills: Vec<String>,
}

/// Writes the per-run artifact set under a single directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
    run_id: String,
    config: ArtifactConfig,
}

impl ArtifactWriter {
    pub fn new(dir: PathBuf, run_id: impl Into<String>, config: ArtifactConfig) -> Self {
        Self {
            dir,
            run_id: run_id.into(),
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub const fn config(&self) -> ArtifactConfig {
        self.config
    }

    fn stem(&self, agent: &str, index: Option<usize>) -> String {
        match index {
            Some(i) => format!("{}_{agent}_{i}", self.run_id),
            None => format!("{}_{agent}", self.run_id),
        }
    }

    /// Path the full output body will occupy, usable before the write
    /// happens (the truncation marker needs it).
    pub fn output_path(&self, agent: &str, index: Option<usize>) -> PathBuf {
        self.dir.join(format!("{}_output.md", self.stem(agent, index)))
    }

    /// Persist input, output, and metadata. Returns the written paths.
    pub fn write(
        &self,
        agent: &str,
        index: Option<usize>,
        task: &str,
        output: &str,
        meta: &ArtifactMeta,
    ) -> io::Result<Vec<PathBuf>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        ensure_accessible_dir(&self.dir)?;
        let stem = self.stem(agent, index);
        let input_path = self.dir.join(format!("{stem}_input.md"));
        let output_path = self.dir.join(format!("{stem}_output.md"));
        let meta_path = self.dir.join(format!("{stem}_meta.json"));

        fs::write(&input_path, task)?;
        fs::write(&output_path, output)?;
        write_json_atomic(&meta_path, meta)?;
        Ok(vec![input_path, output_path, meta_path])
    }

    /// Open the opt-in raw JSONL sink; `None` when not opted in.
    pub fn jsonl_sink(&self, agent: &str, index: Option<usize>) -> Option<JsonlSink> {
        if !(self.config.enabled && self.config.jsonl) {
            return None;
        }
        if ensure_accessible_dir(&self.dir).is_err() {
            return None;
        }
        let path = self
            .dir
            .join(format!("{}_events.jsonl", self.stem(agent, index)));
        match fs::File::create(&path) {
            Ok(file) => Some(JsonlSink {
                file,
                written: 0,
                capped: false,
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open jsonl artifact");
                None
            }
        }
    }
}

/// Size-capped sink for the raw event stream.
#[derive(Debug)]
pub struct JsonlSink {
    file: fs::File,
    written: u64,
    capped: bool,
}

impl JsonlSink {
    pub fn write_line(&mut self, line: &str) {
        if self.capped {
            return;
        }
        let bytes = line.len() as u64 + 1;
        if self.written + bytes > JSONL_CAP_BYTES {
            self.capped = true;
            let _ = self.file.write_all("…jsonl capped at 50 MB\n".as_bytes());
            return;
        }
        if self.file.write_all(line.as_bytes()).is_ok() && self.file.write_all(b"\n").is_ok() {
            self.written += bytes;
        }
    }
}

/// One line of the session run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub ts: DateTime<Utc>,
    pub agent: String,
    pub task_prefix: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Append a run-history entry to `history.jsonl` in the session dir.
/// Best-effort: history failures never fail the run.
pub fn append_history(
    session_dir: Option<&Path>,
    agent: &str,
    task: &str,
    exit_code: i32,
    summary: &ProgressSummary,
) {
    let Some(dir) = session_dir else {
        return;
    };
    let entry = HistoryEntry {
        ts: Utc::now(),
        agent: agent.to_string(),
        task_prefix: task.chars().take(HISTORY_TASK_PREFIX).collect(),
        exit_code,
        duration_ms: summary.duration_ms,
    };
    if ensure_accessible_dir(dir).is_err() {
        return;
    }
    if let Err(e) = append_jsonl_line(&dir.join("history.jsonl"), &entry) {
        debug!(error = %e, "failed to append run history");
    }
}

/// Remove subdirectories of `root` older than `ttl`. Returns how many
/// were removed. Used for chain dirs (24 h) and artifact dirs (7 d).
pub fn sweep_stale_dirs(root: &Path, ttl: std::time::Duration) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .is_some_and(|age| age > ttl);
        if stale {
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to sweep stale dir"),
            }
        }
    }
    removed
}

/// Sweep session artifact directories past the retention window.
pub fn sweep_stale_artifacts(session_dir: &Path) -> usize {
    sweep_stale_dirs(&session_dir.join("artifacts"), ARTIFACT_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limits(max_bytes: usize, max_lines: usize) -> OutputLimits {
        OutputLimits {
            max_bytes,
            max_lines,
        }
    }

    #[test]
    fn under_limits_passes_through() {
        let out = truncate_display("hello\nworld", limits(1024, 100), None);
        assert_eq!(out.text, "hello\nworld");
        assert!(out.info.is_none());
    }

    #[test]
    fn byte_limit_keeps_head_and_appends_marker() {
        let text = "a".repeat(100);
        let out = truncate_display(&text, limits(10, 100), Some(Path::new("/tmp/full.md")));
        assert!(out.text.starts_with(&"a".repeat(10)));
        assert!(out.text.contains("…truncated, see /tmp/full.md"));
        let info = out.info.unwrap();
        assert_eq!(info.reason, TruncationReason::Bytes);
        assert_eq!(info.saved_to_path, Some(PathBuf::from("/tmp/full.md")));
    }

    #[test]
    fn line_limit_triggers_before_byte_limit() {
        let text = "x\n".repeat(50);
        let out = truncate_display(&text, limits(1024, 3), None);
        let info = out.info.unwrap();
        assert_eq!(info.reason, TruncationReason::Lines);
        let body = out.text.split('…').next().unwrap();
        assert_eq!(body.lines().count(), 3);
    }

    #[test]
    fn byte_cut_lands_on_char_boundary() {
        let text = "é".repeat(40);
        let out = truncate_display(&text, limits(9, 100), None);
        // Never panics, and the body stays valid UTF-8 of ≤ 9 bytes.
        assert!(out.info.is_some());
    }

    #[test]
    fn artifact_writer_produces_triplet() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(
            dir.path().to_path_buf(),
            "run1",
            ArtifactConfig {
                enabled: true,
                jsonl: false,
            },
        );
        let meta = ArtifactMeta {
            agent: "scout".to_string(),
            model: "acme/fast-1".to_string(),
            exit_code: 0,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            usage: TokenUsage::default(),
            skills: vec![],
        };
        let paths = writer.write("scout", None, "the task", "the output", &meta).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(dir.path().join("run1_scout_input.md").exists());
        assert!(dir.path().join("run1_scout_output.md").exists());
        assert!(dir.path().join("run1_scout_meta.json").exists());
    }

    #[test]
    fn indexed_artifacts_include_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(
            dir.path().to_path_buf(),
            "run1",
            ArtifactConfig::default(),
        );
        assert!(
            writer
                .output_path("w", Some(2))
                .ends_with("run1_w_2_output.md")
        );
    }

    #[test]
    fn disabled_writer_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(
            dir.path().to_path_buf(),
            "run1",
            ArtifactConfig {
                enabled: false,
                jsonl: false,
            },
        );
        let meta = ArtifactMeta {
            agent: "scout".to_string(),
            model: "m".to_string(),
            exit_code: 0,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            usage: TokenUsage::default(),
            skills: vec![],
        };
        let paths = writer.write("scout", None, "t", "o", &meta).unwrap();
        assert!(paths.is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn history_appends_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let long_task = "t".repeat(500);
        append_history(
            Some(dir.path()),
            "scout",
            &long_task,
            0,
            &ProgressSummary {
                tool_count: 1,
                tokens: 10,
                duration_ms: 42,
            },
        );
        let text = fs::read_to_string(dir.path().join("history.jsonl")).unwrap();
        let entry: HistoryEntry = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(entry.task_prefix.len(), HISTORY_TASK_PREFIX);
        assert_eq!(entry.agent, "scout");
    }

    #[test]
    fn sweep_removes_only_stale_dirs() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("old");
        let fresh = root.path().join("new");
        fs::create_dir(&stale).unwrap();
        fs::create_dir(&fresh).unwrap();
        // A zero TTL makes everything stale; sanity-check both removed.
        assert_eq!(sweep_stale_dirs(root.path(), std::time::Duration::ZERO), 2);
        fs::create_dir(&fresh).unwrap();
        assert_eq!(
            sweep_stale_dirs(root.path(), std::time::Duration::from_secs(3600)),
            0
        );
        assert!(fresh.exists());
    }
}
