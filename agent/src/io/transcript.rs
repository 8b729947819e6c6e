//! Per-phase transcripts under `.setup-agent/transcripts/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{Message, Usage};

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptMeta {
    pub phase: String,
    pub mode: String,
    pub iterations: u32,
    pub usage: Usage,
    /// `completed`, `failed` or `cancelled`.
    pub outcome: String,
    pub error: Option<String>,
    pub started_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TranscriptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub system_path: PathBuf,
    pub messages_path: PathBuf,
}

impl TranscriptPaths {
    /// `<transcripts>/<nn>-<phase>`, numbered by pipeline position.
    pub fn new(transcripts_dir: &Path, index: usize, phase_id: &str) -> Self {
        let dir = transcripts_dir.join(format!("{index:02}-{phase_id}"));
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            system_path: dir.join("system.md"),
            messages_path: dir.join("messages.json"),
        }
    }
}

pub struct TranscriptWriteRequest<'a> {
    pub transcripts_dir: &'a Path,
    pub index: usize,
    pub meta: &'a TranscriptMeta,
    pub system: &'a str,
    pub messages: &'a [Message],
}

/// Write one phase attempt. A retried phase overwrites the earlier attempt.
pub fn write_transcript(request: &TranscriptWriteRequest<'_>) -> Result<TranscriptPaths> {
    let paths = TranscriptPaths::new(request.transcripts_dir, request.index, &request.meta.phase);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create transcript dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    write_text(&paths.system_path, request.system)?;
    write_json(&paths.messages_path, &request.messages)?;
    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ContentBlock;

    #[test]
    fn transcript_paths_are_numbered() {
        let paths = TranscriptPaths::new(Path::new("/p/.setup-agent/transcripts"), 3, "instrument");
        assert!(paths.dir.ends_with("transcripts/03-instrument"));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.messages_path.ends_with("messages.json"));
    }

    #[test]
    fn writes_meta_system_and_messages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = TranscriptMeta {
            phase: "discover".to_string(),
            mode: "setup".to_string(),
            iterations: 2,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            outcome: "completed".to_string(),
            error: None,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            duration_ms: 42,
        };
        let messages = vec![
            Message::user_text("begin"),
            Message::assistant(vec![ContentBlock::text("done")]),
        ];
        let paths = write_transcript(&TranscriptWriteRequest {
            transcripts_dir: temp.path(),
            index: 1,
            meta: &meta,
            system: "system prompt",
            messages: &messages,
        })
        .expect("write transcript");

        let meta_json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta")).expect("json");
        assert_eq!(meta_json["iterations"], 2);
        assert_eq!(meta_json["usage"]["input_tokens"], 10);
        let messages_json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.messages_path).expect("messages"))
                .expect("json");
        assert_eq!(messages_json[1]["content"][0]["text"], "done");
        assert_eq!(fs::read_to_string(&paths.system_path).expect("system"), "system prompt");
    }
}
