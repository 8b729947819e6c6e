//! Canonical locations under `.setup-agent/` and the shared atomic writer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// All agent-owned paths for a project root.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub root: PathBuf,
    pub agent_dir: PathBuf,
    pub config_path: PathBuf,
    pub progress_path: PathBuf,
    pub transcripts_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let agent_dir = root.join(".setup-agent");
        Self {
            root: root.clone(),
            agent_dir: agent_dir.clone(),
            config_path: agent_dir.join("config.toml"),
            progress_path: agent_dir.join("progress.md"),
            transcripts_dir: agent_dir.join("transcripts"),
            gitignore_path: agent_dir.join(".gitignore"),
        }
    }

    /// Create `.setup-agent/` with a gitignore covering transcripts.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.agent_dir)
            .with_context(|| format!("create {}", self.agent_dir.display()))?;
        if !self.gitignore_path.exists() {
            write_atomic(&self.gitignore_path, "transcripts/\n")?;
        }
        Ok(())
    }
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_dir_and_gitignore() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AgentPaths::new(temp.path());
        paths.ensure().expect("ensure");
        assert!(paths.agent_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            "transcripts/\n"
        );
        assert!(paths.progress_path.ends_with(".setup-agent/progress.md"));
    }

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/out.md");
        write_atomic(&path, "one").expect("first");
        write_atomic(&path, "two").expect("second");
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        assert!(!temp.path().join("nested/out.md.tmp").exists());
    }
}
