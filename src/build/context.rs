// Build context staging
//
// Walks the context directory, drops excluded paths, and hashes what is left
// so an unchanged context always yields the same asset tag.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::resources::wildcard;

/// A file that made it into the build context
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContextFile {
    /// Path relative to the context root, `/`-separated
    pub relative: String,
    pub absolute: PathBuf,
}

/// True if `relative` (a `/`-separated path) is excluded by any pattern.
///
/// A pattern excludes a path when it matches the whole relative path, any
/// single component of it, or a leading directory of it.
pub fn is_excluded(relative: &str, excludes: &[String]) -> bool {
    excludes.iter().any(|pattern| {
        let pattern = pattern.trim_end_matches('/');
        if pattern.is_empty() {
            return false;
        }
        if wildcard::matches(pattern, relative) {
            return true;
        }
        if relative.split('/').any(|part| wildcard::matches(pattern, part)) {
            return true;
        }
        let mut prefix = String::new();
        for part in relative.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if wildcard::matches(pattern, &prefix) {
                return true;
            }
        }
        false
    })
}

/// Every non-excluded regular file under `root`, sorted by relative path
pub fn collect_files(root: &Path, excludes: &[String]) -> Result<Vec<ContextFile>> {
    if !root.exists() {
        bail!("Build context '{}' does not exist", root.display());
    }
    if !root.is_dir() {
        bail!("Build context '{}' is not a directory", root.display());
    }

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{} escapes the build context", path.display()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            if is_excluded(&relative, excludes) {
                debug!("Excluding {} from build context", relative);
                continue;
            }

            let file_type = entry
                .file_type()
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(ContextFile {
                    relative,
                    absolute: path,
                });
            } else {
                warn!("Skipping non-regular file {} in build context", relative);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// SHA-256 over sorted relative paths and contents
pub fn digest_files(files: &[ContextFile]) -> Result<String> {
    let mut hasher = Sha256::new();
    for file in files {
        let content = fs::read(&file.absolute)
            .with_context(|| format!("Failed to read {}", file.absolute.display()))?;
        hasher.update(file.relative.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(&content);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest of a build context without staging it
pub fn context_digest(root: &Path, excludes: &[String]) -> Result<String> {
    digest_files(&collect_files(root, excludes)?)
}

/// A filtered copy of the build context in a temporary directory
#[derive(Debug)]
pub struct StagedContext {
    dir: TempDir,
    pub digest: String,
    pub file_count: usize,
}

impl StagedContext {
    /// Copy the non-excluded files of `root` into a fresh temporary directory
    pub fn stage(root: &Path, excludes: &[String]) -> Result<Self> {
        let files = collect_files(root, excludes)?;
        let digest = digest_files(&files)?;
        let dir = tempfile::Builder::new()
            .prefix("gateway-stack-context-")
            .tempdir()
            .context("Failed to create staging directory")?;

        for file in &files {
            let target = dir.path().join(&file.relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(&file.absolute, &target).with_context(|| {
                format!(
                    "Failed to copy {} into staging directory",
                    file.absolute.display()
                )
            })?;
        }

        debug!(
            "Staged {} files from {} (digest {})",
            files.len(),
            root.display(),
            digest
        );
        Ok(Self {
            dir,
            digest,
            file_count: files.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Content-addressed tag for the staged context
    pub fn asset_tag(&self) -> String {
        asset_tag(&self.digest)
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.dir.path().join(relative).is_file()
    }
}

pub fn asset_tag(digest: &str) -> String {
    let short: String = digest.chars().take(12).collect();
    format!("asset-{}", short)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excludes() -> Vec<String> {
        vec![
            "node_modules".to_string(),
            ".git".to_string(),
            "cdk.out".to_string(),
        ]
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_exclusion_rules() {
        let ex = excludes();
        assert!(is_excluded("node_modules", &ex));
        assert!(is_excluded("node_modules/left-pad/index.js", &ex));
        assert!(is_excluded("api/node_modules/x.js", &ex));
        assert!(is_excluded(".git/HEAD", &ex));
        assert!(!is_excluded("app/main.py", &ex));
        assert!(!is_excluded("cdk.output", &ex));
        assert!(is_excluded("logs/debug.log", &["*.log".to_string()]));
        assert!(is_excluded("build/out/a", &["build/out".to_string()]));
    }

    #[test]
    fn test_staging_excludes_and_hashes() {
        let src = TempDir::new().unwrap();
        write(src.path(), "Dockerfile_cursor", "FROM python:3.12-slim\n");
        write(src.path(), "app/main.py", "print('hi')\n");
        write(src.path(), "node_modules/pkg/index.js", "module.exports = 1\n");
        write(src.path(), ".git/HEAD", "ref: refs/heads/main\n");

        let staged = StagedContext::stage(src.path(), &excludes()).unwrap();
        assert_eq!(staged.file_count, 2);
        assert!(staged.contains("Dockerfile_cursor"));
        assert!(staged.contains("app/main.py"));
        assert!(!staged.contains("node_modules/pkg/index.js"));
        assert!(staged.asset_tag().starts_with("asset-"));
        assert_eq!(staged.asset_tag().len(), "asset-".len() + 12);
        assert_eq!(
            staged.digest,
            context_digest(src.path(), &excludes()).unwrap()
        );
    }

    #[test]
    fn test_excluded_changes_do_not_move_digest() {
        let src = TempDir::new().unwrap();
        write(src.path(), "Dockerfile_cursor", "FROM scratch\n");
        let before = context_digest(src.path(), &excludes()).unwrap();
        write(src.path(), "cdk.out/manifest.json", "{}");
        assert_eq!(before, context_digest(src.path(), &excludes()).unwrap());
        write(src.path(), "app.py", "x = 1\n");
        assert_ne!(before, context_digest(src.path(), &excludes()).unwrap());
    }

    #[test]
    fn test_missing_context_is_an_error() {
        assert!(context_digest(Path::new("/definitely/not/here"), &[]).is_err());
    }
}
