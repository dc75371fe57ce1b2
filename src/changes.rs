// 🔀 Change-Set Resolver - which record files to process this run
// Full backfill without a checkpoint, otherwise only files changed since the last revision

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

// ============================================================================
// REPOSITORY COLLABORATOR
// ============================================================================

/// Versioned record tree
///
/// Paths returned by `changed_paths` are relative to the repository root.
pub trait Repository {
    /// Bring the working copy up to date with upstream
    fn sync(&self) -> Result<()>;

    fn current_revision(&self) -> Result<String>;

    /// Added or modified paths under `subtree` between `from` and `to`;
    /// every path under `subtree` when `from` is None
    fn changed_paths(&self, from: Option<&str>, to: &str, subtree: &Path) -> Result<Vec<PathBuf>>;

    /// Local directory holding the working copy
    fn root(&self) -> &Path;
}

/// Git working copy driven through the `git` command line
pub struct GitRepository {
    url: String,
    branch: String,
    local_path: PathBuf,
}

impl GitRepository {
    pub fn new(url: &str, branch: &str, local_path: impl Into<PathBuf>) -> Self {
        GitRepository {
            url: url.to_string(),
            branch: branch.to_string(),
            local_path: local_path.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        run_git(Some(&self.local_path), args)
    }
}

fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args);

    let output = cmd
        .output()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        anyhow::bail!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl Repository for GitRepository {
    fn sync(&self) -> Result<()> {
        if !self.local_path.is_dir() {
            info!("Cloning repo {} into {}", self.url, self.local_path.display());
            let target = self.local_path.to_string_lossy();
            run_git(
                None,
                &["clone", "--branch", &self.branch, &self.url, target.as_ref()],
            )?;
        } else {
            info!("Updating repo in {}", self.local_path.display());
            self.git(&["fetch", "origin", &self.branch])?;
            self.git(&["checkout", &self.branch])?;
            self.git(&["pull", "origin", &self.branch])?;
        }
        Ok(())
    }

    fn current_revision(&self) -> Result<String> {
        let out = self.git(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    fn changed_paths(&self, from: Option<&str>, to: &str, subtree: &Path) -> Result<Vec<PathBuf>> {
        match from {
            None => walk_files(&self.local_path, subtree),
            Some(from) => {
                let range = format!("{}..{}", from, to);
                let subtree = subtree.to_string_lossy();
                // -z: NUL-separated, unquoted paths (non-ASCII names stay intact)
                let out = self.git(&[
                    "diff",
                    "--name-only",
                    "-z",
                    "--diff-filter=ACMR",
                    &range,
                    "--",
                    subtree.as_ref(),
                ])?;
                Ok(out
                    .split('\0')
                    .filter(|name| !name.is_empty())
                    .map(PathBuf::from)
                    .collect())
            }
        }
    }

    fn root(&self) -> &Path {
        &self.local_path
    }
}

/// Every file under `root/subtree`, as paths relative to `root`
pub fn walk_files(root: &Path, subtree: &Path) -> Result<Vec<PathBuf>> {
    let start = root.join(subtree);
    if !start.is_dir() {
        anyhow::bail!("record subtree not found: {}", start.display());
    }

    let mut files = Vec::new();
    let mut pending = vec![start];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list directory: {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            // Symlinked directories are not followed
            if file_type.is_symlink() && path.is_dir() {
                debug!(path = %path.display(), "Skipping symlinked directory");
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    Ok(files)
}

/// `{repo}/blob/{revision}/{path}` with any trailing `.git` removed from the repo URL
pub fn blob_url(repo_url: &str, revision: &str, relative_path: &Path) -> String {
    let trimmed = repo_url.trim_end_matches('/');
    let base = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = relative_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/blob/{}/{}", base, revision, path)
}

// ============================================================================
// CHANGE-SET RESOLVER
// ============================================================================

/// Keep only the normal components of a relative subtree (`.` and roots dropped)
pub fn normalize_subtree(subtree: &Path) -> PathBuf {
    subtree
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

pub struct ChangeSetResolver {
    subtree: PathBuf,
    extension: String,
}

impl ChangeSetResolver {
    /// `subtree` is reduced to its plain components, so `./osv/malicious`
    /// and `osv/malicious/` both match the relative paths repositories return
    pub fn new(subtree: impl Into<PathBuf>, extension: &str) -> Self {
        ChangeSetResolver {
            subtree: normalize_subtree(&subtree.into()),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn subtree(&self) -> &Path {
        &self.subtree
    }

    /// Record paths to process, sorted and deduplicated
    ///
    /// Any repository error is returned as-is; it never degrades to "no changes".
    pub fn resolve<R: Repository + ?Sized>(
        &self,
        repo: &R,
        previous: Option<&str>,
        current: &str,
    ) -> Result<Vec<PathBuf>> {
        let candidates = repo
            .changed_paths(previous, current, &self.subtree)
            .with_context(|| match previous {
                Some(prev) => format!("Failed to diff {}..{}", prev, current),
                None => format!("Failed to list records under {}", self.subtree.display()),
            })?;

        let total = candidates.len();
        let paths: BTreeSet<PathBuf> = candidates
            .into_iter()
            .filter(|p| p.starts_with(&self.subtree))
            .filter(|p| self.is_record(p))
            .collect();

        debug!(
            candidates = total,
            records = paths.len(),
            backfill = previous.is_none(),
            "Resolved change set"
        );
        Ok(paths.into_iter().collect())
    }

    fn is_record(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e == self.extension)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Fixed file list for backfills, canned diffs keyed by "from..to"
    struct FakeRepository {
        root: PathBuf,
        all: Vec<PathBuf>,
        diffs: HashMap<String, Vec<PathBuf>>,
    }

    impl Repository for FakeRepository {
        fn sync(&self) -> Result<()> {
            Ok(())
        }

        fn current_revision(&self) -> Result<String> {
            Ok("B".to_string())
        }

        fn changed_paths(&self, from: Option<&str>, to: &str, _subtree: &Path) -> Result<Vec<PathBuf>> {
            match from {
                None => Ok(self.all.clone()),
                Some(from) => self
                    .diffs
                    .get(&format!("{}..{}", from, to))
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("unknown revision {}", from)),
            }
        }

        fn root(&self) -> &Path {
            &self.root
        }
    }

    fn fake() -> FakeRepository {
        let all = vec![
            PathBuf::from("osv/malicious/npm/b/MAL-2.json"),
            PathBuf::from("osv/malicious/npm/a/MAL-1.json"),
            PathBuf::from("osv/malicious/README.md"),
            PathBuf::from("osv/malicious/pypi/c/MAL-3.json"),
        ];
        let mut diffs = HashMap::new();
        diffs.insert(
            "A..B".to_string(),
            vec![
                PathBuf::from("osv/malicious/pypi/c/MAL-3.json"),
                PathBuf::from("osv/withdrawn/MAL-9.json"),
                PathBuf::from("osv/malicious/pypi/c/MAL-3.json"),
            ],
        );
        FakeRepository { root: PathBuf::from("/repo"), all, diffs }
    }

    #[test]
    fn test_backfill_returns_every_record_sorted() {
        let resolver = ChangeSetResolver::new("osv/malicious", "json");
        let paths = resolver.resolve(&fake(), None, "B").unwrap();

        assert_eq!(
            paths,
            vec![
                PathBuf::from("osv/malicious/npm/a/MAL-1.json"),
                PathBuf::from("osv/malicious/npm/b/MAL-2.json"),
                PathBuf::from("osv/malicious/pypi/c/MAL-3.json"),
            ]
        );
    }

    #[test]
    fn test_incremental_returns_only_changed_records_in_subtree() {
        let resolver = ChangeSetResolver::new("osv/malicious", ".json");
        let paths = resolver.resolve(&fake(), Some("A"), "B").unwrap();
        assert_eq!(paths, vec![PathBuf::from("osv/malicious/pypi/c/MAL-3.json")]);
    }

    #[test]
    fn test_diff_failure_is_an_error_not_empty() {
        let resolver = ChangeSetResolver::new("osv/malicious", "json");
        let err = resolver.resolve(&fake(), Some("gone"), "B").unwrap_err();
        assert!(format!("{:#}", err).contains("unknown revision gone"));
    }

    #[test]
    fn test_walk_files_is_recursive_and_relative() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("osv/malicious/npm/pkg");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("MAL-1.json"), "{}").unwrap();
        fs::write(dir.path().join("osv/malicious/top.json"), "{}").unwrap();
        fs::write(dir.path().join("outside.json"), "{}").unwrap();

        let mut files = walk_files(dir.path(), Path::new("osv/malicious")).unwrap();
        files.sort();

        assert_eq!(
            files,
            vec![
                PathBuf::from("osv/malicious/npm/pkg/MAL-1.json"),
                PathBuf::from("osv/malicious/top.json"),
            ]
        );
    }

    #[test]
    fn test_dot_prefixed_subtree_still_matches() {
        for subtree in ["./osv/malicious", "osv/./malicious/", "osv/malicious"] {
            let resolver = ChangeSetResolver::new(subtree, "json");
            assert_eq!(resolver.subtree(), Path::new("osv/malicious"));
            assert_eq!(resolver.resolve(&fake(), None, "B").unwrap().len(), 3, "subtree {}", subtree);
        }
    }

    #[test]
    fn test_dot_prefixed_subtree_walks_the_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("osv/malicious/npm/a");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("MAL-1.json"), "{}").unwrap();

        let resolver = ChangeSetResolver::new("./osv/malicious", "json");
        let files = walk_files(dir.path(), resolver.subtree()).unwrap();
        assert_eq!(files, vec![PathBuf::from("osv/malicious/npm/a/MAL-1.json")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_files_skips_symlinked_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let pkg = dir.path().join("osv/malicious/npm/pkg");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("MAL-1.json"), "{}").unwrap();
        // Loop back to the subtree root
        std::os::unix::fs::symlink(dir.path().join("osv/malicious"), pkg.join("loop")).unwrap();

        let files = walk_files(dir.path(), Path::new("osv/malicious")).unwrap();
        assert_eq!(files, vec![PathBuf::from("osv/malicious/npm/pkg/MAL-1.json")]);
    }

    #[test]
    fn test_walk_files_missing_subtree() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(walk_files(dir.path(), Path::new("osv/malicious")).is_err());
    }

    #[test]
    fn test_blob_url() {
        let path = Path::new("osv/malicious/npm/x/MAL-1.json");
        assert_eq!(
            blob_url("https://github.com/ossf/malicious-packages.git", "abc", path),
            "https://github.com/ossf/malicious-packages/blob/abc/osv/malicious/npm/x/MAL-1.json"
        );
        assert_eq!(
            blob_url("https://github.com/ossf/malicious-packages/", "abc", path),
            "https://github.com/ossf/malicious-packages/blob/abc/osv/malicious/npm/x/MAL-1.json"
        );
    }
}
