//! Exact search/replace edits applied atomically to repository files.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::matching::{MatchFailure, replace_unique};

/// Arguments of the `apply_patch` tool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PatchRequest {
    /// Path relative to the repository root.
    pub file: String,
    pub search: String,
    pub replace: String,
}

/// A successful edit, with the full file contents before and after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchApplied {
    pub file: String,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("search string must not be empty")]
    EmptySearch,

    #[error("{file} is outside the repository")]
    OutsideRepo { file: String },

    #[error("file not found: {file}")]
    FileNotFound { file: String },

    #[error("permission denied: {file}")]
    PermissionDenied { file: String },

    #[error("{file} is not a regular file")]
    NotAFile { file: String },

    #[error("search string not found in {file}")]
    NoMatch { file: String, first_line_found: bool },

    #[error("search string matches {count} locations in {file}")]
    AmbiguousMatch {
        file: String,
        count: usize,
        lines: Vec<usize>,
    },

    #[error("cannot write {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: io::Error,
    },
}

impl PatchError {
    /// Guidance for the model on how to fix the request, if any.
    pub fn hint(&self) -> Option<String> {
        match self {
            PatchError::NoMatch {
                first_line_found: true,
                ..
            } => Some(
                "the first line of the search string exists; check whitespace and indentation of the following lines"
                    .to_string(),
            ),
            PatchError::NoMatch { .. } => {
                Some("copy the search text exactly from the current file contents".to_string())
            }
            PatchError::AmbiguousMatch { lines, .. } => {
                let lines: Vec<String> = lines.iter().map(ToString::to_string).collect();
                Some(format!(
                    "matches start on lines {}; include more surrounding lines to make the search unique",
                    lines.join(", ")
                ))
            }
            _ => None,
        }
    }

    fn from_io(file: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => PatchError::FileNotFound {
                file: file.to_string(),
            },
            io::ErrorKind::PermissionDenied => PatchError::PermissionDenied {
                file: file.to_string(),
            },
            _ => PatchError::Io {
                file: file.to_string(),
                source: err,
            },
        }
    }
}

/// Applies [`PatchRequest`]s inside one repository. Holds no state between calls.
#[derive(Debug, Clone)]
pub struct PatchEngine {
    repo_root: PathBuf,
}

impl PatchEngine {
    pub fn new(repo_root: &Path) -> io::Result<Self> {
        Ok(Self {
            repo_root: repo_root.canonicalize()?,
        })
    }

    /// Replace the single occurrence of `search` and write the file atomically.
    ///
    /// On any error the file is left untouched.
    #[instrument(skip_all, fields(file = %request.file))]
    pub fn apply(&self, request: &PatchRequest) -> Result<PatchApplied, PatchError> {
        if request.search.is_empty() {
            return Err(PatchError::EmptySearch);
        }
        let (path, file) = self.resolve(&request.file)?;
        let before = fs::read(&path).map_err(|e| PatchError::from_io(&file, e))?;

        let after = replace_unique(&before, request.search.as_bytes(), request.replace.as_bytes())
            .map_err(|failure| match failure {
                MatchFailure::EmptySearch => PatchError::EmptySearch,
                MatchFailure::NoMatch { first_line_found } => PatchError::NoMatch {
                    file: file.clone(),
                    first_line_found,
                },
                MatchFailure::Ambiguous { count, lines } => PatchError::AmbiguousMatch {
                    file: file.clone(),
                    count,
                    lines,
                },
            })?;

        write_atomic(&path, &after).map_err(|e| PatchError::from_io(&file, e))?;
        debug!(
            resolved = %file,
            before_bytes = before.len(),
            after_bytes = after.len(),
            "patch applied"
        );
        Ok(PatchApplied {
            file,
            before,
            after,
        })
    }

    /// Resolve a repository-relative path, following symlinks, and make sure it
    /// stays inside the repository.
    ///
    /// Returns the absolute path and its canonical `/`-separated name relative
    /// to the root, so `a.py` and `./a.py` name the same file.
    fn resolve(&self, file: &str) -> Result<(PathBuf, String), PatchError> {
        let relative = Path::new(file);
        let escapes = file.trim().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(PatchError::OutsideRepo {
                file: file.to_string(),
            });
        }
        let path = self
            .repo_root
            .join(relative)
            .canonicalize()
            .map_err(|e| PatchError::from_io(file, e))?;
        let Ok(inside) = path.strip_prefix(&self.repo_root) else {
            return Err(PatchError::OutsideRepo {
                file: file.to_string(),
            });
        };
        if !path.is_file() {
            return Err(PatchError::NotAFile {
                file: file.to_string(),
            });
        }
        let name = inside
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok((path, name))
    }
}

/// Write through a temp file in the same directory, keeping the original permissions.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(path)?.permissions();
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), permissions)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(file: &str, search: &str, replace: &str) -> PatchRequest {
        PatchRequest {
            file: file.to_string(),
            search: search.to_string(),
            replace: replace.to_string(),
        }
    }

    fn repo_with(file: &str, contents: &str) -> (tempfile::TempDir, PatchEngine) {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(&path, contents).expect("write");
        let engine = PatchEngine::new(temp.path()).expect("engine");
        (temp, engine)
    }

    #[test]
    fn unique_match_is_replaced_on_disk() {
        let (temp, engine) = repo_with("src/calc.py", "def f():\n    return 1\n");
        let applied = engine
            .apply(&request("src/calc.py", "return 1", "return 2"))
            .expect("apply");
        assert_eq!(applied.before, b"def f():\n    return 1\n");
        let on_disk = fs::read_to_string(temp.path().join("src/calc.py")).expect("read");
        assert_eq!(on_disk, "def f():\n    return 2\n");
    }

    #[test]
    fn reapplying_yields_no_match_and_keeps_bytes() {
        let (temp, engine) = repo_with("a.py", "x = 1\n");
        let req = request("a.py", "x = 1", "x = 2");
        engine.apply(&req).expect("first apply");
        let err = engine.apply(&req).expect_err("second apply");
        assert!(matches!(err, PatchError::NoMatch { .. }));
        assert_eq!(fs::read_to_string(temp.path().join("a.py")).expect("read"), "x = 2\n");
    }

    #[test]
    fn ambiguous_match_leaves_file_untouched() {
        let (temp, engine) = repo_with("a.py", "x\nx\n");
        let err = engine.apply(&request("a.py", "x", "y")).expect_err("ambiguous");
        match &err {
            PatchError::AmbiguousMatch { count, lines, .. } => {
                assert_eq!(*count, 2);
                assert_eq!(lines, &vec![1, 2]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.hint().expect("hint").contains("lines 1, 2"));
        assert_eq!(fs::read_to_string(temp.path().join("a.py")).expect("read"), "x\nx\n");
    }

    #[test]
    fn applied_file_is_named_relative_to_the_root() {
        let (_temp, engine) = repo_with("src/a.py", "x = 1\n");
        for (spelling, search, replace) in [
            ("src/a.py", "x = 1", "x = 2"),
            ("./src/a.py", "x = 2", "x = 3"),
            ("src/./a.py", "x = 3", "x = 4"),
        ] {
            let applied = engine
                .apply(&request(spelling, search, replace))
                .expect("apply");
            assert_eq!(applied.file, "src/a.py", "{spelling}");
        }
    }

    #[test]
    fn missing_file_is_distinct() {
        let (_temp, engine) = repo_with("a.py", "x\n");
        let err = engine.apply(&request("nope.py", "x", "y")).expect_err("missing");
        assert!(matches!(err, PatchError::FileNotFound { .. }));
    }

    #[test]
    fn paths_outside_repo_are_rejected() {
        let (_temp, engine) = repo_with("a.py", "x\n");
        for file in ["../a.py", "/etc/passwd", "sub/../../a.py", ""] {
            let err = engine.apply(&request(file, "x", "y")).expect_err("outside");
            assert!(matches!(err, PatchError::OutsideRepo { .. }), "{file}: {err:?}");
        }
    }

    #[test]
    fn empty_search_is_rejected() {
        let (_temp, engine) = repo_with("a.py", "x\n");
        let err = engine.apply(&request("a.py", "", "y")).expect_err("empty");
        assert!(matches!(err, PatchError::EmptySearch));
    }

    #[cfg(unix)]
    #[test]
    fn permissions_survive_the_rewrite() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, engine) = repo_with("run.sh", "echo 1\n");
        let path = temp.path().join("run.sh");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        engine.apply(&request("run.sh", "echo 1", "echo 2")).expect("apply");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
