//! Case file parsing and validation.
//!
//! Cases are TOML files naming a problem statement, a fixture repository and an
//! optional reference patch. See `eval/cases/` for examples.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

/// A parsed case file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseFile {
    pub case: CaseMeta,
    #[serde(default)]
    pub config: CaseConfig,
}

/// Case metadata: identifier, problem and fixtures.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    /// Problem statement handed to the agent as the user message.
    pub problem_statement: String,
    /// Fixture repository, relative to the case file.
    pub repo: PathBuf,
    /// Reference unified diff, relative to the case file.
    pub expected_patch: Option<PathBuf>,
}

/// Agent overrides for the case.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CaseConfig {
    pub max_turns: Option<u32>,
    pub thinking: Option<bool>,
}

/// A case together with the file it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedCase {
    pub file: CaseFile,
    pub path: PathBuf,
}

impl LoadedCase {
    pub fn id(&self) -> &str {
        &self.file.case.id
    }

    fn case_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Absolute location of the fixture repository.
    pub fn repo_dir(&self) -> PathBuf {
        self.case_dir().join(&self.file.case.repo)
    }

    /// Reference patch contents; empty when the case has none.
    pub fn expected_patch(&self) -> Result<String> {
        match &self.file.case.expected_patch {
            Some(rel) => {
                let path = self.case_dir().join(rel);
                fs::read_to_string(&path)
                    .with_context(|| format!("read expected patch {}", path.display()))
            }
            None => Ok(String::new()),
        }
    }
}

impl CaseFile {
    /// Load and validate a case file from the given path.
    pub fn load(path: &Path) -> Result<LoadedCase> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        let case: CaseFile =
            toml::from_str(&contents).with_context(|| format!("parse case {}", path.display()))?;
        case.validate()
            .with_context(|| format!("validate case {}", path.display()))?;
        Ok(LoadedCase {
            file: case,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    fn validate(&self) -> Result<()> {
        validate_case_id(&self.case.id)?;
        if self.case.problem_statement.trim().is_empty() {
            bail!("case.problem_statement must be non-empty");
        }
        if self.case.repo.as_os_str().is_empty() {
            bail!("case.repo must be non-empty");
        }
        if let Some(patch) = &self.case.expected_patch
            && patch.as_os_str().is_empty()
        {
            bail!("case.expected_patch must be non-empty when set");
        }
        if let Some(max_turns) = self.config.max_turns
            && max_turns == 0
        {
            bail!("config.max_turns must be > 0");
        }
        Ok(())
    }
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by id. Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<LoadedCase>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        cases.push(CaseFile::load(&path)?);
    }
    cases.sort_by(|left, right| left.id().cmp(right.id()));
    for pair in cases.windows(2) {
        if pair[0].id() == pair[1].id() {
            return Err(anyhow!("duplicate case.id {}", pair[0].id()));
        }
    }
    Ok(cases)
}

/// Pick cases by id; no ids means every case.
pub fn select_cases(all: Vec<LoadedCase>, ids: &[String]) -> Result<Vec<LoadedCase>> {
    if ids.is_empty() {
        return Ok(all);
    }
    let mut selected = Vec::new();
    for id in ids {
        let case = all
            .iter()
            .find(|case| case.id() == id)
            .ok_or_else(|| anyhow!("case {id} not found"))?;
        selected.push(case.clone());
    }
    Ok(selected)
}

fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if id.contains('/') || id.contains('\\') {
        bail!("case.id must not contain path separators");
    }
    if id.contains("..") {
        bail!("case.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_case() {
        let input = r#"
[case]
id = "calc-return"
problem_statement = "value() should return 2"
repo = "fixtures/calc"
expected_patch = "fixtures/calc-return.diff"

[config]
max_turns = 8
"#;
        let case = CaseFile::parse_str(input).expect("case parses");
        assert_eq!(case.case.id, "calc-return");
        assert_eq!(case.config.max_turns, Some(8));
        assert_eq!(case.config.thinking, None);
    }

    #[test]
    fn rejects_invalid_id() {
        let input = r#"
[case]
id = "bad/id"
problem_statement = "x"
repo = "fixtures/calc"
"#;
        let err = CaseFile::parse_str(input).expect_err("invalid id");
        assert!(err.to_string().contains("case.id"));
    }

    #[test]
    fn rejects_zero_turns() {
        let input = r#"
[case]
id = "calc"
problem_statement = "x"
repo = "fixtures/calc"

[config]
max_turns = 0
"#;
        let err = CaseFile::parse_str(input).expect_err("zero turns");
        assert!(err.to_string().contains("max_turns"));
    }

    #[test]
    fn paths_resolve_next_to_the_case_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("fix.diff"), "diff --git a/x b/x\n").expect("patch");
        let case_path = temp.path().join("calc.toml");
        fs::write(
            &case_path,
            "[case]\nid = \"calc\"\nproblem_statement = \"x\"\nrepo = \"repo\"\nexpected_patch = \"fix.diff\"\n",
        )
        .expect("case");

        let loaded = CaseFile::load(&case_path).expect("load");
        assert_eq!(loaded.repo_dir(), temp.path().join("repo"));
        assert_eq!(loaded.expected_patch().expect("patch"), "diff --git a/x b/x\n");
    }

    #[test]
    fn select_cases_rejects_unknown_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("a.toml"),
            "[case]\nid = \"a\"\nproblem_statement = \"x\"\nrepo = \"r\"\n",
        )
        .expect("case");
        let all = discover_cases(temp.path()).expect("discover");
        assert_eq!(select_cases(all.clone(), &[]).expect("all").len(), 1);
        let err = select_cases(all, &["b".to_string()]).expect_err("unknown");
        assert!(err.to_string().contains("case b not found"));
    }
}
