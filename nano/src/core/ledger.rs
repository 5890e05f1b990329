//! Cumulative record of files mutated during a run.

use std::collections::BTreeMap;

use crate::core::diff::unified_file_diff;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileEdit {
    original: Vec<u8>,
    current: Vec<u8>,
}

/// Tracks the first-seen and latest contents of every patched file.
///
/// The final diff of a run is computed from this ledger alone, so it reflects
/// exactly the mutations made through the patch tool.
#[derive(Debug, Clone, Default)]
pub struct EditLedger {
    files: BTreeMap<String, FileEdit>,
}

impl EditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: &str, before: &[u8], after: &[u8]) {
        self.files
            .entry(path.to_string())
            .and_modify(|edit| edit.current = after.to_vec())
            .or_insert_with(|| FileEdit {
                original: before.to_vec(),
                current: after.to_vec(),
            });
    }

    /// Files whose current contents differ from what was first seen.
    pub fn changed_files(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|(_, edit)| edit.original != edit.current)
            .map(|(path, _)| path.as_str())
            .collect()
    }

    /// Concatenated unified diff of every changed file, ordered by path.
    pub fn final_diff(&self) -> String {
        self.files
            .iter()
            .map(|(path, edit)| {
                unified_file_diff(
                    path,
                    &String::from_utf8_lossy(&edit.original),
                    &String::from_utf8_lossy(&edit.current),
                )
            })
            .collect()
    }
}
