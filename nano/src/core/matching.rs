//! Exact, unique search/replace over raw file bytes.

/// Why a search string could not be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchFailure {
    EmptySearch,
    NoMatch {
        /// The first line of a multi-line search does occur in the text.
        first_line_found: bool,
    },
    Ambiguous {
        count: usize,
        /// 1-based line numbers of the first few match starts.
        lines: Vec<usize>,
    },
}

/// Line numbers reported for an ambiguous match.
pub const AMBIGUOUS_LINE_HINTS: usize = 3;

/// Start offsets of every occurrence of `needle`, overlapping ones included.
pub fn match_offsets(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(offset, _)| offset)
        .collect()
}

/// 1-based line number containing byte `offset`.
pub fn line_of_offset(text: &[u8], offset: usize) -> usize {
    let end = offset.min(text.len());
    text[..end].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Replace the single occurrence of `search` in `text`.
///
/// Bytes outside the matched span are carried over untouched.
pub fn replace_unique(text: &[u8], search: &[u8], replace: &[u8]) -> Result<Vec<u8>, MatchFailure> {
    if search.is_empty() {
        return Err(MatchFailure::EmptySearch);
    }
    let offsets = match_offsets(text, search);
    match offsets.as_slice() {
        [] => Err(MatchFailure::NoMatch {
            first_line_found: first_line_found(text, search),
        }),
        [start] => {
            let mut out = Vec::with_capacity(text.len() - search.len() + replace.len());
            out.extend_from_slice(&text[..*start]);
            out.extend_from_slice(replace);
            out.extend_from_slice(&text[start + search.len()..]);
            Ok(out)
        }
        many => Err(MatchFailure::Ambiguous {
            count: many.len(),
            lines: many
                .iter()
                .take(AMBIGUOUS_LINE_HINTS)
                .map(|&offset| line_of_offset(text, offset))
                .collect(),
        }),
    }
}

fn first_line_found(text: &[u8], search: &[u8]) -> bool {
    let Some(newline) = search.iter().position(|&b| b == b'\n') else {
        return false;
    };
    let first = &search[..newline];
    !first.iter().all(u8::is_ascii_whitespace) && !match_offsets(text, first).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_match_replaces_only_that_span() {
        let text = b"fn a() {\n    return 1;\n}\n";
        let out = replace_unique(text, b"return 1", b"return 2").expect("replace");
        assert_eq!(out, b"fn a() {\n    return 2;\n}\n");
    }

    #[test]
    fn reapplying_an_applied_replacement_finds_nothing() {
        let text = b"x = 1\n";
        let once = replace_unique(text, b"x = 1", b"x = 2").expect("replace");
        assert_eq!(
            replace_unique(&once, b"x = 1", b"x = 2"),
            Err(MatchFailure::NoMatch {
                first_line_found: false
            })
        );
    }

    #[test]
    fn ambiguous_match_reports_count_and_lines() {
        let text = b"a\nret\nb\nret\nret\nret\n";
        assert_eq!(
            replace_unique(text, b"ret", b"x"),
            Err(MatchFailure::Ambiguous {
                count: 4,
                lines: vec![2, 4, 5],
            })
        );
    }

    #[test]
    fn overlapping_occurrences_count_as_ambiguous() {
        assert_eq!(match_offsets(b"aaa", b"aa"), vec![0, 1]);
        assert!(matches!(
            replace_unique(b"aaa", b"aa", b"b"),
            Err(MatchFailure::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn empty_search_is_rejected() {
        assert_eq!(replace_unique(b"abc", b"", b"x"), Err(MatchFailure::EmptySearch));
    }

    #[test]
    fn whitespace_mismatch_keeps_first_line_hint() {
        let text = b"def f():\n    return 1\n";
        let search = b"def f():\n  return 1";
        assert_eq!(
            replace_unique(text, search, b""),
            Err(MatchFailure::NoMatch {
                first_line_found: true
            })
        );
    }

    #[test]
    fn replacement_may_delete_the_span() {
        let out = replace_unique(b"keep drop keep", b" drop", b"").expect("replace");
        assert_eq!(out, b"keep keep");
    }
}
