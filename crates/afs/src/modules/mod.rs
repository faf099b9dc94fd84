//! Built-in modules.

mod document;
mod history;
mod memory;

pub use document::{DocumentModule, DocumentModuleBuilder};
pub use history::HistoryModule;
pub use memory::MemoryModule;

use std::collections::BTreeMap;

use crate::entry::Entry;
use crate::path;

/// Entries below `base` at depth `1..=budget`, sorted by path.
///
/// Missing intermediate directories are synthesized so every listed entry
/// has a listed parent.
pub(crate) fn tree_listing<'a>(
    base: &str,
    entries: impl IntoIterator<Item = &'a Entry>,
    budget: usize,
) -> Vec<Entry> {
    let base_segments = path::segments(base);
    let mut out: BTreeMap<String, Entry> = BTreeMap::new();
    for entry in entries {
        let segments = path::segments(&entry.path);
        if !path::is_prefix(&base_segments, &segments) || segments.len() == base_segments.len() {
            continue;
        }
        let depth = segments.len() - base_segments.len();
        for level in 1..depth.min(budget.saturating_add(1)) {
            let dir = path::from_segments(&segments[..base_segments.len() + level]);
            out.entry(dir.clone()).or_insert_with(|| Entry::directory(dir));
        }
        if depth <= budget {
            out.insert(entry.path.clone(), entry.clone());
        }
    }
    out.into_values().collect()
}

/// Substring match over an entry's text content and summary.
pub(crate) fn matches_query(entry: &Entry, query: &str, case_sensitive: bool) -> bool {
    let haystacks = [
        entry.content.as_ref().and_then(|c| c.as_text()),
        entry.summary.as_deref().map(Into::into),
    ];
    if case_sensitive {
        haystacks.iter().flatten().any(|h| h.contains(query))
    } else {
        let query = query.to_lowercase();
        haystacks
            .iter()
            .flatten()
            .any(|h| h.to_lowercase().contains(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_listing_respects_budget() {
        let entries = [Entry::new("/a/b/c.md"), Entry::new("/top.md")];
        let paths = |budget| {
            tree_listing("/", &entries, budget)
                .into_iter()
                .map(|e| e.path)
                .collect::<Vec<_>>()
        };
        assert!(paths(0).is_empty());
        assert_eq!(paths(1), vec!["/a", "/top.md"]);
        assert_eq!(paths(3), vec!["/a", "/a/b", "/a/b/c.md", "/top.md"]);
    }

    #[test]
    fn test_matches_query() {
        let entry = Entry::new("/a").with_content("Hello World").with_summary("greeting");
        assert!(matches_query(&entry, "hello", false));
        assert!(!matches_query(&entry, "hello", true));
        assert!(matches_query(&entry, "greet", true));
    }
}
