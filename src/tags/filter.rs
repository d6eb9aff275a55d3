//! Tag filter implementation for task selection.

use std::collections::HashSet;

use super::{parse_tag_list, special};

/// Selects tasks by their tags.
///
/// An empty filter runs every task except those tagged `never`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    include_tags: HashSet<String>,
    skip_tags: HashSet<String>,
}

impl TagFilter {
    /// Create a new empty tag filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tags to select (comma-separated entries are split)
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.set_tags(tags);
        self
    }

    /// Set the tags to skip (comma-separated entries are split)
    pub fn with_skip_tags(mut self, tags: Vec<String>) -> Self {
        self.set_skip_tags(tags);
        self
    }

    /// Replace the tag selection
    pub fn set_tags(&mut self, tags: Vec<String>) {
        self.include_tags = parse_tag_list(tags).into_iter().collect();
    }

    /// Replace the skip selection
    pub fn set_skip_tags(&mut self, tags: Vec<String>) {
        self.skip_tags = parse_tag_list(tags).into_iter().collect();
    }

    /// Check if any selection is active
    pub fn is_active(&self) -> bool {
        !self.include_tags.is_empty() || !self.skip_tags.is_empty()
    }

    /// Check if a task with the given tags should run
    ///
    /// # Logic
    ///
    /// 1. A `never` task runs only if the selection names one of its tags
    /// 2. If skip_tags matches, skip the task
    /// 3. An `always` task runs
    /// 4. An empty selection runs the task
    /// 5. Otherwise the selection must match (`all`, `tagged`, `untagged` or a shared tag)
    pub fn should_run(&self, task_tags: &[String]) -> bool {
        let has = |tag: &str| task_tags.iter().any(|t| t.eq_ignore_ascii_case(tag));

        if has(special::NEVER) && !self.intersects_include(task_tags) {
            return false;
        }

        if self.matches_skip(task_tags) {
            return false;
        }

        if has(special::ALWAYS) {
            return true;
        }

        if self.include_tags.is_empty() {
            return true;
        }

        if self.include_tags.contains(special::ALL) {
            return true;
        }
        if self.include_tags.contains(special::TAGGED) && !task_tags.is_empty() {
            return true;
        }
        if self.include_tags.contains(special::UNTAGGED) && task_tags.is_empty() {
            return true;
        }

        self.intersects_include(task_tags)
    }

    fn intersects_include(&self, task_tags: &[String]) -> bool {
        task_tags.iter().any(|t| self.include_tags.contains(t))
    }

    fn matches_skip(&self, task_tags: &[String]) -> bool {
        if self.skip_tags.is_empty() {
            return false;
        }
        if self.skip_tags.contains(special::ALL) {
            return true;
        }
        if self.skip_tags.contains(special::TAGGED) && !task_tags.is_empty() {
            return true;
        }
        if self.skip_tags.contains(special::UNTAGGED) && task_tags.is_empty() {
            return true;
        }
        task_tags.iter().any(|t| self.skip_tags.contains(t))
    }

    /// Get all referenced tags, sorted
    pub fn referenced_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self
            .include_tags
            .iter()
            .chain(self.skip_tags.iter())
            .map(String::as_str)
            .collect();
        tags.sort_unstable();
        tags.dedup();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_filter_matches_all_but_never() {
        let filter = TagFilter::new();

        assert!(filter.should_run(&[]));
        assert!(filter.should_run(&tags(&["deploy"])));
        assert!(filter.should_run(&tags(&["always"])));
        assert!(!filter.should_run(&tags(&["never"])));
        assert!(!filter.should_run(&tags(&["never", "debug"])));
    }

    #[test]
    fn test_include_tags() {
        let filter = TagFilter::new().with_tags(tags(&["web"]));

        assert!(filter.should_run(&tags(&["web", "config"])));
        assert!(!filter.should_run(&[]));
        assert!(!filter.should_run(&tags(&["db"])));
        assert!(filter.should_run(&tags(&["always"])));
    }

    #[test]
    fn test_never_beats_always() {
        let filter = TagFilter::new().with_tags(tags(&["web"]));
        assert!(!filter.should_run(&tags(&["always", "never"])));

        let filter = TagFilter::new();
        assert!(!filter.should_run(&tags(&["always", "never"])));
    }

    #[test]
    fn test_never_runs_when_explicitly_selected() {
        let filter = TagFilter::new().with_tags(tags(&["debug"]));
        assert!(filter.should_run(&tags(&["never", "debug"])));

        let filter = TagFilter::new().with_tags(tags(&["never"]));
        assert!(filter.should_run(&tags(&["never"])));

        let filter = TagFilter::new().with_tags(tags(&["all"]));
        assert!(!filter.should_run(&tags(&["never"])));
    }

    #[test]
    fn test_skip_tags() {
        let filter = TagFilter::new().with_skip_tags(tags(&["slow"]));
        assert!(!filter.should_run(&tags(&["slow", "web"])));
        assert!(filter.should_run(&tags(&["web"])));
        assert!(filter.should_run(&[]));

        let filter = TagFilter::new().with_skip_tags(tags(&["always"]));
        assert!(!filter.should_run(&tags(&["always"])));
    }

    #[test]
    fn test_special_selections() {
        let tagged = TagFilter::new().with_tags(tags(&["tagged"]));
        assert!(tagged.should_run(&tags(&["x"])));
        assert!(!tagged.should_run(&[]));

        let untagged = TagFilter::new().with_tags(tags(&["untagged"]));
        assert!(untagged.should_run(&[]));
        assert!(!untagged.should_run(&tags(&["x"])));

        let all = TagFilter::new().with_tags(tags(&["all"]));
        assert!(all.should_run(&[]));
        assert!(all.should_run(&tags(&["x"])));
    }

    #[test]
    fn test_comma_separated_and_referenced() {
        let filter = TagFilter::new()
            .with_tags(tags(&["web,db"]))
            .with_skip_tags(tags(&["slow"]));
        assert!(filter.is_active());
        assert!(filter.should_run(&tags(&["db"])));
        assert_eq!(filter.referenced_tags(), vec!["db", "slow", "web"]);
    }
}
