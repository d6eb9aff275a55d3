//! Tag-based task selection.
//!
//! # Special Tags
//!
//! - `always`: Task runs regardless of tag selection (unless explicitly skipped)
//! - `never`: Task runs only when one of its tags is explicitly selected
//! - `tagged`: Selects any task that has at least one tag
//! - `untagged`: Selects any task with no tags
//! - `all`: Selects every task not tagged `never`
//!
//! `never` takes precedence over `always`: a task tagged with both is still
//! excluded unless explicitly selected.
//!
//! # Example
//!
//! ```rust
//! use converge::tags::TagFilter;
//!
//! let filter = TagFilter::new()
//!     .with_tags(vec!["deploy".to_string()])
//!     .with_skip_tags(vec!["debug".to_string()]);
//!
//! assert!(filter.should_run(&["deploy".to_string(), "web".to_string()]));
//! assert!(!filter.should_run(&["deploy".to_string(), "debug".to_string()]));
//! assert!(!filter.should_run(&[]));
//! ```

mod filter;

pub use filter::TagFilter;

/// Special tag constants
pub mod special {
    /// Tag that causes a task to always run regardless of tag selection
    pub const ALWAYS: &str = "always";

    /// Tag that causes a task to never run unless explicitly selected
    pub const NEVER: &str = "never";

    /// Matches any task that has at least one tag
    pub const TAGGED: &str = "tagged";

    /// Matches any task with no tags
    pub const UNTAGGED: &str = "untagged";

    /// Matches all tasks
    pub const ALL: &str = "all";
}

/// Check if a tag is a special tag
pub fn is_special_tag(tag: &str) -> bool {
    matches!(
        tag.to_lowercase().as_str(),
        special::ALWAYS | special::NEVER | special::TAGGED | special::UNTAGGED | special::ALL
    )
}

/// Split comma-separated tag lists and drop empty entries
pub fn parse_tag_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .flat_map(|item| {
            item.as_ref()
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}
