//! Ignore rules for sync operations.
//!
//! A pattern excludes an entry when it is a glob matching the entry's base
//! name, or when it ends with `/` and names a directory appearing anywhere in
//! the entry's relative path. Any match excludes; there is no un-ignore.

use std::path::{Component, Path};

use globset::{Glob, GlobBuilder, GlobMatcher};
use tracing::warn;

/// Ignore file read from the source root when present.
pub const IGNORE_FILE_NAME: &str = ".syncignore";

#[derive(Debug, Clone)]
enum Rule {
    /// Matched against the base name.
    Name(GlobMatcher),
    /// Matched against every path component.
    Directory(GlobMatcher),
}

/// Compiled set of ignore rules.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
    /// Raw pattern strings (for display/serialization).
    patterns: Vec<String>,
}

fn compile(pattern: &str) -> Option<GlobMatcher> {
    GlobBuilder::new(pattern)
        .case_insensitive(false)
        .literal_separator(true)
        .build()
        .map(|glob: Glob| glob.compile_matcher())
        .ok()
}

impl IgnoreMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a list of patterns. Malformed globs are dropped, never fatal.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut matcher = Self::new();
        for pattern in patterns {
            matcher.add_pattern(pattern.as_ref());
        }
        matcher
    }

    /// Add one pattern. Returns whether it compiled.
    pub fn add_pattern(&mut self, pattern: &str) -> bool {
        let rule = match pattern.strip_suffix('/') {
            Some(dir) if !dir.is_empty() => compile(dir).map(Rule::Directory),
            Some(_) => None,
            None => compile(pattern).map(Rule::Name),
        };

        match rule {
            Some(rule) => {
                self.rules.push(rule);
                self.patterns.push(pattern.to_string());
                true
            }
            None => {
                warn!(pattern, "ignoring malformed exclude pattern");
                false
            }
        }
    }

    /// Check whether a path relative to the sync root is excluded.
    pub fn is_excluded(&self, relative_path: &Path) -> bool {
        let base_name = relative_path.file_name();

        self.rules.iter().any(|rule| match rule {
            Rule::Name(glob) => base_name.is_some_and(|name| glob.is_match(name)),
            Rule::Directory(glob) => relative_path.components().any(|component| {
                matches!(component, Component::Normal(name) if glob.is_match(name))
            }),
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Parse patterns from ignore-file text (one per line, `#` comments).
    /// Negated `!` lines are skipped since nothing can be un-ignored.
    pub fn parse_ignore_file(content: &str) -> Self {
        let patterns: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .collect();
        Self::from_patterns(&patterns)
    }

    /// Merge another matcher's rules into this one, skipping duplicates.
    pub fn merge(&mut self, other: &IgnoreMatcher) {
        for pattern in &other.patterns {
            if !self.patterns.contains(pattern) {
                self.add_pattern(pattern);
            }
        }
    }
}

/// Uncompiled form of [`IgnoreMatcher::is_excluded`].
pub fn is_excluded<S: AsRef<str>>(relative_path: &str, patterns: &[S]) -> bool {
    IgnoreMatcher::from_patterns(patterns).is_excluded(Path::new(relative_path))
}
