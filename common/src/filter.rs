//! Rsync-style include/exclude rules for storage keys
//!
//! Rules keep the order in which they were given, includes and excludes interleaved. A key is
//! checked one path level at a time (`a`, `a/b`, `a/b/c`); at each level the first matching rule
//! decides. An include lets the key continue to the next level, an exclude rejects it, and with it
//! everything below an excluded directory. A key no rule matches is included.
//!
//! # Pattern Syntax
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/` (crosses directories)
//! - `?` matches a single character (except `/`)
//! - `[...]` character classes
//! - Leading `/` anchors to the root of the synced tree
//! - Trailing `/` matches only directories
//!
//! A pattern with N segments is compared with the last N segments of the level being checked.
//!
//! # Examples
//!
//! ```
//! use common::filter::{FilterResult, FilterSettings};
//!
//! let mut settings = FilterSettings::default();
//! settings.add_exclude("*.log").unwrap();
//! settings.add_exclude("target/").unwrap();
//!
//! assert!(matches!(
//!     settings.should_include("logs/debug.log", false),
//!     FilterResult::ExcludedByPattern(_)
//! ));
//! assert!(matches!(
//!     settings.should_include("target/release/osync", false),
//!     FilterResult::ExcludedByPattern(_)
//! ));
//! assert!(matches!(
//!     settings.should_include("src/main.rs", false),
//!     FilterResult::Included
//! ));
//! ```

use anyhow::{Context, anyhow};

/// A compiled filter pattern with metadata about its original form
#[derive(Debug, Clone)]
pub struct FilterPattern {
    /// original pattern string for log output
    pub original: String,
    /// compiled glob matcher
    matcher: globset::GlobMatcher,
    /// pattern ends with / (matches only directories)
    pub dir_only: bool,
    /// pattern starts with / (anchored to root)
    pub anchored: bool,
    /// number of path segments in the pattern
    segments: usize,
    /// pattern contains ** and is matched against the whole path
    crosses_dirs: bool,
}

impl FilterPattern {
    /// Parse a pattern string into a FilterPattern
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let original = pattern.to_string();
        let dir_only = pattern.ends_with('/');
        let anchored = pattern.starts_with('/');
        // strip leading/trailing markers for glob compilation
        let pattern_str = pattern.trim_start_matches('/').trim_end_matches('/');
        if pattern_str.is_empty() {
            return Err(anyhow!(
                "pattern '{}' results in empty glob after stripping / markers",
                pattern
            ));
        }
        let glob = globset::GlobBuilder::new(pattern_str)
            .literal_separator(true) // * doesn't match /
            .build()
            .with_context(|| format!("invalid glob pattern: {}", pattern))?;
        Ok(Self {
            original,
            matcher: glob.compile_matcher(),
            dir_only,
            anchored,
            segments: pattern_str.split('/').count(),
            crosses_dirs: pattern_str.contains("**"),
        })
    }

    /// Check if this pattern matches one level of a key, e.g. `a/b` of `a/b/c`
    pub fn matches(&self, level: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored || self.crosses_dirs {
            return self.matcher.is_match(level);
        }
        let separators = level.matches('/').count();
        if separators + 1 < self.segments {
            return false;
        }
        // keep the last `segments` segments of the level
        let skip = separators + 1 - self.segments;
        let tail = match level.match_indices('/').nth(skip.wrapping_sub(1)) {
            Some((pos, _)) if skip > 0 => &level[pos + 1..],
            _ => level,
        };
        self.matcher.is_match(tail)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleKind {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
pub struct FilterRule {
    pub kind: RuleKind,
    pub pattern: FilterPattern,
}

/// Result of checking whether a key should be included
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    /// key should be processed
    Included,
    /// key was excluded by a specific pattern
    ExcludedByPattern(String),
}

impl FilterResult {
    pub fn is_included(&self) -> bool {
        matches!(self, FilterResult::Included)
    }
}

/// Ordered include/exclude rules
#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
    pub rules: Vec<FilterRule>,
}

impl FilterSettings {
    /// Create new empty filter settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: RuleKind, pattern: &str) -> Result<(), anyhow::Error> {
        self.rules.push(FilterRule {
            kind,
            pattern: FilterPattern::parse(pattern)?,
        });
        Ok(())
    }

    /// Add an include pattern
    pub fn add_include(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.add(RuleKind::Include, pattern)
    }

    /// Add an exclude pattern
    pub fn add_exclude(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.add(RuleKind::Exclude, pattern)
    }

    /// Append all rules of `other` after the rules already present
    pub fn extend(&mut self, other: FilterSettings) {
        self.rules.extend(other.rules);
    }

    /// Determine if a key should be included
    ///
    /// `is_prefix` marks directory placeholders; every level above the last one is a directory.
    pub fn should_include(&self, key: &str, is_prefix: bool) -> FilterResult {
        if self.rules.is_empty() {
            return FilterResult::Included;
        }
        let path = key.trim_end_matches('/');
        let mut level_end = 0;
        while level_end < path.len() {
            level_end = match path[level_end..].find('/') {
                Some(pos) => level_end + pos,
                None => path.len(),
            };
            let level = &path[..level_end];
            let is_dir = level_end < path.len() || is_prefix;
            level_end += 1;
            if level.is_empty() || level.ends_with('/') {
                continue;
            }
            let decision = self
                .rules
                .iter()
                .find(|rule| rule.pattern.matches(level, is_dir));
            if let Some(FilterRule {
                kind: RuleKind::Exclude,
                pattern,
            }) = decision
            {
                return FilterResult::ExcludedByPattern(pattern.original.clone());
            }
        }
        FilterResult::Included
    }

    /// Parse filter settings from a file
    ///
    /// # File Format
    /// ```text
    /// # comments supported
    /// --include *.rs
    /// --include Cargo.toml
    /// --exclude target/
    /// --exclude *.log
    /// ```
    pub fn from_file(path: &std::path::Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file: {:?}", path))?;
        Self::parse_content(&content)
    }

    /// Parse filter settings from a string (filter file format)
    pub fn parse_content(content: &str) -> Result<Self, anyhow::Error> {
        let mut settings = Self::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            // skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_num = line_num + 1; // 1-based for error messages
            if let Some(pattern) = line.strip_prefix("--include ") {
                settings
                    .add_include(pattern.trim())
                    .with_context(|| format!("line {}: invalid include pattern", line_num))?;
            } else if let Some(pattern) = line.strip_prefix("--exclude ") {
                settings
                    .add_exclude(pattern.trim())
                    .with_context(|| format!("line {}: invalid exclude pattern", line_num))?;
            } else {
                return Err(anyhow!(
                    "line {}: invalid syntax '{}', expected '--include PATTERN' or '--exclude PATTERN'",
                    line_num,
                    line
                ));
            }
        }
        Ok(settings)
    }
}
