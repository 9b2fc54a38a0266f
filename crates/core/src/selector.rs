//! Property column selection by name pattern.
//!
//! A column is carried forward when its name contains one of the configured
//! property substrings or starts with the context prefix. Exclusion patterns
//! are applied last and always win over inclusion.

use crate::relation::Column;

/// Prefix of the structured-metadata column family.
pub const CONTEXT_PREFIX: &str = "context_";

/// Selection rule over column names.
#[derive(Debug, Clone, Copy)]
pub struct PropertySelector<'a> {
    pub patterns: &'a [String],
    pub context_prefix: &'a str,
    pub exclude: &'a [String],
}

impl<'a> PropertySelector<'a> {
    pub fn new(patterns: &'a [String]) -> Self {
        Self {
            patterns,
            context_prefix: CONTEXT_PREFIX,
            exclude: &[],
        }
    }

    pub fn with_exclude(mut self, exclude: &'a [String]) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        let included = name.starts_with(self.context_prefix)
            || self.patterns.iter().any(|p| name.contains(p.as_str()));
        included && !self.exclude.iter().any(|p| name.contains(p.as_str()))
    }

    /// Positions of the selected columns, in input order.
    pub fn select_indices(&self, columns: &[Column]) -> Vec<usize> {
        columns
            .iter()
            .enumerate()
            .filter(|(_, c)| self.matches(&c.name))
            .map(|(i, _)| i)
            .collect()
    }

    /// The selected columns, in input order.
    pub fn select(&self, columns: &[Column]) -> Vec<Column> {
        self.select_indices(columns)
            .into_iter()
            .map(|i| columns[i].clone())
            .collect()
    }
}

/// Convenience wrapper over [`PropertySelector`].
pub fn select(
    columns: &[Column],
    patterns: &[String],
    context_prefix: &str,
    exclude: &[String],
) -> Vec<Column> {
    PropertySelector {
        patterns,
        context_prefix,
        exclude,
    }
    .select(columns)
}
