//! Backup set include and exclude rules.

use crate::error::{CoreError, CoreResult};
use glob::Pattern;

/// Which paths a backup set covers.
///
/// A path is included when it lies under one of the roots and neither it
/// nor any of its ancestors matches an exclude pattern.
#[derive(Debug, Clone, Default)]
pub struct IncludeRules {
    roots: Vec<String>,
    excludes: Vec<Pattern>,
}

impl IncludeRules {
    /// Creates rules covering `roots` with no exclusions.
    #[must_use]
    pub fn new<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            excludes: Vec::new(),
        }
    }

    /// Adds a glob exclude pattern matched against whole paths.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if the pattern does not parse.
    pub fn exclude(mut self, pattern: &str) -> CoreResult<Self> {
        let compiled = Pattern::new(pattern).map_err(|err| {
            CoreError::invalid_state(format!("invalid exclude pattern {pattern:?}: {err}"))
        })?;
        self.excludes.push(compiled);
        Ok(self)
    }

    /// Returns the scan roots.
    #[must_use]
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Returns true if `path` lies under a root and is not excluded.
    #[must_use]
    pub fn is_included(&self, path: &str) -> bool {
        self.roots.iter().any(|root| is_under(path, root))
            && !ancestors(path).any(|p| self.excludes.iter().any(|pattern| pattern.matches(p)))
    }
}

/// `path` followed by each of its ancestors.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let parents = path
        .match_indices('/')
        .filter(|&(at, _)| at > 0)
        .map(move |(at, _)| &path[..at]);
    std::iter::once(path).chain(parents)
}

fn is_under(path: &str, root: &str) -> bool {
    match path.strip_prefix(root) {
        Some("") => true,
        Some(rest) => root.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// A named set of paths backed up together.
#[derive(Debug, Clone)]
pub struct BackupSet {
    /// Set id; scan state is stored under it.
    pub id: String,
    /// Paths the set covers.
    pub rules: IncludeRules,
}

impl BackupSet {
    /// Creates a backup set.
    #[must_use]
    pub fn new(id: impl Into<String>, rules: IncludeRules) -> Self {
        Self {
            id: id.into(),
            rules,
        }
    }
}
