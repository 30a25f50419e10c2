use regex::Regex;

/// Path rewrite rule: a regex with a named capture group and a `${name}` template.
///
/// Only the path component is rewritten; callers keep the query string aside
/// and re-attach it after rewriting.
#[derive(Debug, Clone)]
pub struct PathRewrite {
    pattern: Regex,
    replacement: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("invalid rewrite pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rewrite pattern '{0}' has no named capture group")]
    NoNamedGroup(String),

    #[error("path '{path}' does not match rewrite pattern '{pattern}'")]
    Mismatch { path: String, pattern: String },
}

impl PathRewrite {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, RewriteError> {
        let regex = Regex::new(pattern).map_err(|source| RewriteError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        if regex.capture_names().flatten().next().is_none() {
            return Err(RewriteError::NoNamedGroup(pattern.to_string()));
        }
        Ok(Self {
            pattern: regex,
            replacement: replacement.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &str {
        self.replacement.as_str()
    }

    /// Rewrite `path`. A path that matched the route glob but not this pattern
    /// means the route table is inconsistent, which is reported as a mismatch.
    pub fn apply(&self, path: &str) -> Result<String, RewriteError> {
        if !self.pattern.is_match(path) {
            return Err(RewriteError::Mismatch {
                path: path.to_string(),
                pattern: self.pattern.as_str().to_string(),
            });
        }
        Ok(self
            .pattern
            .replace(path, self.replacement.as_str())
            .into_owned())
    }
}
