//! Origin+path URL patterns for recognising third-party resources.

use regex::Regex;
use thiserror::Error;
use tracing::trace;
use url::Url;

/// A pattern failed to compile.
#[derive(Error, Debug)]
#[error("invalid URL pattern `{pattern}`: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// A regular expression matched against a URL's origin followed by its path.
///
/// Query string and fragment are not part of the matched text, so
/// `^https://cdn\.example\.com/lib/` matches
/// `https://cdn.example.com/lib/a.js?v=2`.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    regex: Regex,
}

impl UrlPattern {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(pattern).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex })
    }

    /// The pattern source.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        self.regex.is_match(&match_target(url))
    }
}

/// Ordered list of patterns; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<UrlPattern>,
}

impl PatternSet {
    /// Compile every pattern, failing on the first invalid one.
    pub fn compile<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| UrlPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// First pattern matching `url`, if any.
    pub fn first_match(&self, url: &Url) -> Option<&UrlPattern> {
        let target = match_target(url);
        let hit = self.patterns.iter().find(|p| p.regex.is_match(&target));
        if let Some(pattern) = hit {
            trace!(url = %url, pattern = pattern.as_str(), "URL pattern matched");
        }
        hit
    }

    /// Check if any pattern matches `url`.
    pub fn matches(&self, url: &Url) -> bool {
        self.first_match(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn match_target(url: &Url) -> String {
    format!("{}{}", url.origin().ascii_serialization(), url.path())
}
