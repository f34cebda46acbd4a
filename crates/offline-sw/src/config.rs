//! Worker configuration and scope resolution.
//!
//! [`WorkerSettings`] is the serializable input (app prefix, version tag,
//! precache manifest, runtime patterns). Resolving it against the
//! registration scope produces the immutable [`WorkerConfig`] every handler
//! receives.

use std::path::Path;

use offline_net::{PatternError, PatternSet, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Origin;

/// Relative paths precached at install time. `""` is the app root.
pub const DEFAULT_PRECACHE: &[&str] = &["", "index.html", "manifest.webmanifest", "gif.worker.js"];

/// Third-party CDN hosts served cache-first.
pub const DEFAULT_RUNTIME_PATTERNS: &[&str] = &[
    r"^https://fonts\.googleapis\.com/",
    r"^https://fonts\.gstatic\.com/",
    r"^https://cdn\.jsdelivr\.net/",
    r"^https://unpkg\.com/",
    r"^https://cdnjs\.cloudflare\.com/",
    r"^https://esm\.sh/",
];

/// Path of the app shell page, relative to the base prefix.
pub const SHELL_PAGE: &str = "index.html";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid registration scope `{scope}`: {reason}")]
    InvalidScope { scope: String, reason: String },

    #[error("Invalid precache entry `{0}`")]
    InvalidPrecache(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serializable worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Prefix shared by every cache store this app owns.
    pub app_prefix: String,

    /// Build version tag; bumping it is what invalidates caches.
    pub version: String,

    /// Paths precached at install, relative to the base prefix.
    pub precache: Vec<String>,

    /// Regular expressions over origin+path for cache-first CDN resources.
    pub runtime_patterns: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            app_prefix: "app-shell".to_string(),
            version: "v1".to_string(),
            precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
            runtime_patterns: DEFAULT_RUNTIME_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl WorkerSettings {
    /// Default settings with a different version tag.
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    /// Parse settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Name of the cache store for this version.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.app_prefix, self.version)
    }
}

/// Resolved, immutable worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Registration scope.
    pub scope: Url,
    /// The worker's own origin.
    pub origin: Origin,
    /// Path prefix all same-origin decisions are relative to. Ends with `/`.
    pub base_prefix: String,
    pub app_prefix: String,
    pub version: String,
    /// `"<app-prefix>-<version>"`.
    pub cache_name: String,
    /// Absolute precache URLs, in manifest order.
    pub precache_urls: Vec<Url>,
    /// Key under which the latest navigation response is kept.
    pub shell_url: Url,
    pub runtime_patterns: PatternSet,
}

impl WorkerConfig {
    /// Resolve `settings` against the registration scope.
    pub fn resolve(settings: &WorkerSettings, scope: &str) -> Result<Self, ConfigError> {
        if settings.app_prefix.is_empty() {
            return Err(ConfigError::Invalid("app_prefix is empty".into()));
        }
        if settings.version.is_empty() {
            return Err(ConfigError::Invalid("version is empty".into()));
        }

        let scope_url = Url::parse(scope).map_err(|e| ConfigError::InvalidScope {
            scope: scope.to_string(),
            reason: e.to_string(),
        })?;
        if scope_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidScope {
                scope: scope.to_string(),
                reason: "not a hierarchical URL".into(),
            });
        }

        let base_prefix = base_prefix(scope);
        let base = scope_url
            .join(&base_prefix)
            .map_err(|e| ConfigError::InvalidScope {
                scope: scope.to_string(),
                reason: e.to_string(),
            })?;

        let precache_urls = settings
            .precache
            .iter()
            .map(|path| {
                resolve_relative(&base, path)
                    .ok_or_else(|| ConfigError::InvalidPrecache(path.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let shell_url = resolve_relative(&base, SHELL_PAGE)
            .ok_or_else(|| ConfigError::InvalidPrecache(SHELL_PAGE.to_string()))?;

        Ok(Self {
            origin: scope_url.origin(),
            scope: scope_url,
            base_prefix,
            app_prefix: settings.app_prefix.clone(),
            version: settings.version.clone(),
            cache_name: settings.cache_name(),
            precache_urls,
            shell_url,
            runtime_patterns: PatternSet::compile(&settings.runtime_patterns)?,
        })
    }

    /// Whether `name` belongs to this app but not to the current version.
    pub fn is_stale_cache(&self, name: &str) -> bool {
        name != self.cache_name
            && name
                .strip_prefix(self.app_prefix.as_str())
                .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Whether `url` is same-origin and under the base prefix.
    pub fn is_in_scope(&self, url: &Url) -> bool {
        url.origin() == self.origin && url.path().starts_with(&self.base_prefix)
    }
}

/// Base prefix for a registration scope: its path, with a trailing `/`.
///
/// A scope that does not parse as a hierarchical URL yields `/`.
pub fn base_prefix(scope: &str) -> String {
    let path = match Url::parse(scope) {
        Ok(url) if !url.cannot_be_a_base() => url.path().to_string(),
        _ => return "/".to_string(),
    };
    if path.ends_with('/') {
        path
    } else {
        format!("{path}/")
    }
}

// Only plain relative paths; absolute URLs or `..` would escape the base.
fn resolve_relative(base: &Url, path: &str) -> Option<Url> {
    if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return None;
    }
    let url = base.join(path).ok()?;
    (url.origin() == base.origin() && url.path().starts_with(base.path())).then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_prefix_appends_separator() {
        assert_eq!(base_prefix("https://example.com/gif"), "/gif/");
        assert_eq!(base_prefix("https://example.com/gif/"), "/gif/");
        assert_eq!(base_prefix("https://example.com"), "/");
        assert_eq!(base_prefix("https://example.com/a/b/c"), "/a/b/c/");
    }

    #[test]
    fn test_base_prefix_malformed_falls_back_to_root() {
        assert_eq!(base_prefix("not a url"), "/");
        assert_eq!(base_prefix(""), "/");
        assert_eq!(base_prefix("mailto:someone@example.com"), "/");
    }

    #[test]
    fn test_base_prefix_always_ends_with_separator() {
        for scope in [
            "https://example.com/x",
            "https://example.com/x/",
            "https://example.com/x/y?q=1",
            "https://example.com/#frag",
            "::::",
        ] {
            assert!(base_prefix(scope).ends_with('/'), "{scope}");
        }
    }

    #[test]
    fn test_resolve_default_manifest() {
        let config =
            WorkerConfig::resolve(&WorkerSettings::default(), "https://example.com/gif").unwrap();

        assert_eq!(config.base_prefix, "/gif/");
        assert_eq!(config.cache_name, "app-shell-v1");
        let urls: Vec<&str> = config.precache_urls.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/gif/",
                "https://example.com/gif/index.html",
                "https://example.com/gif/manifest.webmanifest",
                "https://example.com/gif/gif.worker.js",
            ]
        );
        assert_eq!(config.shell_url.as_str(), "https://example.com/gif/index.html");
        assert_eq!(config.runtime_patterns.len(), 6);
    }

    #[test]
    fn test_resolve_rejects_escaping_precache_entry() {
        let settings = WorkerSettings {
            precache: vec!["../secret".into()],
            ..Default::default()
        };
        assert!(matches!(
            WorkerConfig::resolve(&settings, "https://example.com/app/"),
            Err(ConfigError::InvalidPrecache(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_bad_pattern() {
        let settings = WorkerSettings {
            runtime_patterns: vec!["(".into()],
            ..Default::default()
        };
        assert!(matches!(
            WorkerConfig::resolve(&settings, "https://example.com/"),
            Err(ConfigError::Pattern(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_unparseable_scope() {
        assert!(matches!(
            WorkerConfig::resolve(&WorkerSettings::default(), "nope"),
            Err(ConfigError::InvalidScope { .. })
        ));
    }

    #[test]
    fn test_origin_less_scope_has_prefix_but_no_config() {
        let scope = "mailto:someone@example.com";
        assert_eq!(base_prefix(scope), "/");
        assert!(matches!(
            WorkerConfig::resolve(&WorkerSettings::default(), scope),
            Err(ConfigError::InvalidScope { .. })
        ));
    }

    #[test]
    fn test_stale_cache_detection() {
        let config =
            WorkerConfig::resolve(&WorkerSettings::with_version("v3"), "https://example.com/")
                .unwrap();
        assert!(!config.is_stale_cache("app-shell-v3"));
        assert!(config.is_stale_cache("app-shell-v2"));
        assert!(!config.is_stale_cache("app-shellish-v2"));
        assert!(!config.is_stale_cache("other-v1"));
    }

    #[test]
    fn test_in_scope() {
        let config =
            WorkerConfig::resolve(&WorkerSettings::default(), "https://example.com/gif/").unwrap();
        assert!(config.is_in_scope(&Url::parse("https://example.com/gif/app.js").unwrap()));
        assert!(!config.is_in_scope(&Url::parse("https://example.com/other.js").unwrap()));
        assert!(!config.is_in_scope(&Url::parse("http://example.com/gif/app.js").unwrap()));
    }

    #[test]
    fn test_settings_from_json_fills_defaults() {
        let settings = WorkerSettings::from_json(r#"{"version": "2024-06-01"}"#).unwrap();
        assert_eq!(settings.version, "2024-06-01");
        assert_eq!(settings.app_prefix, "app-shell");
        assert_eq!(settings.precache.len(), 4);
        assert_eq!(settings.cache_name(), "app-shell-2024-06-01");
    }

    #[test]
    fn test_settings_from_invalid_json() {
        assert!(matches!(
            WorkerSettings::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
