//! Session, commit and query configuration.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable that turns on statement logging for the process.
pub const LOG_SQL_ENV: &str = "ENTITYMAP_LOG_SQL";

static QUERY_LOGGING: AtomicBool = AtomicBool::new(false);
static QUERY_LOGGING_ENV: OnceLock<bool> = OnceLock::new();

/// Toggle process-wide logging of executed statements.
pub fn set_query_logging(enabled: bool) {
    QUERY_LOGGING.store(enabled, Ordering::Relaxed);
}

/// Whether executed statements should be logged.
///
/// True when enabled through [`set_query_logging`] or when `ENTITYMAP_LOG_SQL`
/// is set to `1`, `true` or `yes` (read once).
pub fn query_logging_enabled() -> bool {
    QUERY_LOGGING.load(Ordering::Relaxed) || *QUERY_LOGGING_ENV.get_or_init(env_flag)
}

fn env_flag() -> bool {
    std::env::var(LOG_SQL_ENV).is_ok_and(|v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
    })
}

/// Configuration for Session behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Options used by [`Session::commit`](crate::Session::commit).
    pub commit: CommitOptions,
    /// Check the mapping registry when the session is created.
    pub validate_metadata: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the commit options (builder pattern).
    #[must_use]
    pub fn commit(mut self, options: CommitOptions) -> Self {
        self.commit = options;
        self
    }

    /// Set the `validate_metadata` option (builder pattern).
    #[must_use]
    pub fn validate_metadata(mut self, value: bool) -> Self {
        self.validate_metadata = value;
        self
    }
}

/// Options for `UnitOfWork::commit()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOptions {
    /// Leave lifecycle sets untouched after a successful commit and keep the
    /// queued after-hooks instead of running them.
    pub skip_clean: bool,
    /// Do not invoke lifecycle hooks.
    pub skip_lifecycle_hooks: bool,
    /// Re-read inserted entities from storage after commit.
    pub refresh_created: bool,
    /// Re-read updated entities from storage after commit.
    pub refresh_updated: bool,
}

impl CommitOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `skip_clean` option (builder pattern).
    #[must_use]
    pub fn skip_clean(mut self, value: bool) -> Self {
        self.skip_clean = value;
        self
    }

    /// Set the `skip_lifecycle_hooks` option (builder pattern).
    #[must_use]
    pub fn skip_lifecycle_hooks(mut self, value: bool) -> Self {
        self.skip_lifecycle_hooks = value;
        self
    }

    /// Set the `refresh_created` option (builder pattern).
    #[must_use]
    pub fn refresh_created(mut self, value: bool) -> Self {
        self.refresh_created = value;
        self
    }

    /// Set the `refresh_updated` option (builder pattern).
    #[must_use]
    pub fn refresh_updated(mut self, value: bool) -> Self {
        self.refresh_updated = value;
        self
    }
}

/// Options for `Query::get_result()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Properties the caller asked for. Nested properties use `relation.property`.
    pub fields: Option<Vec<String>>,
    /// Relation paths to populate, dot-separated.
    pub populate: Vec<String>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the result to these properties (builder pattern).
    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Add a relation path to populate (builder pattern).
    #[must_use]
    pub fn populate(mut self, path: impl Into<String>) -> Self {
        self.populate.push(path.into());
        self
    }

    /// Whether the result has to be reshaped after hydration.
    pub fn needs_shaping(&self) -> bool {
        self.fields.is_some() && !self.populate.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_options_builder() {
        let options = CommitOptions::new()
            .skip_clean(true)
            .refresh_created(true);
        assert!(options.skip_clean);
        assert!(options.refresh_created);
        assert!(!options.skip_lifecycle_hooks);
        assert!(!options.refresh_updated);
    }

    #[test]
    fn test_shaping_needs_fields_and_populate() {
        assert!(!QueryOptions::new().needs_shaping());
        assert!(!QueryOptions::new().populate("books").needs_shaping());
        assert!(!QueryOptions::new().fields(["name"]).needs_shaping());
        assert!(
            QueryOptions::new()
                .fields(["name", "books.title"])
                .populate("books")
                .needs_shaping()
        );
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = SessionConfig::new()
            .validate_metadata(true)
            .commit(CommitOptions::new().refresh_updated(true));
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_query_logging_toggle() {
        set_query_logging(true);
        assert!(query_logging_enabled());
        set_query_logging(false);
    }
}
