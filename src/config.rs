//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Fetch cycle scheduling and provider limits.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Delay between scheduled fetch cycles.
    pub interval: Duration,
    /// Maximum unread envelopes listed per account per cycle.
    pub max_messages: usize,
    /// Deadline for each mail provider call.
    pub provider_timeout: Duration,
    /// Ask providers for unread mail only.
    pub unread_only: bool,
    /// Stopped tenants idle for this long are evicted from memory.
    pub idle_eviction: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300), // 5 minutes
            max_messages: 25,
            provider_timeout: Duration::from_secs(30),
            unread_only: true,
            idle_eviction: Duration::from_secs(3600),
        }
    }
}

/// Director/agent conversation limits.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Hard cap on LLM iterations per conversation run.
    pub max_iterations: u32,
    /// Deadline for each LLM conversation step.
    pub step_timeout: Duration,
    /// Default agent session inactivity timeout.
    pub session_timeout_minutes: i64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            step_timeout: Duration::from_secs(120),
            session_timeout_minutes: 15,
        }
    }
}

/// Trace recording toggles and caps.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Record and persist traces at all.
    pub enabled: bool,
    /// Attach request/response payloads to spans.
    pub verbose: bool,
    /// Byte budget for one serialized payload.
    pub max_payload_bytes: usize,
    /// Span cap per trace.
    pub max_spans: usize,
    /// Persisted traces kept per tenant.
    pub max_traces: usize,
    /// Field names whose values are redacted (case-insensitive).
    pub sensitive_fields: Vec<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verbose: false,
            max_payload_bytes: 16 * 1024,
            max_spans: 256,
            max_traces: 200,
            sensitive_fields: [
                "access_token",
                "refresh_token",
                "password",
                "authorization",
                "api_key",
                "secret",
                "credentials",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Log retention policy.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Entries older than this many days are dropped.
    pub ttl_days: i64,
    /// Hard cap on retained entries.
    pub max_entries: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            max_entries: 1000,
        }
    }
}

/// Binary-only settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub database_path: PathBuf,
    /// Tenants whose fetch loop starts on boot.
    pub tenants: Vec<String>,
    /// Directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            database_path: PathBuf::from("./data/mail-director.db"),
            tenants: Vec::new(),
            log_dir: None,
        }
    }
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub fetcher: FetcherConfig,
    pub conversation: ConversationConfig,
    pub trace: TraceConfig,
    pub retention: RetentionConfig,
    pub server: ServerConfig,
}

impl OrchestratorConfig {
    /// Build configuration from `MAIL_DIRECTOR_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let fetcher = FetcherConfig {
            interval: Duration::from_secs(env_or(
                "MAIL_DIRECTOR_FETCH_INTERVAL_SECS",
                defaults.fetcher.interval.as_secs(),
            )),
            max_messages: env_or("MAIL_DIRECTOR_MAX_MESSAGES", defaults.fetcher.max_messages),
            provider_timeout: Duration::from_secs(env_or(
                "MAIL_DIRECTOR_PROVIDER_TIMEOUT_SECS",
                defaults.fetcher.provider_timeout.as_secs(),
            )),
            unread_only: env_or("MAIL_DIRECTOR_UNREAD_ONLY", defaults.fetcher.unread_only),
            idle_eviction: Duration::from_secs(env_or(
                "MAIL_DIRECTOR_IDLE_EVICTION_SECS",
                defaults.fetcher.idle_eviction.as_secs(),
            )),
        };

        let conversation = ConversationConfig {
            max_iterations: env_or(
                "MAIL_DIRECTOR_MAX_ITERATIONS",
                defaults.conversation.max_iterations,
            ),
            step_timeout: Duration::from_secs(env_or(
                "MAIL_DIRECTOR_STEP_TIMEOUT_SECS",
                defaults.conversation.step_timeout.as_secs(),
            )),
            session_timeout_minutes: env_or(
                "MAIL_DIRECTOR_SESSION_TIMEOUT_MINUTES",
                defaults.conversation.session_timeout_minutes,
            ),
        };

        let sensitive_fields = std::env::var("MAIL_DIRECTOR_TRACE_SENSITIVE_FIELDS")
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.trace.sensitive_fields);

        let trace = TraceConfig {
            enabled: env_or("MAIL_DIRECTOR_TRACE_ENABLED", defaults.trace.enabled),
            verbose: env_or("MAIL_DIRECTOR_TRACE_VERBOSE", defaults.trace.verbose),
            max_payload_bytes: env_or(
                "MAIL_DIRECTOR_TRACE_MAX_PAYLOAD_BYTES",
                defaults.trace.max_payload_bytes,
            ),
            max_spans: env_or("MAIL_DIRECTOR_TRACE_MAX_SPANS", defaults.trace.max_spans),
            max_traces: env_or("MAIL_DIRECTOR_TRACE_MAX_TRACES", defaults.trace.max_traces),
            sensitive_fields,
        };

        let retention = RetentionConfig {
            ttl_days: env_or("MAIL_DIRECTOR_LOG_TTL_DAYS", defaults.retention.ttl_days),
            max_entries: env_or(
                "MAIL_DIRECTOR_LOG_MAX_ENTRIES",
                defaults.retention.max_entries,
            ),
        };

        let server = ServerConfig {
            bind: std::env::var("MAIL_DIRECTOR_BIND").unwrap_or(defaults.server.bind),
            database_path: std::env::var("MAIL_DIRECTOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.server.database_path),
            tenants: std::env::var("MAIL_DIRECTOR_TENANTS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            log_dir: std::env::var("MAIL_DIRECTOR_LOG_DIR").ok().map(PathBuf::from),
        };

        Self {
            fetcher,
            conversation,
            trace,
            retention,
            server,
        }
    }
}

impl OrchestratorConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.fetcher.interval.is_zero() {
            return Err(invalid("MAIL_DIRECTOR_FETCH_INTERVAL_SECS", "must be greater than zero"));
        }
        if self.fetcher.max_messages == 0 {
            return Err(invalid("MAIL_DIRECTOR_MAX_MESSAGES", "must be greater than zero"));
        }
        if self.fetcher.provider_timeout.is_zero() {
            return Err(invalid("MAIL_DIRECTOR_PROVIDER_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.conversation.max_iterations == 0 {
            return Err(invalid("MAIL_DIRECTOR_MAX_ITERATIONS", "must be greater than zero"));
        }
        if self.conversation.step_timeout.is_zero() {
            return Err(invalid("MAIL_DIRECTOR_STEP_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.conversation.session_timeout_minutes <= 0 {
            return Err(invalid("MAIL_DIRECTOR_SESSION_TIMEOUT_MINUTES", "must be positive"));
        }
        if self.retention.ttl_days <= 0 {
            return Err(invalid("MAIL_DIRECTOR_LOG_TTL_DAYS", "must be positive"));
        }
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "MAIL_DIRECTOR_BIND".to_string(),
                hint: "Set a listen address such as 0.0.0.0:8080".to_string(),
            });
        }
        Ok(())
    }
}

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.fetcher.interval, Duration::from_secs(300));
        assert_eq!(config.conversation.max_iterations, 8);
        assert_eq!(config.conversation.session_timeout_minutes, 15);
        assert_eq!(config.retention.ttl_days, 7);
        assert!(config.trace.enabled);
        assert!(!config.trace.verbose);
    }

    #[test]
    fn defaults_validate() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.fetcher.interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MAIL_DIRECTOR_FETCH_INTERVAL_SECS"));
    }

    #[test]
    fn split_list_trims_and_drops_empty() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        // SAFETY: test-only variable name, not read by any other test.
        unsafe { std::env::set_var("MAIL_DIRECTOR_TEST_GARBAGE", "not-a-number") };
        assert_eq!(env_or("MAIL_DIRECTOR_TEST_GARBAGE", 42u32), 42);
        unsafe { std::env::remove_var("MAIL_DIRECTOR_TEST_GARBAGE") };
    }
}
