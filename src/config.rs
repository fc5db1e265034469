//! Configuration types, read from environment variables.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::channels::facebook::FacebookConfig;
use crate::channels::gmail::GmailConfig;
use crate::channels::http::RetryPolicy;
use crate::channels::linkedin::LinkedInConfig;
use crate::channels::twitter::TwitterConfig;
use crate::channels::whatsapp::WhatsAppConfig;
use crate::error::ConfigError;
use crate::scheduler::SchedulerConfig;
use crate::sensitivity::DEFAULT_THRESHOLD;
use crate::tasks::model::Priority;

/// SLA hours used when a priority has no entry.
pub const DEFAULT_SLA_HOURS: u32 = 24;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// Port for the REST and webhook server.
    pub http_port: u16,
    /// Directory for daily-rotated log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub lifecycle: LifecycleConfig,
    pub retry: RetryPolicy,
    /// Refresh OAuth tokens this long before they expire.
    pub token_refresh_buffer: Duration,
    /// How long shutdown waits for loops before aborting them.
    pub shutdown_grace: Duration,
    pub scheduler: SchedulerConfig,
    pub gmail: Option<GmailConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
    pub linkedin: Option<LinkedInConfig>,
    pub twitter: Option<TwitterConfig>,
    pub facebook: Option<FacebookConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("TASKDESK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/taskdesk.db"));

        let log_dir = std::env::var("TASKDESK_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            db_path,
            http_port: env_or("TASKDESK_HTTP_PORT", 8080),
            log_dir,
            lifecycle: LifecycleConfig::from_env()?,
            retry: RetryPolicy::from_env(),
            token_refresh_buffer: Duration::from_secs(env_or(
                "TASKDESK_TOKEN_REFRESH_BUFFER_SECS",
                300,
            )),
            shutdown_grace: Duration::from_secs(env_or("TASKDESK_SHUTDOWN_GRACE_SECS", 10)),
            scheduler: SchedulerConfig::from_env()?,
            gmail: GmailConfig::from_env(),
            whatsapp: WhatsAppConfig::from_env(),
            linkedin: LinkedInConfig::from_env(),
            twitter: TwitterConfig::from_env(),
            facebook: FacebookConfig::from_env(),
        })
    }
}

/// SLA hours per priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaPolicy {
    hours: BTreeMap<Priority, u32>,
}

impl SlaPolicy {
    pub fn new(hours: impl IntoIterator<Item = (Priority, u32)>) -> Self {
        Self {
            hours: hours.into_iter().collect(),
        }
    }

    /// Hours allowed for `priority`, falling back to [`DEFAULT_SLA_HOURS`].
    pub fn hours_for(&self, priority: Priority) -> u32 {
        self.hours
            .get(&priority)
            .copied()
            .unwrap_or(DEFAULT_SLA_HOURS)
    }
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self::new([
            (Priority::P0, 1),
            (Priority::P1, 4),
            (Priority::P2, 24),
            (Priority::P3, 72),
        ])
    }
}

/// Rules the lifecycle engine applies when creating and routing tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    pub sensitivity_threshold: f64,
    /// Initial autonomy override when none has been persisted yet.
    pub autonomy_mode: bool,
    pub sla: SlaPolicy,
    /// Keywords that can raise a task's priority, matched case-insensitively.
    pub priority_keywords: Vec<(String, Priority)>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sensitivity_threshold: DEFAULT_THRESHOLD,
            autonomy_mode: false,
            sla: SlaPolicy::default(),
            priority_keywords: default_priority_keywords(),
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            sensitivity_threshold: env_or("TASKDESK_SENSITIVITY_THRESHOLD", DEFAULT_THRESHOLD),
            autonomy_mode: env_bool("TASKDESK_AUTONOMY_MODE", false),
            ..Self::default()
        };

        if !(0.0..=1.0).contains(&config.sensitivity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "TASKDESK_SENSITIVITY_THRESHOLD".into(),
                message: format!("{} is outside 0..=1", config.sensitivity_threshold),
            });
        }

        if let Ok(raw) = std::env::var("TASKDESK_SLA_HOURS") {
            let pairs = parse_pairs::<Priority, u32>("TASKDESK_SLA_HOURS", &raw)?;
            config.sla = SlaPolicy::new(pairs);
        }

        if let Ok(raw) = std::env::var("TASKDESK_PRIORITY_KEYWORDS") {
            config.priority_keywords = parse_pairs::<String, Priority>("TASKDESK_PRIORITY_KEYWORDS", &raw)?
                .into_iter()
                .map(|(k, p)| (k.to_lowercase(), p))
                .collect();
        }

        Ok(config)
    }
}

fn default_priority_keywords() -> Vec<(String, Priority)> {
    vec![
        ("urgent".to_string(), Priority::P0),
        ("asap".to_string(), Priority::P1),
        ("critical".to_string(), Priority::P0),
        ("deadline".to_string(), Priority::P1),
    ]
}

// ── Env helpers ─────────────────────────────────────────────────────

/// Parse an env var, falling back to `default` when unset or malformed.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a boolean env var (`1`, `true`, `yes`, `on`).
pub(crate) fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Read a non-empty env var.
pub(crate) fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse `k=v,k=v` lists.
fn parse_pairs<K, V>(key: &str, raw: &str) -> Result<Vec<(K, V)>, ConfigError>
where
    K: FromStr,
    V: FromStr,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected key=value, got '{pair}'"),
            })?;
            let k = k.trim().parse::<K>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("bad key '{k}'"),
            })?;
            let v = v.trim().parse::<V>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("bad value '{v}'"),
            })?;
            Ok((k, v))
        })
        .collect()
}
