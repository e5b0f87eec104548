//! Configuration types.
//!
//! Everything is read from environment variables. `from_lookup` takes an
//! arbitrary key lookup so tests never have to mutate the process env.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::dispatch::retry::LocalRetry;
use crate::error::ConfigError;
use crate::identity::IdentitySources;
use crate::notify::NotifierConfig;
use crate::translate::TranslatorConfig;

/// Research page used to confirm that saved cookies still log in.
pub const DEFAULT_CHECK_URL: &str = concat!(
    "https://www.ebay.com/sh/research?marketplace=EBAY-US&keywords=%28-abcd%29",
    "&dayRange=30&categoryId=293&conditionId=3000&format=FIXED_PRICE",
    "&minPrice=100&maxPrice=200&sellerCountry=SellerLocation%3A%3A%3AJP",
    "&offset=0&limit=50&tabName=SOLD&tz=Asia%2FTokyo",
);

/// Settings shared by every worker pool of one stage.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Concurrent workers (one session each) per identity.
    pub workers_per_identity: usize,
    /// Delay applied on a worker after each successful task.
    pub pacing: Duration,
    /// Same-worker retry budget for transient failures.
    pub local_retry: LocalRetry,
    /// Outer bound on a single attempt; expiry counts as transient.
    pub task_timeout: Duration,
    /// Maximum distribution rounds per stage, initial round included.
    pub max_rounds: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers_per_identity: 2,
            pacing: Duration::from_millis(5_000),
            local_retry: LocalRetry::default(),
            task_timeout: Duration::from_secs(300),
            max_rounds: 3,
        }
    }
}

impl PoolSettings {
    /// Copy of these settings with a different worker count.
    pub fn with_workers(&self, workers_per_identity: usize) -> Self {
        Self {
            workers_per_identity,
            ..self.clone()
        }
    }
}

/// Harvester configuration.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Port for the job submission server.
    pub port: u16,
    /// Pool settings for link, keyword, and TURL stages.
    pub pool: PoolSettings,
    /// Enrichment chunk size for the Mercari catalog.
    pub mercari_workers: usize,
    /// Enrichment chunk size for the Yahoo catalog.
    pub yahoo_workers: usize,
    /// Delay between the keyword-extraction and translation calls.
    pub translate_pacing: Duration,
    /// Where identity profiles, cookies, and proxies live.
    pub sources: IdentitySources,
    /// Directory for CSV snapshots.
    pub output_dir: PathBuf,
    /// Optional libSQL mirror of the output snapshot.
    pub db_path: Option<PathBuf>,
    /// Page used by the credential check.
    pub check_url: String,
    /// AI mode settings (absent when no API key is configured).
    pub translator: Option<TranslatorConfig>,
    /// SMTP notifier settings.
    pub notifier: NotifierConfig,
    /// Browser launch settings.
    pub browser: BrowserSettings,
}

/// How browsers are launched.
#[derive(Debug, Clone, Default)]
pub struct BrowserSettings {
    /// Chrome/Chromium binary; auto-detected when unset.
    pub executable: Option<PathBuf>,
    /// Show browser windows instead of running headless.
    pub headful: bool,
}

impl HarvestConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&get);
        let defaults = PoolSettings::default();

        let pool = PoolSettings {
            workers_per_identity: env.parse_or("HARVEST_WORKERS_PER_IDENTITY", 2usize)?,
            pacing: env.millis_or("HARVEST_PACING_MS", defaults.pacing)?,
            local_retry: LocalRetry {
                attempts: env
                    .parse_or("HARVEST_LOCAL_RETRY_ATTEMPTS", defaults.local_retry.attempts)?,
                delay: env.millis_or("HARVEST_LOCAL_RETRY_DELAY_MS", defaults.local_retry.delay)?,
            },
            task_timeout: Duration::from_secs(env.parse_or("HARVEST_TASK_TIMEOUT_SECS", 300u64)?),
            max_rounds: env.parse_or("HARVEST_MAX_ROUNDS", defaults.max_rounds)?,
        };
        if pool.workers_per_identity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HARVEST_WORKERS_PER_IDENTITY".into(),
                message: "must be at least 1".into(),
            });
        }
        if pool.max_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HARVEST_MAX_ROUNDS".into(),
                message: "must be at least 1".into(),
            });
        }

        let sources = IdentitySources {
            users_file: env.path_or("HARVEST_USERS_FILE", "users.json"),
            cookie_dir: env.path_or("HARVEST_COOKIE_DIR", "cookie"),
            proxies_file: env.path_or("HARVEST_PROXIES_FILE", "proxies.json"),
        };

        let translator = env.get("OPENAI_API_KEY").map(|key| TranslatorConfig {
            api_key: SecretString::from(key),
            keyword_model: env
                .get("HARVEST_KEYWORD_MODEL")
                .unwrap_or_else(|| "gpt-4o".to_string()),
            translate_model: env
                .get("HARVEST_TRANSLATE_MODEL")
                .unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
        });

        let smtp_host = env.require("SMTP_HOST")?;
        let username = env.get("SMTP_USERNAME").unwrap_or_default();
        let notifier = NotifierConfig {
            smtp_host,
            smtp_port: env.parse_or("SMTP_PORT", 587u16)?,
            from_address: env.get("SENDER_EMAIL").unwrap_or_else(|| username.clone()),
            username,
            password: SecretString::from(env.get("SMTP_PASSWORD").unwrap_or_default()),
            attempts: env.parse_or("HARVEST_NOTIFY_ATTEMPTS", 3u32)?,
            backoff: Duration::from_secs(env.parse_or("HARVEST_NOTIFY_BACKOFF_SECS", 60u64)?),
        };

        Ok(Self {
            port: env.parse_or("HARVEST_PORT", 3000u16)?,
            mercari_workers: env.parse_or("HARVEST_MERCARI_WORKERS", 3usize)?,
            yahoo_workers: env.parse_or("HARVEST_YAHOO_WORKERS", 3usize)?,
            translate_pacing: env
                .millis_or("HARVEST_TRANSLATE_PACING_MS", Duration::from_millis(8_000))?,
            pool,
            sources,
            output_dir: env.path_or("HARVEST_OUTPUT_DIR", "."),
            db_path: env.get("HARVEST_DB_PATH").map(PathBuf::from),
            check_url: env
                .get("HARVEST_CHECK_URL")
                .unwrap_or_else(|| DEFAULT_CHECK_URL.to_string()),
            translator,
            notifier,
            browser: BrowserSettings {
                executable: env.get("CHROMIUM_PATH").map(PathBuf::from),
                headful: env.parse_or("HARVEST_HEADFUL", false)?,
            },
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse_or(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }

    fn path_or(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get(key).unwrap_or_else(|| default.to_string()))
    }
}
