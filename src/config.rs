use crate::core::{Result, SagaError};
use crate::definition::RecoveryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Saga actuator configuration
///
/// Mirrors the `saga.properties` key set; every field can also be set
/// through the builder methods.
#[derive(Debug, Clone)]
pub struct SagaConfiguration {
    /// Worker pool size for saga execution (0 = unbounded)
    pub executor_size: usize,

    /// Retries for a failed forward statement
    pub transaction_max_retries: u32,

    /// Retries for a failed compensation statement
    pub compensation_max_retries: u32,

    /// Delay between forward retries
    pub transaction_retry_delay: Duration,

    /// Delay between compensation retries
    pub compensation_retry_delay: Duration,

    /// What to do when a branch failed by commit time
    pub recovery_policy: RecoveryPolicy,

    /// Saga event / snapshot log
    pub persistence: PersistenceConfig,
}

impl SagaConfiguration {
    pub fn new() -> Self {
        Self {
            executor_size: 0,
            transaction_max_retries: 5,
            compensation_max_retries: 5,
            transaction_retry_delay: Duration::from_millis(5000),
            compensation_retry_delay: Duration::from_millis(3000),
            recovery_policy: RecoveryPolicy::Backward,
            persistence: PersistenceConfig::default(),
        }
    }

    pub fn executor_size(mut self, size: usize) -> Self {
        self.executor_size = size;
        self
    }

    pub fn transaction_max_retries(mut self, retries: u32) -> Self {
        self.transaction_max_retries = retries;
        self
    }

    pub fn compensation_max_retries(mut self, retries: u32) -> Self {
        self.compensation_max_retries = retries;
        self
    }

    pub fn transaction_retry_delay(mut self, delay: Duration) -> Self {
        self.transaction_retry_delay = delay;
        self
    }

    pub fn compensation_retry_delay(mut self, delay: Duration) -> Self {
        self.compensation_retry_delay = delay;
        self
    }

    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    pub fn persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Parse a `saga.properties` document
    ///
    /// Unknown keys are ignored so one file can carry settings for other
    /// components.
    ///
    /// ```ignore
    /// let config = SagaConfiguration::from_properties(
    ///     "saga.actuator.executor.size=8\nsaga.actuator.recovery.policy=ForwardRecovery",
    /// )?;
    /// ```
    pub fn from_properties(text: &str) -> Result<Self> {
        let mut config = Self::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
                return Err(SagaError::Config(format!(
                    "line {}: expected key=value, got '{}'",
                    line_no + 1,
                    line
                )));
            };
            config.apply_property(key.trim(), value.trim())?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_property(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "saga.actuator.executor.size" => self.executor_size = parse_number(key, value)?,
            "saga.actuator.transaction.max.retries" => {
                self.transaction_max_retries = parse_number(key, value)?
            }
            "saga.actuator.compensation.max.retries" => {
                self.compensation_max_retries = parse_number(key, value)?
            }
            "saga.actuator.transaction.retry.delay.milliseconds" => {
                self.transaction_retry_delay = parse_millis(key, value)?
            }
            "saga.actuator.compensation.retry.delay.milliseconds" => {
                self.compensation_retry_delay = parse_millis(key, value)?
            }
            "saga.actuator.recovery.policy" => {
                self.recovery_policy = value.parse()?;
            }
            "saga.persistence.enabled" => {
                self.persistence.enabled = parse_bool(key, value)?;
            }
            "saga.persistence.ds.url" => self.persistence.url = Some(value.to_string()),
            "saga.persistence.ds.username" => self.persistence.username = value.to_string(),
            "saga.persistence.ds.password" => self.persistence.password = value.to_string(),
            "saga.persistence.ds.max.pool.size" => {
                self.persistence.max_pool_size = parse_number(key, value)?
            }
            "saga.persistence.ds.min.pool.size" => {
                self.persistence.min_pool_size = parse_number(key, value)?
            }
            "saga.persistence.ds.connection.timeout.milliseconds" => {
                self.persistence.connection_timeout = parse_millis(key, value)?
            }
            "saga.persistence.ds.idle.timeout.milliseconds" => {
                self.persistence.idle_timeout = parse_millis(key, value)?
            }
            "saga.persistence.ds.max.lifetime.milliseconds" => {
                self.persistence.max_lifetime = parse_millis(key, value)?
            }
            "saga.persistence.ds.maintenance.interval.milliseconds" => {
                self.persistence.maintenance_interval = parse_millis(key, value)?
            }
            _ => log::debug!("Ignoring unknown saga property '{}'", key),
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.persistence.validate()
    }
}

impl Default for SagaConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

/// Where saga events and branch snapshots are recorded.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub enabled: bool,

    /// Location of the log. A `file:` prefix is stripped; anything else is
    /// treated as a directory path.
    pub url: Option<String>,

    pub username: String,

    pub password: String,

    pub max_pool_size: usize,

    pub min_pool_size: usize,

    pub connection_timeout: Duration,

    pub idle_timeout: Duration,

    pub max_lifetime: Duration,

    pub maintenance_interval: Duration,
}

impl PersistenceConfig {
    pub fn new() -> Self {
        Self {
            enabled: false,
            url: None,
            username: "root".to_string(),
            password: String::new(),
            max_pool_size: 50,
            min_pool_size: 1,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(1800),
            maintenance_interval: Duration::from_secs(30),
        }
    }

    /// Enabled persistence rooted at `dir`
    pub fn file<P: Into<PathBuf>>(dir: P) -> Self {
        let dir: PathBuf = dir.into();
        Self {
            enabled: true,
            url: Some(dir.to_string_lossy().into_owned()),
            ..Self::new()
        }
    }

    pub fn max_pool_size(mut self, max: usize) -> Self {
        self.max_pool_size = max;
        self
    }

    pub fn min_pool_size(mut self, min: usize) -> Self {
        self.min_pool_size = min;
        self
    }

    /// Directory the file-backed log writes into, if any.
    pub fn directory(&self) -> Option<PathBuf> {
        self.url.as_ref().map(|url| {
            let path = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:")).unwrap_or(url);
            PathBuf::from(path)
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.url.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(SagaError::Config(
                "saga persistence is enabled but no location is configured".to_string(),
            ));
        }

        if self.max_pool_size == 0 {
            return Err(SagaError::Config("max_pool_size must be > 0".to_string()));
        }

        if self.min_pool_size > self.max_pool_size {
            return Err(SagaError::Config(
                "min_pool_size cannot exceed max_pool_size".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| SagaError::Config(format!("{}: '{}' is not a valid number", key, value)))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(SagaError::Config(format!("{}: '{}' is not a boolean", key, value))),
    }
}
