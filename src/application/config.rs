//! Declarative configuration.
//!
//! [`ThrottleConfig`] mirrors the policy settings in a flat, serde-friendly
//! shape so they can be loaded from a configuration file. Validation happens
//! when it is turned into a [`Policy`] or an engine.

use crate::application::engine::{DecisionEngine, EngineBuilder};
use crate::application::ports::StoreError;
use crate::domain::policy::{
    validate_expiry_secs, ConfigError, Policy, DEFAULT_EXPIRE_MSG, DEFAULT_SUMMARY_MSG,
};
use crate::domain::stream::DefaultStreamStrategy;
use serde::{Deserialize, Serialize};

/// Default key prefix in the shared store.
pub const DEFAULT_REDIS_PREFIX: &str = "stream_throttle";

/// Error returned when building an engine from configuration fails.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A setting has an invalid value.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The shared store could not be reached.
    #[error("failed to connect to stream store: {0}")]
    Store(#[from] StoreError),
    /// A shared store was requested but support was not compiled in.
    #[error("redis_url is set but the `redis-storage` feature is disabled")]
    RedisUnsupported,
    /// Summaries cannot be emitted more often than continuously.
    #[error("summary interval must be greater than 0")]
    ZeroSummaryInterval,
    /// A background task was requested outside a tokio runtime.
    #[error("active emission requires a running tokio runtime")]
    MissingRuntime,
}

/// Flat configuration of a stream limiter.
///
/// # Example
/// ```
/// use stream_throttle::ThrottleConfig;
///
/// let config: ThrottleConfig = serde_json::from_str(
///     r#"{ "period_sec": 30, "allow_next_n": 1, "default_stream_id": "call_site" }"#,
/// ).unwrap();
///
/// let policy = config.policy().unwrap();
/// assert_eq!(policy.period().as_secs(), 30);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Suppression period in seconds. Required.
    pub period_sec: Option<f64>,
    pub default_stream_id: DefaultStreamStrategy,
    pub allow_next_n: u32,
    pub stream_id_max_len: Option<usize>,
    pub expire_check_sec: f64,
    pub expire_offset_sec: f64,
    pub expire_msg: String,
    pub summary: bool,
    pub summary_msg: String,
    pub print_config: bool,
    /// Shared store address. Unset means an in-process store.
    pub redis_url: Option<String>,
    pub redis_prefix: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            period_sec: None,
            default_stream_id: DefaultStreamStrategy::default(),
            allow_next_n: 0,
            stream_id_max_len: None,
            expire_check_sec: 60.0,
            expire_offset_sec: 900.0,
            expire_msg: DEFAULT_EXPIRE_MSG.to_owned(),
            summary: true,
            summary_msg: DEFAULT_SUMMARY_MSG.to_owned(),
            print_config: false,
            redis_url: None,
            redis_prefix: DEFAULT_REDIS_PREFIX.to_owned(),
        }
    }
}

impl ThrottleConfig {
    /// Configuration with the given period and defaults elsewhere.
    pub fn with_period_secs(period_sec: f64) -> Self {
        Self {
            period_sec: Some(period_sec),
            ..Self::default()
        }
    }

    /// Validate and convert into a policy.
    ///
    /// # Errors
    /// Returns a `ConfigError` naming the first invalid setting.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        let period_sec = self.period_sec.ok_or(ConfigError::MissingPeriod)?;
        let mut policy = Policy::from_secs_f64(period_sec)?
            .with_default_stream_id(self.default_stream_id)
            .with_allow_next_n(self.allow_next_n)
            .with_expire_check(validate_expiry_secs("expire_check_sec", self.expire_check_sec)?)
            .with_expire_offset(validate_expiry_secs(
                "expire_offset_sec",
                self.expire_offset_sec,
            )?)
            .with_expire_msg(self.expire_msg.clone())
            .with_summary(self.summary)
            .with_summary_msg(self.summary_msg.clone())
            .with_print_config(self.print_config);

        if let Some(max_len) = self.stream_id_max_len {
            policy = policy.with_stream_id_max_len(max_len)?;
        }
        Ok(policy)
    }

    /// Validate the configuration and prepare an engine builder, connecting
    /// to the shared store if one is configured.
    ///
    /// Connecting blocks the calling thread.
    ///
    /// # Errors
    /// Returns `BuildError` for invalid settings or an unreachable store.
    pub fn engine_builder(&self) -> Result<EngineBuilder, BuildError> {
        let builder = DecisionEngine::builder(self.policy()?);

        match &self.redis_url {
            None => Ok(builder),
            #[cfg(feature = "redis-storage")]
            Some(url) => {
                use crate::infrastructure::redis_storage::{RedisStore, RedisStoreConfig};
                use std::sync::Arc;

                let config = RedisStoreConfig::new(&self.redis_prefix)?;
                let store = RedisStore::connect_blocking(url, config)?;
                Ok(builder.with_store(Arc::new(store)))
            }
            #[cfg(not(feature = "redis-storage"))]
            Some(_) => Err(BuildError::RedisUnsupported),
        }
    }

    /// Validate the configuration and build an engine.
    pub fn build_engine(&self) -> Result<DecisionEngine, BuildError> {
        Ok(self.engine_builder()?.build())
    }
}
