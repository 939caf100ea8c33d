use std::time::Duration;

use serde::Deserialize;

use crate::backoff::Backoff;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub max_backoff_factor: u32,
    pub bootstrap_retry_initial_secs: u64,
    pub bootstrap_retry_max_secs: u64,
    pub settings_retry_secs: u64,
    pub default_ambient_c: f64,
    pub ambient_min_c: f64,
    pub ambient_max_c: f64,
    pub checkpoint_interval_hours: i64,
    pub ratio_period_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            max_backoff_factor: 5,
            bootstrap_retry_initial_secs: 10,
            bootstrap_retry_max_secs: 300,
            settings_retry_secs: 60,
            default_ambient_c: 20.0,
            ambient_min_c: 0.0,
            ambient_max_c: 40.0,
            checkpoint_interval_hours: 24,
            ratio_period_hours: 24,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be > 0".into()));
        }
        if self.max_backoff_factor < 1 {
            return Err(Error::Config("max_backoff_factor must be >= 1".into()));
        }
        if self.bootstrap_retry_initial_secs == 0
            || self.bootstrap_retry_max_secs < self.bootstrap_retry_initial_secs
        {
            return Err(Error::Config(
                "bootstrap retry delays must satisfy 0 < initial <= max".into(),
            ));
        }
        let ambient = [self.ambient_min_c, self.ambient_max_c, self.default_ambient_c];
        if ambient.iter().any(|c| !c.is_finite()) {
            return Err(Error::Config("ambient temperatures must be finite".into()));
        }
        if self.ambient_min_c > self.ambient_max_c {
            return Err(Error::Config("ambient_min_c must be <= ambient_max_c".into()));
        }
        if !(self.ambient_min_c..=self.ambient_max_c).contains(&self.default_ambient_c) {
            return Err(Error::Config("default_ambient_c outside ambient range".into()));
        }
        if self.checkpoint_interval_hours <= 0 || self.ratio_period_hours <= 0 {
            return Err(Error::Config("leakage periods must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_backoff(&self) -> Backoff {
        let base = Duration::from_secs(self.poll_interval_secs);
        Backoff::linear(base, base * self.max_backoff_factor)
    }

    pub fn bootstrap_backoff(&self) -> Backoff {
        Backoff::exponential(
            Duration::from_secs(self.bootstrap_retry_initial_secs),
            Duration::from_secs(self.bootstrap_retry_max_secs),
        )
    }

    pub fn settings_retry(&self) -> Duration {
        Duration::from_secs(self.settings_retry_secs)
    }

    pub fn clamp_ambient(&self, celsius: f64) -> f64 {
        celsius.clamp(self.ambient_min_c, self.ambient_max_c)
    }
}
