use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::{Error, Result};

/// Bumped whenever the stored layout or meaning changes. Older checkpoints are
/// discarded rather than migrated: version 1 could hold a poisoned integral.
pub const CHECKPOINT_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub at: DateTime<Utc>,
    pub usage_kwh: f64,
    pub leak_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakageCheckpoint {
    pub version: u32,
    pub accumulated_kwh: f64,
    pub last_accumulation: Option<DateTime<Utc>>,
    pub daily: Option<DailySnapshot>,
    #[serde(default)]
    pub last_ratio_pct: Option<f64>,
    pub saved_at: DateTime<Utc>,
}

impl LeakageCheckpoint {
    fn is_sane(&self) -> bool {
        let daily_ok = self.daily.is_none_or(|d| {
            d.usage_kwh.is_finite() && d.leak_kwh.is_finite() && d.leak_kwh >= 0.0
        });
        let ratio_ok = self
            .last_ratio_pct
            .is_none_or(|r| (0.0..=100.0).contains(&r));
        self.version == CHECKPOINT_VERSION
            && self.accumulated_kwh.is_finite()
            && self.accumulated_kwh >= 0.0
            && daily_ok
            && ratio_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakageSample {
    pub energy_total_kwh: f64,
    pub temperature_c: f64,
    pub energy_stored_kwh: f64,
}

impl LeakageSample {
    fn usage_kwh(&self) -> f64 {
        self.energy_total_kwh - self.energy_stored_kwh
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeakageReading {
    pub power_w: f64,
    pub accumulated_kwh: f64,
    pub ratio_pct: Option<f64>,
    pub checkpoint: Option<LeakageCheckpoint>,
}

#[derive(Debug, Clone)]
pub struct LeakageEstimator {
    constant_w_per_k: f64,
    ambient_c: f64,
    accumulated_kwh: f64,
    last_accumulation: Option<DateTime<Utc>>,
    daily: Option<DailySnapshot>,
    last_ratio_pct: Option<f64>,
    last_checkpoint: Option<DateTime<Utc>>,
    checkpoint_interval: Duration,
    ratio_period: Duration,
}

impl LeakageEstimator {
    pub fn new(constant_w_per_k: f64, config: &Config) -> Self {
        Self {
            constant_w_per_k,
            ambient_c: config.default_ambient_c,
            accumulated_kwh: 0.0,
            last_accumulation: None,
            daily: None,
            last_ratio_pct: None,
            last_checkpoint: None,
            checkpoint_interval: Duration::hours(config.checkpoint_interval_hours),
            ratio_period: Duration::hours(config.ratio_period_hours),
        }
    }

    pub fn restore(&mut self, checkpoint: LeakageCheckpoint) -> bool {
        if !checkpoint.is_sane() {
            warn!(
                version = checkpoint.version,
                accumulated = checkpoint.accumulated_kwh,
                "discarding stored leakage state"
            );
            return false;
        }
        self.accumulated_kwh = checkpoint.accumulated_kwh;
        self.last_accumulation = checkpoint.last_accumulation;
        self.daily = checkpoint.daily;
        self.last_ratio_pct = checkpoint.last_ratio_pct;
        self.last_checkpoint = Some(checkpoint.saved_at);
        true
    }

    pub fn set_ambient(&mut self, celsius: f64) {
        self.ambient_c = celsius;
    }

    pub fn ambient(&self) -> f64 {
        self.ambient_c
    }

    pub fn constant(&self) -> f64 {
        self.constant_w_per_k
    }

    pub fn accumulated_kwh(&self) -> f64 {
        self.accumulated_kwh
    }

    pub fn last_ratio_pct(&self) -> Option<f64> {
        self.last_ratio_pct
    }

    /// Standing loss in watts. A tank colder than ambient loses nothing.
    pub fn loss_w(&self, temperature_c: f64) -> f64 {
        (self.constant_w_per_k * (temperature_c - self.ambient_c)).max(0.0)
    }

    pub fn sample(&mut self, now: DateTime<Utc>, sample: LeakageSample) -> Result<LeakageReading> {
        if !(sample.energy_total_kwh.is_finite()
            && sample.temperature_c.is_finite()
            && sample.energy_stored_kwh.is_finite())
        {
            return Err(Error::InvalidSample(format!("non-finite sample {sample:?}")));
        }

        let power_w = self.loss_w(sample.temperature_c);
        if let Some(last) = self.last_accumulation {
            let elapsed = now - last;
            if elapsed < Duration::zero() {
                self.last_accumulation = Some(now);
                return Err(Error::InvalidSample(format!(
                    "clock went backwards by {}s",
                    -elapsed.num_seconds()
                )));
            }
            let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
            self.accumulated_kwh += power_w * hours / 1000.0;
        }
        self.last_accumulation = Some(now);

        self.roll_daily(now, sample.usage_kwh());

        let checkpoint = match self.last_checkpoint {
            Some(saved) if now - saved < self.checkpoint_interval => None,
            _ => {
                self.last_checkpoint = Some(now);
                Some(self.checkpoint(now))
            }
        };

        Ok(LeakageReading {
            power_w,
            accumulated_kwh: self.accumulated_kwh,
            ratio_pct: self.last_ratio_pct,
            checkpoint,
        })
    }

    fn roll_daily(&mut self, now: DateTime<Utc>, usage_kwh: f64) {
        let snapshot = DailySnapshot {
            at: now,
            usage_kwh,
            leak_kwh: self.accumulated_kwh,
        };
        match self.daily {
            None => self.daily = Some(snapshot),
            Some(prev) if now - prev.at >= self.ratio_period => {
                let ratio = loss_ratio_pct(
                    self.accumulated_kwh - prev.leak_kwh,
                    usage_kwh - prev.usage_kwh,
                );
                debug!(ratio, "daily leakage ratio");
                self.last_ratio_pct = Some(ratio);
                self.daily = Some(snapshot);
            }
            Some(_) => {}
        }
    }

    pub fn checkpoint(&self, now: DateTime<Utc>) -> LeakageCheckpoint {
        LeakageCheckpoint {
            version: CHECKPOINT_VERSION,
            accumulated_kwh: self.accumulated_kwh,
            last_accumulation: self.last_accumulation,
            daily: self.daily,
            last_ratio_pct: self.last_ratio_pct,
            saved_at: now,
        }
    }

    /// Clears the integral and ratio baseline. The returned checkpoint must be
    /// persisted right away.
    pub fn reset(&mut self, now: DateTime<Utc>) -> LeakageCheckpoint {
        self.accumulated_kwh = 0.0;
        self.last_accumulation = Some(now);
        self.daily = None;
        self.last_ratio_pct = None;
        self.last_checkpoint = Some(now);
        self.checkpoint(now)
    }
}

pub fn loss_ratio_pct(leak_delta_kwh: f64, usage_delta_kwh: f64) -> f64 {
    if leak_delta_kwh <= 0.0 {
        0.0
    } else if usage_delta_kwh < leak_delta_kwh {
        100.0
    } else {
        100.0 * leak_delta_kwh / usage_delta_kwh
    }
}
