use chrono::{DateTime, Utc};

use crate::Result;
use crate::types::{CapabilityValue, Settings, Trigger};

/// The capability layer the driver runs inside.
pub trait Host: Send + Sync {
    fn capabilities(&self) -> Vec<String>;

    fn add_capability(&self, name: &str) -> Result<()>;

    fn remove_capability(&self, name: &str) -> Result<()>;

    fn set_capability_value(&self, name: &str, value: CapabilityValue);

    fn set_available(&self);

    fn set_unavailable(&self, reason: &str);

    fn set_settings(&self, settings: &Settings);

    fn trigger(&self, trigger: &Trigger);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
