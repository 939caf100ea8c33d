use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    growth: Growth,
}

impl Backoff {
    pub fn linear(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            growth: Growth::Linear,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            growth: Growth::Exponential,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = match self.growth {
            Growth::Linear => failures.saturating_add(1),
            Growth::Exponential => 2u32.saturating_pow(failures.min(31)),
        };
        self.base.saturating_mul(factor).min(self.max)
    }
}
