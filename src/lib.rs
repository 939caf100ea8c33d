mod backoff;
mod bootstrap;
mod capabilities;
mod client;
mod config;
mod device;
mod diff;
mod error;
mod host;
mod leakage;
mod logger;
pub mod mock;
mod protocol;
pub mod registry;
mod store;
mod tracker;
mod types;

pub use backoff::Backoff;
pub use capabilities::{Capability, CapabilitySet, Migration, has_power_control};
pub use client::{MyUplinkClient, MyUplinkClientBuilder, PointApi};
pub use config::Config;
pub use device::{Command, DeviceHandle, DeviceStatus, HeaterDevice};
pub use error::{Error, Result};
pub use host::{Clock, Host, SystemClock};
pub use leakage::{
    CHECKPOINT_VERSION, DailySnapshot, LeakageCheckpoint, LeakageEstimator, LeakageReading,
    LeakageSample, loss_ratio_pct,
};
pub use logger::MessageLogMode;
pub use registry::ParameterRegistry;
pub use store::{
    JsonFileStore, KEY_DEVICE_PROFILE, KEY_FIRST_RUN_DONE, KEY_LEAKAGE, MemoryStore, Store,
    load, save,
};
pub use tracker::PendingWrites;
pub use types::*;
