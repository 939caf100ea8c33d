use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::client::PointApi;
use crate::host::{Clock, Host};
use crate::types::*;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    Network,
    Conflict,
    Malformed,
}

impl MockFailure {
    fn into_error(self, what: &str) -> Error {
        match self {
            MockFailure::Network => Error::Status {
                status: 503,
                body: format!("service unavailable while {what}"),
            },
            MockFailure::Conflict => Error::Conflict(format!("failed {what}")),
            MockFailure::Malformed => Error::Protocol(format!("unexpected body while {what}")),
        }
    }
}

#[derive(Default)]
struct MockState {
    registers: BTreeMap<ParameterId, DevicePoint>,
    omitted: BTreeSet<ParameterId>,
    read_failures: VecDeque<MockFailure>,
    write_failures: VecDeque<MockFailure>,
    hold_writes: bool,
    firmware: Option<String>,
    reads: Vec<(Instant, Vec<ParameterId>)>,
    writes: Vec<PointValues>,
}

#[derive(Default)]
pub struct MockPointApi {
    state: Mutex<MockState>,
}

impl MockPointApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set_point(&self, id: ParameterId, value: f64) {
        self.with_state(|s| {
            s.registers
                .entry(id)
                .and_modify(|p| p.value = value)
                .or_insert_with(|| DevicePoint {
                    writable: true,
                    ..DevicePoint::new(id, value)
                });
        });
    }

    pub fn set_display(&self, id: ParameterId, value: f64, display: &str, writable: bool) {
        self.with_state(|s| {
            s.registers.insert(
                id,
                DevicePoint {
                    writable,
                    display_value: Some(display.to_string()),
                    ..DevicePoint::new(id, value)
                },
            );
        });
    }

    pub fn set_enum_values(&self, id: ParameterId, values: &[(i64, &str)]) {
        self.with_state(|s| {
            if let Some(point) = s.registers.get_mut(&id) {
                point.enum_values = values
                    .iter()
                    .map(|(v, text)| EnumValue {
                        value: v.to_string(),
                        text: text.to_string(),
                    })
                    .collect();
            }
        });
    }

    pub fn set_firmware(&self, version: &str) {
        self.with_state(|s| s.firmware = Some(version.to_string()));
    }

    pub fn omit(&self, id: ParameterId) {
        self.with_state(|s| {
            s.omitted.insert(id);
        });
    }

    pub fn restore(&self, id: ParameterId) {
        self.with_state(|s| {
            s.omitted.remove(&id);
        });
    }

    pub fn fail_reads(&self, count: usize, failure: MockFailure) {
        self.with_state(|s| s.read_failures.extend(std::iter::repeat_n(failure, count)));
    }

    pub fn fail_writes(&self, count: usize, failure: MockFailure) {
        self.with_state(|s| s.write_failures.extend(std::iter::repeat_n(failure, count)));
    }

    pub fn hold_writes(&self, hold: bool) {
        self.with_state(|s| s.hold_writes = hold);
    }

    pub fn value(&self, id: ParameterId) -> Option<f64> {
        self.with_state(|s| s.registers.get(&id).map(|p| p.value))
    }

    pub fn reads(&self) -> Vec<Vec<ParameterId>> {
        self.with_state(|s| s.reads.iter().map(|(_, ids)| ids.clone()).collect())
    }

    pub fn read_times(&self) -> Vec<Instant> {
        self.with_state(|s| s.reads.iter().map(|(at, _)| *at).collect())
    }

    pub fn writes(&self) -> Vec<PointValues> {
        self.with_state(|s| s.writes.clone())
    }

    pub fn clear_log(&self) {
        self.with_state(|s| {
            s.reads.clear();
            s.writes.clear();
        });
    }
}

impl PointApi for MockPointApi {
    async fn read_points(&self, _device_id: &str, ids: &[ParameterId]) -> Result<Vec<DevicePoint>> {
        self.with_state(|s| {
            s.reads.push((Instant::now(), ids.to_vec()));
            if let Some(failure) = s.read_failures.pop_front() {
                return Err(failure.into_error("reading points"));
            }
            Ok(ids
                .iter()
                .filter(|id| !s.omitted.contains(id))
                .filter_map(|id| s.registers.get(id).cloned())
                .collect())
        })
    }

    async fn write_points(&self, _device_id: &str, values: &PointValues) -> Result<()> {
        self.with_state(|s| {
            s.writes.push(values.clone());
            if let Some(failure) = s.write_failures.pop_front() {
                return Err(failure.into_error("setting points"));
            }
            if !s.hold_writes {
                for (id, value) in values {
                    s.registers
                        .entry(*id)
                        .and_modify(|p| p.value = *value)
                        .or_insert_with(|| DevicePoint::new(*id, *value));
                }
            }
            Ok(())
        })
    }

    async fn firmware_version(&self, _device_id: &str) -> Result<String> {
        self.with_state(|s| {
            s.firmware
                .clone()
                .ok_or_else(|| MockFailure::Network.into_error("reading device info"))
        })
    }
}

#[derive(Debug, Default)]
struct HostState {
    capabilities: Vec<String>,
    ignore_capability_changes: bool,
    values: BTreeMap<String, CapabilityValue>,
    value_updates: usize,
    availability: Vec<Availability>,
    settings: Option<Settings>,
    triggers: Vec<Trigger>,
}

#[derive(Debug, Default)]
pub struct RecordingHost {
    state: Mutex<HostState>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(names: &[&str]) -> Self {
        let host = Self::new();
        host.with_state(|s| s.capabilities = names.iter().map(|n| n.to_string()).collect());
        host
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn ignore_capability_changes(&self, ignore: bool) {
        self.with_state(|s| s.ignore_capability_changes = ignore);
    }

    pub fn value(&self, name: &str) -> Option<CapabilityValue> {
        self.with_state(|s| s.values.get(name).cloned())
    }

    pub fn value_updates(&self) -> usize {
        self.with_state(|s| s.value_updates)
    }

    pub fn availability(&self) -> Vec<Availability> {
        self.with_state(|s| s.availability.clone())
    }

    pub fn settings(&self) -> Option<Settings> {
        self.with_state(|s| s.settings.clone())
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.with_state(|s| s.triggers.clone())
    }
}

impl Host for RecordingHost {
    fn capabilities(&self) -> Vec<String> {
        self.with_state(|s| s.capabilities.clone())
    }

    fn add_capability(&self, name: &str) -> Result<()> {
        self.with_state(|s| {
            if !s.ignore_capability_changes && !s.capabilities.iter().any(|c| c == name) {
                s.capabilities.push(name.to_string());
            }
        });
        Ok(())
    }

    fn remove_capability(&self, name: &str) -> Result<()> {
        self.with_state(|s| {
            if !s.ignore_capability_changes {
                s.capabilities.retain(|c| c != name);
            }
        });
        Ok(())
    }

    fn set_capability_value(&self, name: &str, value: CapabilityValue) {
        self.with_state(|s| {
            s.value_updates += 1;
            s.values.insert(name.to_string(), value);
        });
    }

    fn set_available(&self) {
        self.with_state(|s| s.availability.push(Availability::Available));
    }

    fn set_unavailable(&self, reason: &str) {
        self.with_state(|s| {
            s.availability
                .push(Availability::Unavailable(reason.to_string()))
        });
    }

    fn set_settings(&self, settings: &Settings) {
        self.with_state(|s| s.settings = Some(settings.clone()));
    }

    fn trigger(&self, trigger: &Trigger) {
        self.with_state(|s| s.triggers.push(trigger.clone()));
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_start: DateTime<Utc>,
    start: Instant,
}

impl TokioClock {
    pub fn new(wall_start: DateTime<Utc>) -> Self {
        Self {
            wall_start,
            start: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap_or_default();
        self.wall_start + elapsed
    }
}
