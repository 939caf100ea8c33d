use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{Capability, CapabilitySet};
use crate::client::PointApi;
use crate::config::Config;
use crate::diff::{CapabilityValues, PowerState, diff_capabilities, power_triggers};
use crate::host::{Clock, Host, SystemClock};
use crate::leakage::{LeakageEstimator, LeakageReading, LeakageSample};
use crate::registry::{self, ParameterRegistry};
use crate::store::{self, KEY_LEAKAGE, Store};
use crate::tracker::PendingWrites;
use crate::types::*;
use crate::{Error, Result};

const COMMAND_QUEUE: usize = 16;

/// User-issued changes, applied in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetOnOff(bool),
    SetMaxPower(PowerLevel),
    SetTargetTemperature(f64),
    SetSettings(BTreeMap<String, f64>),
    SetAmbientTemperature(f64),
    ResetLeakage,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub availability: Availability,
    pub state: DeviceState,
    pub profile: Option<DeviceProfile>,
    pub firmware: Option<String>,
    pub leak_power_w: Option<f64>,
    pub leak_kwh: Option<f64>,
    pub leak_ratio_pct: Option<f64>,
}

impl DeviceStatus {
    fn initial() -> Self {
        Self {
            availability: Availability::Initializing,
            state: DeviceState::default(),
            profile: None,
            firmware: None,
            leak_power_w: None,
            leak_kwh: None,
            leak_ratio_pct: None,
        }
    }
}

pub struct HeaterDevice<A> {
    pub(crate) device_id: String,
    pub(crate) api: Arc<A>,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    pub(crate) config: Config,
    pub(crate) registry: ParameterRegistry,
    pub(crate) tracker: PendingWrites,
    state: DeviceState,
    pub(crate) profile: Option<DeviceProfile>,
    pub(crate) capabilities: Option<CapabilitySet>,
    pub(crate) leakage: Option<LeakageEstimator>,
    leak: Option<LeakageReading>,
    pub(crate) price_supported: bool,
    pub(crate) settings: Settings,
    pub(crate) firmware: Option<String>,
    availability: Availability,
    poll_failures: u32,
    published: CapabilityValues,
    power: PowerState,
    /// Level to use when switching on. Follows the device unless a change is pending.
    level: PowerLevel,
    polling: bool,
    pub(crate) cancel: CancellationToken,
    status: watch::Sender<DeviceStatus>,
}

impl<A: PointApi> HeaterDevice<A> {
    pub fn new(
        device_id: impl Into<String>,
        api: Arc<A>,
        host: Arc<dyn Host>,
        store: Arc<dyn Store>,
    ) -> Self {
        let (status, _) = watch::channel(DeviceStatus::initial());
        Self {
            device_id: device_id.into(),
            api,
            host,
            store,
            clock: Arc::new(SystemClock),
            config: Config::default(),
            registry: ParameterRegistry::new(),
            tracker: PendingWrites::new(),
            state: DeviceState::default(),
            profile: None,
            capabilities: None,
            leakage: None,
            leak: None,
            price_supported: false,
            settings: Settings::new(),
            firmware: None,
            availability: Availability::Initializing,
            poll_failures: 0,
            published: CapabilityValues::new(),
            power: PowerState::default(),
            level: PowerLevel::High,
            polling: false,
            cancel: CancellationToken::new(),
            status,
        }
    }

    pub fn with_config(mut self, config: Config) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Starts the device task: bootstrap, one immediate update, then polling.
    pub fn spawn(self) -> DeviceHandle
    where
        A: 'static,
    {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle_status = self.status.subscribe();
        let cancel = self.cancel.clone();
        let device_id = self.device_id.clone();
        let task = tokio::spawn(self.run(rx));
        DeviceHandle {
            device_id,
            commands,
            status: handle_status,
            cancel,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Request>) {
        info!(device = %self.device_id, "starting device");
        match self.bootstrap().await {
            Ok(()) => self.poll_loop(&mut commands).await,
            Err(Error::Reinstall(message)) => self.halt(message, &mut commands).await,
            Err(e) => debug!(device = %self.device_id, "bootstrap stopped: {e}"),
        }
        self.availability = Availability::Deleted;
        self.publish_status();
        info!(device = %self.device_id, "device stopped");
    }

    async fn poll_loop(&mut self, commands: &mut mpsc::Receiver<Request>) {
        self.polling = true;
        self.update().await;
        let cancel = self.cancel.clone();
        let mut next_poll = Instant::now() + self.poll_delay();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = commands.recv() => {
                    let Some(Request { command, reply }) = request else {
                        break;
                    };
                    let result = self.handle_command(command).await;
                    if let Err(e) = &result {
                        warn!(device = %self.device_id, "command failed: {e}");
                    }
                    self.publish_status();
                    let _ = reply.send(result);
                }
                _ = sleep_until(next_poll) => {
                    self.update().await;
                    next_poll = Instant::now() + self.poll_delay();
                }
            }
        }
    }

    /// Broken setup: nothing polls any more, every command is refused.
    async fn halt(&mut self, message: String, commands: &mut mpsc::Receiver<Request>) {
        let reason = Error::Reinstall(message.clone()).reason();
        warn!(device = %self.device_id, "{reason}");
        self.mark_unavailable(&reason);
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = commands.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    let _ = request.reply.send(Err(Error::Reinstall(message.clone())));
                }
            }
        }
    }

    fn poll_delay(&self) -> std::time::Duration {
        self.config.poll_backoff().delay(self.poll_failures)
    }

    pub(crate) async fn update(&mut self) {
        let mut ids = self.registry.poll_set().to_vec();
        let extra: Vec<ParameterId> = self
            .tracker
            .pending_ids()
            .filter(|id| !ids.contains(id))
            .collect();
        ids.extend(extra);

        match self.api.read_points(&self.device_id, &ids).await {
            Ok(points) => {
                self.poll_failures = 0;
                match self.reconcile(&points).await {
                    Ok(()) => self.mark_available(),
                    Err(e) => self.mark_unavailable(&e.reason()),
                }
            }
            Err(e) => {
                self.poll_failures = self.poll_failures.saturating_add(1);
                if e.is_retryable() {
                    warn!(
                        device = %self.device_id,
                        failures = self.poll_failures,
                        "poll failed: {e}"
                    );
                } else {
                    error!(device = %self.device_id, "poll failed with a non-transient error: {e}");
                }
                self.mark_unavailable(&e.reason());
            }
        }
        self.publish_status();
    }

    async fn reconcile(&mut self, points: &[DevicePoint]) -> Result<()> {
        let mismatched = self.tracker.record_read(points);
        self.derive_state();
        self.sample_leakage();
        self.sync_capabilities();
        self.fire_triggers();
        if mismatched.is_empty() {
            return Ok(());
        }
        self.resend(&mismatched).await
    }

    fn derive_state(&mut self) {
        let tracker = &self.tracker;
        let requested = tracker.confirmed_value(registry::REQUESTED_POWER);
        let level = requested.and_then(PowerLevel::from_register);
        if let Some(level) = level
            && !tracker.is_pending(registry::REQUESTED_POWER)
        {
            self.level = level;
        }
        let previous_level = self.state.power_level;
        self.state = DeviceState {
            on: requested.map(|v| v.round() != 0.0),
            power_level: level.or(previous_level),
            target_temperature: tracker.confirmed_value(registry::TARGET_TEMPERATURE),
            measured_temperature: tracker.confirmed_value(registry::MEASURED_TEMPERATURE),
            energy_stored_kwh: tracker.confirmed_value(registry::ENERGY_STORED),
            energy_total_kwh: tracker.confirmed_value(registry::ENERGY_TOTAL),
            estimated_power_w: tracker.confirmed_value(registry::ESTIMATED_POWER),
            fill_level_pct: tracker.confirmed_value(registry::FILL_LEVEL),
        };
    }

    fn sample_leakage(&mut self) {
        let Some(estimator) = self.leakage.as_mut() else {
            return;
        };
        let (Some(total), Some(temperature), Some(stored)) = (
            self.state.energy_total_kwh,
            self.state.measured_temperature,
            self.state.energy_stored_kwh,
        ) else {
            return;
        };
        let sample = LeakageSample {
            energy_total_kwh: total,
            temperature_c: temperature,
            energy_stored_kwh: stored,
        };
        match estimator.sample(self.clock.now(), sample) {
            Ok(mut reading) => {
                if let Some(checkpoint) = reading.checkpoint.take() {
                    debug!(device = %self.device_id, kwh = checkpoint.accumulated_kwh, "saving leakage state");
                    if let Err(e) = store::save(self.store.as_ref(), KEY_LEAKAGE, &checkpoint) {
                        warn!(device = %self.device_id, "failed to save leakage state: {e}");
                    }
                }
                self.leak = Some(reading);
            }
            Err(e) => warn!(device = %self.device_id, "skipping leakage sample: {e}"),
        }
    }

    fn capability_values(&self) -> CapabilityValues {
        let mut values = CapabilityValues::new();
        let Some(set) = &self.capabilities else {
            return values;
        };
        let state = &self.state;
        let leak = self.leak.as_ref();
        let mut put = |capability: Capability, value: Option<CapabilityValue>| {
            if let Some(value) = value
                && set.contains(capability)
            {
                values.insert(capability, value);
            }
        };

        put(Capability::OnOff, state.on.map(CapabilityValue::Bool));
        if let Some(power) = set.power_control() {
            let level = state
                .on
                .map(|_| CapabilityValue::Text(self.level.as_str().to_string()));
            put(power, level);
        }
        put(
            Capability::TargetTemperature,
            state.target_temperature.map(CapabilityValue::Number),
        );
        put(
            Capability::MeasureTemperature,
            state.measured_temperature.map(CapabilityValue::Number),
        );
        put(
            Capability::MeasurePower,
            state.estimated_power_w.map(CapabilityValue::Number),
        );
        put(
            Capability::MeterInTank,
            state.energy_stored_kwh.map(CapabilityValue::Number),
        );
        put(
            Capability::MeterAccumulated,
            state.energy_total_kwh.map(CapabilityValue::Number),
        );
        put(
            Capability::FillLevel,
            state.fill_level_pct.map(CapabilityValue::Number),
        );
        put(
            Capability::LeakPower,
            leak.map(|r| CapabilityValue::Number(r.power_w)),
        );
        put(
            Capability::LeakMeter,
            leak.map(|r| CapabilityValue::Number(r.accumulated_kwh)),
        );
        put(
            Capability::LeakRelation,
            leak.and_then(|r| r.ratio_pct).map(CapabilityValue::Number),
        );
        values
    }

    /// Pushes changed values to the host. Capabilities backed by a pending
    /// write keep their optimistic value until the device confirms it.
    fn sync_capabilities(&mut self) {
        let current: CapabilityValues = self
            .capability_values()
            .into_iter()
            .filter(|(capability, _)| {
                capability
                    .source()
                    .is_none_or(|id| !self.tracker.is_pending(id))
            })
            .collect();
        for (capability, value) in diff_capabilities(&self.published, &current) {
            self.host.set_capability_value(capability.id(), value.clone());
            self.published.insert(capability, value);
        }
    }

    fn fire_triggers(&mut self) {
        let current = PowerState {
            on: self.state.on,
            level: self.state.power_level,
        };
        if let Some(profile) = &self.profile {
            for trigger in power_triggers(self.power, current, profile) {
                debug!(device = %self.device_id, ?trigger, "firing trigger");
                self.host.trigger(&trigger);
            }
        }
        self.power = current;
    }

    async fn resend(&mut self, ids: &[ParameterId]) -> Result<()> {
        let values = self.tracker.pending_subset(ids);
        debug!(device = %self.device_id, ?values, "re-sending unconfirmed writes");
        self.api
            .write_points(&self.device_id, &values)
            .await
            .inspect_err(|e| warn!(device = %self.device_id, "re-send failed: {e}"))
    }

    /// Sends whatever part of `values` would change the device. A fully
    /// redundant write succeeds without a request.
    pub(crate) async fn write(&mut self, values: PointValues) -> Result<()> {
        if let Some((id, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::InvalidValue(format!("{value} for parameter {id}")));
        }
        let filtered = self.tracker.propose_write(values);
        if filtered.is_empty() {
            return Ok(());
        }
        match self.api.write_points(&self.device_id, &filtered).await {
            Ok(()) => {
                if self.polling {
                    self.mark_available();
                }
                Ok(())
            }
            Err(e) => {
                self.tracker.abandon(&filtered);
                self.mark_unavailable(&e.reason());
                Err(e)
            }
        }
    }

    fn show(&mut self, capability: Capability, value: CapabilityValue) {
        let known = self
            .capabilities
            .as_ref()
            .is_some_and(|set| set.contains(capability));
        if known && self.published.get(&capability) != Some(&value) {
            self.host.set_capability_value(capability.id(), value.clone());
            self.published.insert(capability, value);
        }
    }

    fn requested_on(&self) -> bool {
        let id = registry::REQUESTED_POWER;
        self.tracker
            .pending_value(id)
            .or(self.tracker.confirmed_value(id))
            .is_some_and(|v| v.round() != 0.0)
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        debug!(device = %self.device_id, ?command, "handling command");
        match command {
            Command::SetOnOff(on) => self.set_heater_state(on, self.level).await,
            Command::SetMaxPower(level) => {
                let on = self.requested_on();
                self.set_heater_state(on, level).await
            }
            Command::SetTargetTemperature(celsius) => {
                let values = PointValues::from([(registry::TARGET_TEMPERATURE, celsius)]);
                self.write(values).await?;
                self.show(
                    Capability::TargetTemperature,
                    CapabilityValue::Number(celsius),
                );
                Ok(())
            }
            Command::SetSettings(changes) => self.apply_settings(changes).await,
            Command::SetAmbientTemperature(celsius) => {
                if !celsius.is_finite() {
                    return Err(Error::InvalidSample(format!(
                        "ambient temperature {celsius}"
                    )));
                }
                let clamped = self.config.clamp_ambient(celsius);
                if let Some(estimator) = self.leakage.as_mut() {
                    estimator.set_ambient(clamped);
                }
                info!(device = %self.device_id, ambient = clamped, "ambient temperature set");
                Ok(())
            }
            Command::ResetLeakage => self.reset_leakage(),
        }
    }

    async fn set_heater_state(&mut self, on: bool, level: PowerLevel) -> Result<()> {
        let register = if on { level.register_value() } else { 0.0 };
        self.write(PointValues::from([(registry::REQUESTED_POWER, register)]))
            .await?;
        self.level = level;
        self.show(Capability::OnOff, CapabilityValue::Bool(on));
        if let Some(power) = self.capabilities.as_ref().and_then(|s| s.power_control()) {
            self.show(power, CapabilityValue::Text(level.as_str().to_string()));
        }
        Ok(())
    }

    async fn apply_settings(&mut self, changes: BTreeMap<String, f64>) -> Result<()> {
        let price_ids = self.registry.price_region_ids();
        let mut values = PointValues::new();
        for (name, value) in &changes {
            if !self.registry.is_writable_setting(name)? {
                return Err(Error::UnknownSetting(format!("{name} is read-only")));
            }
            let id = self.registry.resolve_id(name)?;
            if price_ids.contains(&id) && !self.price_supported {
                return Err(Error::UnknownSetting(name.clone()));
            }
            values.insert(id, *value);
        }
        self.write(values).await?;
        for (name, value) in changes {
            self.settings.insert(name, SettingValue::Number(value));
        }
        self.host.set_settings(&self.settings);
        Ok(())
    }

    fn reset_leakage(&mut self) -> Result<()> {
        let Some(estimator) = self.leakage.as_mut() else {
            return Ok(());
        };
        let checkpoint = estimator.reset(self.clock.now());
        store::save(self.store.as_ref(), KEY_LEAKAGE, &checkpoint)?;
        info!(device = %self.device_id, "leakage state reset");
        let power_w = self.leak.as_ref().map_or(0.0, |r| r.power_w);
        self.leak = Some(LeakageReading {
            power_w,
            accumulated_kwh: 0.0,
            ratio_pct: None,
            checkpoint: None,
        });
        self.sync_capabilities();
        Ok(())
    }

    pub(crate) fn mark_available(&mut self) {
        if self.availability != Availability::Available {
            info!(device = %self.device_id, "device available");
            self.host.set_available();
            self.availability = Availability::Available;
            self.publish_status();
        }
    }

    pub(crate) fn mark_unavailable(&mut self, reason: &str) {
        let next = Availability::Unavailable(reason.to_string());
        if self.availability != next {
            self.host.set_unavailable(reason);
            self.availability = next;
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(DeviceStatus {
            availability: self.availability.clone(),
            state: self.state.clone(),
            profile: self.profile,
            firmware: self.firmware.clone(),
            leak_power_w: self.leak.as_ref().map(|r| r.power_w),
            leak_kwh: self.leak.as_ref().map(|r| r.accumulated_kwh),
            leak_ratio_pct: self.leak.as_ref().and_then(|r| r.ratio_pct),
        });
    }
}

pub struct DeviceHandle {
    device_id: String,
    commands: mpsc::Sender<Request>,
    status: watch::Receiver<DeviceStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Deleted);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .await
            .map_err(|_| Error::Deleted)?;
        rx.await.map_err(|_| Error::Deleted)?
    }

    pub async fn set_on_off(&self, on: bool) -> Result<()> {
        self.send(Command::SetOnOff(on)).await
    }

    pub async fn set_max_power(&self, level: PowerLevel) -> Result<()> {
        self.send(Command::SetMaxPower(level)).await
    }

    pub async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        self.send(Command::SetTargetTemperature(celsius)).await
    }

    pub async fn set_settings(&self, changes: BTreeMap<String, f64>) -> Result<()> {
        self.send(Command::SetSettings(changes)).await
    }

    pub async fn set_ambient_temperature(&self, celsius: f64) -> Result<()> {
        self.send(Command::SetAmbientTemperature(celsius)).await
    }

    pub async fn reset_leakage(&self) -> Result<()> {
        self.send(Command::ResetLeakage).await
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.status.clone()
    }

    /// Stops the device for good. Takes effect before the next timer fires.
    pub fn delete(&self) {
        info!(device = %self.device_id, "deleting device");
        self.cancel.cancel();
    }

    pub fn is_deleted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(device = %self.device_id, "device task ended abnormally: {e}");
        }
    }
}
