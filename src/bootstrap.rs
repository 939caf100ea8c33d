use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capabilities::{CapabilitySet, Migration, has_power_control};
use crate::client::PointApi;
use crate::device::HeaterDevice;
use crate::leakage::{LeakageCheckpoint, LeakageEstimator};
use crate::registry::{HEATER_MODE, MODE_EXTERNAL, MODE_PRICE_CONTROLLED, TANK_VOLUME};
use crate::store::{self, KEY_DEVICE_PROFILE, KEY_FIRST_RUN_DONE, KEY_LEAKAGE};
use crate::types::*;
use crate::{Error, Result};

const FIRMWARE_SETTING: &str = "firmware_version";

fn tank_volume(points: &[DevicePoint]) -> Result<f64> {
    match points {
        [point] if point.id == TANK_VOLUME && point.value.is_finite() && point.value > 0.0 => {
            Ok(point.value)
        }
        _ => Err(Error::Protocol(format!(
            "expected one valid tank volume reading, got {} points",
            points.len()
        ))),
    }
}

fn setting_value(point: &DevicePoint) -> SettingValue {
    match &point.display_value {
        Some(text) if !point.writable => SettingValue::Text(text.clone()),
        _ => SettingValue::Number(point.value),
    }
}

fn id_list(ids: &BTreeSet<ParameterId>) -> String {
    ids.iter()
        .map(ParameterId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl<A: PointApi> HeaterDevice<A> {
    /// Brings the device to a state where polling can start. Retries every
    /// transient failure forever; only a broken capability set is fatal.
    pub(crate) async fn bootstrap(&mut self) -> Result<()> {
        let profile = self.resolve_profile().await?;
        info!(
            device = %self.device_id,
            device_type = ?profile.device_type,
            tank_litres = profile.tank_litres,
            "device type resolved"
        );
        self.profile = Some(profile);
        self.load_leakage(&profile);
        self.migrate_capabilities(profile.device_type).await?;
        self.ensure_external_mode().await?;
        let ids = self.settings_ids(profile.device_type).await?;
        self.load_settings(ids).await
    }

    pub(crate) async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Deleted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn retry_after(&mut self, attempt: &mut u32, what: &str, error: &Error) -> Result<()> {
        let delay = self.config.bootstrap_backoff().delay(*attempt);
        *attempt = attempt.saturating_add(1);
        warn!(
            device = %self.device_id,
            attempt = *attempt,
            delay_secs = delay.as_secs(),
            "{what} failed: {error}"
        );
        self.mark_unavailable(&error.reason());
        self.pause(delay).await
    }

    async fn resolve_profile(&mut self) -> Result<DeviceProfile> {
        if let Some(profile) = store::load::<DeviceProfile>(self.store.as_ref(), KEY_DEVICE_PROFILE)
        {
            debug!(device = %self.device_id, "using stored device type");
            return Ok(profile);
        }
        let mut attempt = 0;
        loop {
            let litres = self
                .api
                .read_points(&self.device_id, &[TANK_VOLUME])
                .await
                .and_then(|points| tank_volume(&points));
            match litres {
                Ok(litres) => {
                    let profile = DeviceProfile::classify(litres);
                    if let Err(e) = store::save(self.store.as_ref(), KEY_DEVICE_PROFILE, &profile) {
                        warn!(device = %self.device_id, "failed to save device type: {e}");
                    }
                    return Ok(profile);
                }
                Err(e) => {
                    self.retry_after(&mut attempt, "reading tank volume", &e)
                        .await?
                }
            }
        }
    }

    fn load_leakage(&mut self, profile: &DeviceProfile) {
        let mut estimator = LeakageEstimator::new(profile.leakage_w_per_k, &self.config);
        if let Some(checkpoint) =
            store::load::<LeakageCheckpoint>(self.store.as_ref(), KEY_LEAKAGE)
            && estimator.restore(checkpoint)
        {
            debug!(
                device = %self.device_id,
                kwh = estimator.accumulated_kwh(),
                "restored leakage state"
            );
        }
        self.leakage = Some(estimator);
    }

    fn apply_migration(&self, migration: &Migration) -> Result<()> {
        for name in &migration.add {
            info!(device = %self.device_id, capability = %name, "adding capability");
            self.host.add_capability(name)?;
        }
        for name in &migration.remove {
            info!(device = %self.device_id, capability = %name, "removing capability");
            self.host.remove_capability(name)?;
        }
        Ok(())
    }

    async fn migrate_capabilities(&mut self, device_type: DeviceType) -> Result<()> {
        let set = CapabilitySet::for_type(device_type);
        let mut attempt = 0;
        loop {
            let migration = set.migration_from(&self.host.capabilities());
            match self.apply_migration(&migration) {
                Ok(()) => break,
                Err(e) => {
                    self.retry_after(&mut attempt, "migrating capabilities", &e)
                        .await?
                }
            }
        }
        if !has_power_control(&self.host.capabilities()) {
            return Err(Error::Reinstall(
                "no power control capability after migration".to_string(),
            ));
        }
        self.capabilities = Some(set);
        Ok(())
    }

    async fn ensure_external_mode(&mut self) -> Result<()> {
        if store::load::<bool>(self.store.as_ref(), KEY_FIRST_RUN_DONE).unwrap_or(false) {
            return Ok(());
        }
        let mut attempt = 0;
        while let Err(e) = self.force_external_mode().await {
            self.retry_after(&mut attempt, "setting external heater mode", &e)
                .await?;
        }
        if let Err(e) = store::save(self.store.as_ref(), KEY_FIRST_RUN_DONE, &true) {
            warn!(device = %self.device_id, "failed to save first-run flag: {e}");
        }
        Ok(())
    }

    async fn force_external_mode(&mut self) -> Result<()> {
        let points = self.api.read_points(&self.device_id, &[HEATER_MODE]).await?;
        self.tracker.record_read(&points);
        let mode = points
            .iter()
            .find(|p| p.id == HEATER_MODE)
            .map(|p| p.value)
            .ok_or_else(|| Error::Protocol("heater mode missing from read".to_string()))?;
        let external = MODE_EXTERNAL as f64;
        if mode == external {
            return Ok(());
        }
        info!(device = %self.device_id, mode, "switching heater to external control");
        self.write(PointValues::from([(HEATER_MODE, external)]))
            .await
    }

    async fn settings_ids(&mut self, device_type: DeviceType) -> Result<Vec<ParameterId>> {
        let mut ids = self.registry.settings_for(device_type);
        if !device_type.supports_price_region() {
            self.price_supported = false;
            return Ok(ids);
        }
        let mut attempt = 0;
        let supported = loop {
            match self.api.read_points(&self.device_id, &[HEATER_MODE]).await {
                Ok(points) => {
                    self.tracker.record_read(&points);
                    break points.iter().any(|p| {
                        p.id == HEATER_MODE && p.supports_enum_value(MODE_PRICE_CONTROLLED)
                    });
                }
                Err(e) => {
                    self.retry_after(&mut attempt, "probing heater modes", &e)
                        .await?
                }
            }
        };
        if !supported {
            info!(device = %self.device_id, "firmware has no price control, skipping price settings");
            let price_ids = self.registry.price_region_ids();
            ids.retain(|id| !price_ids.contains(id));
        }
        self.price_supported = supported;
        Ok(ids)
    }

    async fn load_settings(&mut self, ids: Vec<ParameterId>) -> Result<()> {
        let mut missing: BTreeSet<ParameterId> = ids.into_iter().collect();
        let mut attempt = 0;
        let mut firmware_checked = false;
        while !missing.is_empty() {
            let wanted: Vec<ParameterId> = missing.iter().copied().collect();
            let points = match self.api.read_points(&self.device_id, &wanted).await {
                Ok(points) => points,
                Err(e) => {
                    self.retry_after(&mut attempt, "reading settings", &e)
                        .await?;
                    continue;
                }
            };
            attempt = 0;
            self.tracker.record_read(&points);
            for point in &points {
                if missing.remove(&point.id)
                    && let Ok(name) = self.registry.resolve_name(point.id)
                {
                    self.settings.insert(name.to_string(), setting_value(point));
                }
            }
            self.host.set_settings(&self.settings);

            if !firmware_checked {
                self.fetch_firmware().await;
                firmware_checked = true;
            }

            if !missing.is_empty() {
                let list = id_list(&missing);
                warn!(device = %self.device_id, missing = %list, "device did not return all settings");
                self.mark_unavailable(&format!("Waiting for device parameters {list}"));
                self.pause(self.config.settings_retry()).await?;
            }
        }
        Ok(())
    }

    async fn fetch_firmware(&mut self) {
        match self.api.firmware_version(&self.device_id).await {
            Ok(version) => {
                info!(device = %self.device_id, firmware = %version, "firmware version");
                self.settings
                    .insert(FIRMWARE_SETTING.to_string(), SettingValue::Text(version.clone()));
                self.firmware = Some(version);
                self.host.set_settings(&self.settings);
            }
            Err(e) => debug!(device = %self.device_id, "firmware version unavailable: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    fn point(id: ParameterId, value: f64) -> DevicePoint {
        DevicePoint::new(id, value)
    }

    #[test]
    fn tank_volume_needs_exactly_one_valid_point() {
        assert_eq!(tank_volume(&[point(TANK_VOLUME, 178.0)]).unwrap(), 178.0);
        assert!(tank_volume(&[]).is_err());
        assert!(tank_volume(&[point(TANK_VOLUME, 0.0)]).is_err());
        assert!(tank_volume(&[point(TANK_VOLUME, f64::NAN)]).is_err());
        assert!(tank_volume(&[point(registry::REQUESTED_POWER, 178.0)]).is_err());
        assert!(tank_volume(&[point(TANK_VOLUME, 178.0), point(TANK_VOLUME, 178.0)]).is_err());
    }

    #[test]
    fn read_only_points_with_text_become_display_strings() {
        let serial = DevicePoint {
            display_value: Some("HX-200-1234".to_string()),
            ..point(registry::SERIAL_NUMBER, 1234.0)
        };
        assert_eq!(
            setting_value(&serial),
            SettingValue::Text("HX-200-1234".to_string())
        );

        let mode = DevicePoint {
            writable: true,
            display_value: Some("External".to_string()),
            ..point(HEATER_MODE, 8.0)
        };
        assert_eq!(setting_value(&mode), SettingValue::Number(8.0));
    }

    #[test]
    fn missing_ids_are_listed() {
        let ids: BTreeSet<ParameterId> = [ParameterId(512), ParameterId(100)].into();
        assert_eq!(id_list(&ids), "100,512");
    }
}
