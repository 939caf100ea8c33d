use crate::types::{DeviceType, ParameterId};
use crate::{Error, Result};

pub const AMBIENT_TEMPERATURE: ParameterId = ParameterId(100);
pub const INLET_TEMPERATURE: ParameterId = ParameterId(101);
pub const ENERGY_STORED: ParameterId = ParameterId(302);
pub const ENERGY_TOTAL: ParameterId = ParameterId(303);
pub const ESTIMATED_POWER: ParameterId = ParameterId(400);
pub const FILL_LEVEL: ParameterId = ParameterId(404);
pub const HEATER_EFFICIENCY: ParameterId = ParameterId(405);
pub const HEATER_MODE: ParameterId = ParameterId(500);
pub const HEATER_NOM_POWER: ParameterId = ParameterId(503);
pub const HEATER_NOM_POWER2: ParameterId = ParameterId(504);
pub const LEGIONELLA_FREQUENCY: ParameterId = ParameterId(511);
pub const MAX_WATER_FLOW: ParameterId = ParameterId(512);
pub const REGULATION_DIFF: ParameterId = ParameterId(516);
pub const REQUESTED_POWER: ParameterId = ParameterId(517);
pub const SERIAL_NUMBER: ParameterId = ParameterId(518);
pub const TANK_VOLUME: ParameterId = ParameterId(526);
pub const TARGET_TEMPERATURE: ParameterId = ParameterId(527);
pub const MEASURED_TEMPERATURE: ParameterId = ParameterId(528);
pub const PRICE_REGION: ParameterId = ParameterId(710);

/// Heater mode value that hands control to an external controller.
pub const MODE_EXTERNAL: i64 = 8;
/// Heater mode value only offered by firmware with spot-price support.
pub const MODE_PRICE_CONTROLLED: i64 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    State,
    Setting { writable: bool },
    PriceSetting,
}

struct Entry {
    name: &'static str,
    id: ParameterId,
    kind: Kind,
}

const fn state(name: &'static str, id: ParameterId) -> Entry {
    Entry { name, id, kind: Kind::State }
}

const fn setting(name: &'static str, id: ParameterId, writable: bool) -> Entry {
    Entry { name, id, kind: Kind::Setting { writable } }
}

const TABLE: &[Entry] = &[
    setting("ambient_temperature", AMBIENT_TEMPERATURE, true),
    setting("inlet_temperature", INLET_TEMPERATURE, true),
    state("energy_stored", ENERGY_STORED),
    state("energy_total", ENERGY_TOTAL),
    state("estimated_power", ESTIMATED_POWER),
    state("fill_level", FILL_LEVEL),
    setting("heater_efficiency", HEATER_EFFICIENCY, false),
    setting("heater_mode", HEATER_MODE, true),
    setting("heater_nom_power", HEATER_NOM_POWER, false),
    setting("heater_nom_power2", HEATER_NOM_POWER2, false),
    setting("legionella_frequency", LEGIONELLA_FREQUENCY, true),
    setting("max_water_flow", MAX_WATER_FLOW, true),
    setting("regulation_diff", REGULATION_DIFF, true),
    state("requested_power", REQUESTED_POWER),
    setting("serial_number", SERIAL_NUMBER, false),
    setting("tank_volume", TANK_VOLUME, false),
    state("target_temperature", TARGET_TEMPERATURE),
    state("measured_temperature", MEASURED_TEMPERATURE),
    Entry { name: "price_region", id: PRICE_REGION, kind: Kind::PriceSetting },
];

const POLL_SET: &[ParameterId] = &[
    ENERGY_STORED,
    ENERGY_TOTAL,
    ESTIMATED_POWER,
    FILL_LEVEL,
    REQUESTED_POWER,
    TARGET_TEMPERATURE,
    MEASURED_TEMPERATURE,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterRegistry;

impl ParameterRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve_id(&self, name: &str) -> Result<ParameterId> {
        TABLE
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.id)
            .ok_or_else(|| Error::UnknownSetting(name.to_string()))
    }

    pub fn resolve_name(&self, id: ParameterId) -> Result<&'static str> {
        TABLE
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.name)
            .ok_or(Error::UnknownParameter(id))
    }

    pub fn poll_set(&self) -> &'static [ParameterId] {
        POLL_SET
    }

    pub fn settings_for(&self, device_type: DeviceType) -> Vec<ParameterId> {
        TABLE
            .iter()
            .filter(|e| match e.kind {
                Kind::State => false,
                Kind::Setting { .. } => true,
                Kind::PriceSetting => device_type.supports_price_region(),
            })
            .map(|e| e.id)
            .collect()
    }

    pub fn price_region_ids(&self) -> Vec<ParameterId> {
        TABLE
            .iter()
            .filter(|e| e.kind == Kind::PriceSetting)
            .map(|e| e.id)
            .collect()
    }

    pub fn is_writable_setting(&self, name: &str) -> Result<bool> {
        let entry = TABLE
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::UnknownSetting(name.to_string()))?;
        Ok(matches!(
            entry.kind,
            Kind::Setting { writable: true } | Kind::PriceSetting
        ))
    }
}
