use std::collections::BTreeSet;

use crate::registry;
use crate::types::{DeviceType, ParameterId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    OnOff,
    MaxPower,
    MaxPower3000,
    TargetTemperature,
    MeasureTemperature,
    MeasurePower,
    MeterInTank,
    MeterAccumulated,
    FillLevel,
    LeakPower,
    LeakMeter,
    LeakRelation,
}

const RETIRED: &[&str] = &["measure_humidity.efficiency"];

impl Capability {
    pub const ALL: [Capability; 12] = [
        Capability::OnOff,
        Capability::MaxPower,
        Capability::MaxPower3000,
        Capability::TargetTemperature,
        Capability::MeasureTemperature,
        Capability::MeasurePower,
        Capability::MeterInTank,
        Capability::MeterAccumulated,
        Capability::FillLevel,
        Capability::LeakPower,
        Capability::LeakMeter,
        Capability::LeakRelation,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Capability::OnOff => "onoff",
            Capability::MaxPower => "max_power",
            Capability::MaxPower3000 => "max_power_3000",
            Capability::TargetTemperature => "target_temperature",
            Capability::MeasureTemperature => "measure_temperature",
            Capability::MeasurePower => "measure_power",
            Capability::MeterInTank => "meter_power.in_tank",
            Capability::MeterAccumulated => "meter_power.accumulated",
            Capability::FillLevel => "measure_humidity.fill_level",
            Capability::LeakPower => "measure_power.leak",
            Capability::LeakMeter => "meter_power.leak",
            Capability::LeakRelation => "measure_humidity.leak_relation",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    pub fn source(&self) -> Option<ParameterId> {
        match self {
            Capability::OnOff | Capability::MaxPower | Capability::MaxPower3000 => {
                Some(registry::REQUESTED_POWER)
            }
            Capability::TargetTemperature => Some(registry::TARGET_TEMPERATURE),
            Capability::MeasureTemperature => Some(registry::MEASURED_TEMPERATURE),
            Capability::MeasurePower => Some(registry::ESTIMATED_POWER),
            Capability::MeterInTank => Some(registry::ENERGY_STORED),
            Capability::MeterAccumulated => Some(registry::ENERGY_TOTAL),
            Capability::FillLevel => Some(registry::FILL_LEVEL),
            Capability::LeakPower | Capability::LeakMeter | Capability::LeakRelation => None,
        }
    }

    pub fn is_power_control(&self) -> bool {
        matches!(self, Capability::MaxPower | Capability::MaxPower3000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn for_type(device_type: DeviceType) -> Self {
        let power = match device_type {
            DeviceType::Connected300 => Capability::MaxPower3000,
            DeviceType::Connected200 | DeviceType::Unknown => Capability::MaxPower,
        };
        let set = Capability::ALL
            .into_iter()
            .filter(|c| !c.is_power_control() || *c == power)
            .collect();
        Self(set)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn power_control(&self) -> Option<Capability> {
        self.iter().find(Capability::is_power_control)
    }

    /// Changes needed to turn the host's current capability list into this set.
    /// Names the driver does not know about are left alone.
    pub fn migration_from(&self, existing: &[String]) -> Migration {
        let add = self
            .iter()
            .filter(|c| !existing.iter().any(|e| e == c.id()))
            .map(|c| c.id().to_string())
            .collect();
        let remove = existing
            .iter()
            .filter(|name| match Capability::from_id(name) {
                Some(c) => !self.contains(c),
                None => RETIRED.contains(&name.as_str()),
            })
            .cloned()
            .collect();
        Migration { add, remove }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Migration {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl Migration {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

pub fn has_power_control(existing: &[String]) -> bool {
    existing
        .iter()
        .filter_map(|name| Capability::from_id(name))
        .any(|c| c.is_power_control())
}
