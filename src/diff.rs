use std::collections::BTreeMap;

use crate::capabilities::Capability;
use crate::types::{
    CapabilityValue, DeviceProfile, ParameterId, PointValues, PowerLevel, Trigger,
};

pub(crate) type CapabilityValues = BTreeMap<Capability, CapabilityValue>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PointChange {
    pub id: ParameterId,
    pub old: Option<f64>,
    pub new: f64,
}

pub(crate) fn diff_points(previous: &PointValues, current: &PointValues) -> Vec<PointChange> {
    current
        .iter()
        .filter(|(id, value)| previous.get(*id) != Some(*value))
        .map(|(id, value)| PointChange {
            id: *id,
            old: previous.get(id).copied(),
            new: *value,
        })
        .collect()
}

pub(crate) fn diff_capabilities(
    published: &CapabilityValues,
    current: &CapabilityValues,
) -> Vec<(Capability, CapabilityValue)> {
    current
        .iter()
        .filter(|(cap, value)| published.get(*cap) != Some(*value))
        .map(|(cap, value)| (*cap, value.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PowerState {
    pub on: Option<bool>,
    pub level: Option<PowerLevel>,
}

pub(crate) fn power_triggers(
    previous: PowerState,
    current: PowerState,
    profile: &DeviceProfile,
) -> Vec<Trigger> {
    let mut triggers = Vec::new();
    if let (Some(was), Some(now)) = (previous.on, current.on)
        && was != now
    {
        triggers.push(Trigger::OnOffChanged { on: now });
    }
    if let (Some(was), Some(now)) = (previous.level, current.level)
        && was != now
    {
        triggers.push(Trigger::MaxPowerChanged {
            watts: profile.watts(now),
        });
    }
    triggers
}
