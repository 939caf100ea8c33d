use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::types::{DevicePoint, ParameterId, PointValues};

/// Tracks optimistic writes until a later read confirms them.
#[derive(Debug, Default)]
pub struct PendingWrites {
    pending: BTreeMap<ParameterId, f64>,
    confirmed: BTreeMap<ParameterId, f64>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops entries that would not change anything and marks the rest pending.
    pub fn propose_write(&mut self, values: PointValues) -> PointValues {
        let mut filtered = PointValues::new();
        for (id, value) in values {
            let redundant = !self.pending.contains_key(&id)
                && self.confirmed.get(&id).is_some_and(|c| *c == value);
            if redundant {
                debug!(parameter = %id, value, "ignoring write of unchanged parameter");
                continue;
            }
            filtered.insert(id, value);
        }
        self.pending.extend(filtered.iter().map(|(id, v)| (*id, *v)));
        filtered
    }

    /// Records a successful read. Returns ids that are still pending because the
    /// device reported a different value.
    pub fn record_read(&mut self, points: &[DevicePoint]) -> Vec<ParameterId> {
        let mut mismatched = Vec::new();
        for point in points {
            self.confirmed.insert(point.id, point.value);
            let Some(&wanted) = self.pending.get(&point.id) else {
                continue;
            };
            if wanted == point.value {
                debug!(parameter = %point.id, value = point.value, "write confirmed");
                self.pending.remove(&point.id);
            } else {
                trace!(
                    parameter = %point.id,
                    wanted,
                    actual = point.value,
                    "write not confirmed yet"
                );
                mismatched.push(point.id);
            }
        }
        mismatched
    }

    pub fn abandon(&mut self, values: &PointValues) {
        for (id, value) in values {
            if self.pending.get(id) == Some(value) {
                self.pending.remove(id);
            }
        }
    }

    pub fn is_pending(&self, id: ParameterId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_value(&self, id: ParameterId) -> Option<f64> {
        self.pending.get(&id).copied()
    }

    pub fn confirmed_value(&self, id: ParameterId) -> Option<f64> {
        self.confirmed.get(&id).copied()
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.pending.keys().copied()
    }

    pub fn pending_subset(&self, ids: &[ParameterId]) -> PointValues {
        ids.iter()
            .filter_map(|id| self.pending.get(id).map(|v| (*id, *v)))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
