use std::collections::BTreeMap;

use kiwatch_core::{Observation, Target};
use serde::Serialize;

/// New observations of one target within a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetAlerts {
    pub target: Target,
    pub observations: Vec<Observation>,
}

/// Consolidated per-sweep grouping handed to the notifier, ordered by target id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertDigest {
    pub groups: Vec<TargetAlerts>,
}

impl AlertDigest {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn observation_count(&self) -> usize {
        self.groups.iter().map(|g| g.observations.len()).sum()
    }

    pub fn group_for(&self, target_id: i64) -> Option<&TargetAlerts> {
        self.groups.iter().find(|g| g.target.id == target_id)
    }
}

/// Collects new observations across one sweep.
///
/// Targets that produced nothing are never recorded, so an empty aggregator
/// means there is nothing to notify about.
#[derive(Debug, Default)]
pub struct AlertAggregator {
    groups: BTreeMap<i64, TargetAlerts>,
}

impl AlertAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: &Target, new_observations: Vec<Observation>) {
        if new_observations.is_empty() {
            return;
        }
        self.groups
            .entry(target.id)
            .or_insert_with(|| TargetAlerts {
                target: target.clone(),
                observations: Vec::new(),
            })
            .observations
            .extend(new_observations);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Take the full grouping, leaving the aggregator empty.
    pub fn drain(&mut self) -> AlertDigest {
        AlertDigest {
            groups: std::mem::take(&mut self.groups).into_values().collect(),
        }
    }
}
