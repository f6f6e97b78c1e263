//! The core partition between the service, the batch jobs, and idle.
//!
//! A [`CorePartition`] is a plain value: the control loop owns one, hands a
//! copy to the allocator, and gets a new one back. Every core of the
//! inventory is held by exactly one [`Holder`] at all times; transfers that
//! would break that are rejected rather than applied.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::cpuset::CoreSet;
use crate::error::PartitionError;

/// Who holds a core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Holder {
    Service,
    Job(String),
    Idle,
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Service => f.write_str("service"),
            Holder::Job(name) => write!(f, "job {name}"),
            Holder::Idle => f.write_str("idle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorePartition {
    inventory: CoreSet,
    service: CoreSet,
    jobs: BTreeMap<String, CoreSet>,
    idle: CoreSet,
}

impl CorePartition {
    /// Start with `service` reserved and everything else idle.
    pub fn new(inventory: CoreSet, service: CoreSet) -> Result<Self, PartitionError> {
        let outside = service.difference(&inventory);
        if !outside.is_empty() {
            return Err(PartitionError::OutsideInventory { cores: outside });
        }
        let idle = inventory.difference(&service);
        Ok(Self {
            inventory,
            service,
            jobs: BTreeMap::new(),
            idle,
        })
    }

    pub fn inventory(&self) -> &CoreSet {
        &self.inventory
    }

    pub fn service(&self) -> &CoreSet {
        &self.service
    }

    pub fn idle(&self) -> &CoreSet {
        &self.idle
    }

    /// Jobs currently holding at least one core.
    pub fn jobs(&self) -> &BTreeMap<String, CoreSet> {
        &self.jobs
    }

    /// Cores held by `job`; empty if it holds none.
    pub fn job(&self, job: &str) -> CoreSet {
        self.jobs.get(job).cloned().unwrap_or_default()
    }

    pub fn held_by(&self, holder: &Holder) -> CoreSet {
        match holder {
            Holder::Service => self.service.clone(),
            Holder::Job(name) => self.job(name),
            Holder::Idle => self.idle.clone(),
        }
    }

    /// Move `cores` from one holder to another.
    ///
    /// Fails without changing anything if `from` does not hold all of them.
    pub fn transfer(
        &mut self,
        cores: &CoreSet,
        from: &Holder,
        to: &Holder,
    ) -> Result<(), PartitionError> {
        if cores.is_empty() || from == to {
            return Ok(());
        }
        let missing = cores.difference(&self.held_by(from));
        if !missing.is_empty() {
            return Err(PartitionError::NotHeld {
                cores: missing,
                holder: from.to_string(),
            });
        }

        let remaining = self.held_by(from).difference(cores);
        self.set(from, remaining);
        let grown = self.held_by(to).union(cores);
        self.set(to, grown);
        Ok(())
    }

    /// Release everything `job` holds back to idle and return it.
    pub fn release_job(&mut self, job: &str) -> CoreSet {
        let cores = self.jobs.remove(job).unwrap_or_default();
        self.idle = self.idle.union(&cores);
        cores
    }

    /// Check the exact-cover invariant.
    pub fn validate(&self) -> Result<(), PartitionError> {
        let mut seen = CoreSet::new();
        let holders = std::iter::once(&self.service)
            .chain(self.jobs.values())
            .chain(std::iter::once(&self.idle));

        for set in holders {
            for core in set.iter() {
                if !seen.insert(core) {
                    return Err(PartitionError::Overlap { core });
                }
            }
        }

        let outside = seen.difference(&self.inventory);
        if !outside.is_empty() {
            return Err(PartitionError::OutsideInventory { cores: outside });
        }
        let uncovered = self.inventory.difference(&seen);
        if !uncovered.is_empty() {
            return Err(PartitionError::Uncovered { cores: uncovered });
        }
        Ok(())
    }

    fn set(&mut self, holder: &Holder, cores: CoreSet) {
        match holder {
            Holder::Service => self.service = cores,
            Holder::Idle => self.idle = cores,
            Holder::Job(name) => {
                if cores.is_empty() {
                    self.jobs.remove(name);
                } else {
                    self.jobs.insert(name.clone(), cores);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> Holder {
        Holder::Job(name.to_string())
    }

    #[test]
    fn new_partition_covers_inventory() {
        let p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0])).unwrap();
        assert_eq!(p.idle(), &CoreSet::from([1, 2, 3]));
        assert!(p.jobs().is_empty());
        p.validate().unwrap();
    }

    #[test]
    fn service_outside_inventory_is_rejected() {
        let err = CorePartition::new(CoreSet::range(0, 1), CoreSet::from([4])).unwrap_err();
        assert!(matches!(err, PartitionError::OutsideInventory { .. }));
    }

    #[test]
    fn transfer_moves_cores_between_holders() {
        let mut p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0])).unwrap();
        p.transfer(&CoreSet::from([1, 2]), &Holder::Idle, &job("a")).unwrap();
        p.transfer(&CoreSet::from([2]), &job("a"), &Holder::Service).unwrap();

        assert_eq!(p.job("a"), CoreSet::from([1]));
        assert_eq!(p.service(), &CoreSet::from([0, 2]));
        assert_eq!(p.idle(), &CoreSet::from([3]));
        p.validate().unwrap();
    }

    #[test]
    fn transfer_of_unheld_cores_changes_nothing() {
        let mut p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0])).unwrap();
        let before = p.clone();
        let err = p
            .transfer(&CoreSet::from([0, 1]), &Holder::Idle, &job("a"))
            .unwrap_err();
        assert!(matches!(err, PartitionError::NotHeld { .. }));
        assert_eq!(p, before);
    }

    #[test]
    fn emptied_job_entry_is_dropped() {
        let mut p = CorePartition::new(CoreSet::range(0, 1), CoreSet::new()).unwrap();
        p.transfer(&CoreSet::from([1]), &Holder::Idle, &job("a")).unwrap();
        p.transfer(&CoreSet::from([1]), &job("a"), &Holder::Idle).unwrap();
        assert!(p.jobs().is_empty());
    }

    #[test]
    fn release_job_returns_cores_to_idle() {
        let mut p = CorePartition::new(CoreSet::range(0, 3), CoreSet::from([0])).unwrap();
        p.transfer(&CoreSet::from([1, 2]), &Holder::Idle, &job("a")).unwrap();
        assert_eq!(p.release_job("a"), CoreSet::from([1, 2]));
        assert_eq!(p.idle(), &CoreSet::from([1, 2, 3]));
        assert!(p.release_job("a").is_empty());
        p.validate().unwrap();
    }
}
