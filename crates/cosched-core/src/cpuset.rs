//! Core sets and cpuset strings.
//!
//! Container runtimes and `taskset` describe affinity as cpuset strings
//! (`"0-2,4"`). [`CoreSet`] parses and prints that format and offers the
//! small amount of set algebra the allocator needs.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Physical core identifier as the kernel numbers it.
pub type CoreId = u32;

/// An ordered set of core ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoreSet(BTreeSet<CoreId>);

impl CoreSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Cores `start..=end`.
    pub fn range(start: CoreId, end: CoreId) -> Self {
        Self((start..=end).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, core: CoreId) -> bool {
        self.0.contains(&core)
    }

    pub fn insert(&mut self, core: CoreId) -> bool {
        self.0.insert(core)
    }

    pub fn remove(&mut self, core: CoreId) -> bool {
        self.0.remove(&core)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = CoreId> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<CoreId> {
        self.0.iter().copied().collect()
    }

    pub fn union(&self, other: &CoreSet) -> CoreSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &CoreSet) -> CoreSet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &CoreSet) -> CoreSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_subset(&self, other: &CoreSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_disjoint(&self, other: &CoreSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    /// The `n` lowest-numbered cores (fewer if the set is smaller).
    pub fn lowest(&self, n: usize) -> CoreSet {
        self.iter().take(n).collect()
    }

    /// The `n` highest-numbered cores (fewer if the set is smaller).
    pub fn highest(&self, n: usize) -> CoreSet {
        self.iter().rev().take(n).collect()
    }
}

impl FromIterator<CoreId> for CoreSet {
    fn from_iter<I: IntoIterator<Item = CoreId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[CoreId; N]> for CoreSet {
    fn from(cores: [CoreId; N]) -> Self {
        cores.into_iter().collect()
    }
}

impl FromStr for CoreSet {
    type Err = ConfigError;

    /// Parse `"0,1,2"`, `"0-3"`, `"0-2,4"`. The empty string is the empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidCpuset(s.to_string());
        let mut set = BTreeSet::new();

        for segment in s.split(',').map(str::trim).filter(|seg| !seg.is_empty()) {
            if let Some((lo, hi)) = segment.split_once('-') {
                let lo: CoreId = lo.trim().parse().map_err(|_| invalid())?;
                let hi: CoreId = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                set.extend(lo..=hi);
            } else {
                set.insert(segment.parse().map_err(|_| invalid())?);
            }
        }

        Ok(Self(set))
    }
}

impl TryFrom<String> for CoreSet {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CoreSet> for String {
    fn from(set: CoreSet) -> Self {
        set.to_string()
    }
}

impl fmt::Display for CoreSet {
    /// Compact cpuset form: consecutive runs of three or more collapse to
    /// `lo-hi`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cores = self.to_vec();
        let mut parts = Vec::new();
        let mut i = 0;
        while i < cores.len() {
            let mut j = i;
            while j + 1 < cores.len() && cores[j + 1] == cores[j] + 1 {
                j += 1;
            }
            match j - i {
                0 => parts.push(cores[i].to_string()),
                1 => {
                    parts.push(cores[i].to_string());
                    parts.push(cores[j].to_string());
                }
                _ => parts.push(format!("{}-{}", cores[i], cores[j])),
            }
            i = j + 1;
        }
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lists_and_ranges() {
        let set: CoreSet = "0-2,4".parse().unwrap();
        assert_eq!(set.to_vec(), vec![0, 1, 2, 4]);

        let set: CoreSet = " 3 , 1 ".parse().unwrap();
        assert_eq!(set.to_vec(), vec![1, 3]);

        assert!("".parse::<CoreSet>().unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_cpusets() {
        assert!("3-1".parse::<CoreSet>().is_err());
        assert!("a,b".parse::<CoreSet>().is_err());
        assert!("1-".parse::<CoreSet>().is_err());
    }

    #[test]
    fn display_collapses_runs() {
        assert_eq!(CoreSet::from([0, 1, 2, 4]).to_string(), "0-2,4");
        assert_eq!(CoreSet::from([0, 1]).to_string(), "0,1");
        assert_eq!(CoreSet::from([5, 7, 8, 9, 10]).to_string(), "5,7-10");
        assert_eq!(CoreSet::new().to_string(), "");
    }

    #[test]
    fn lowest_and_highest() {
        let set = CoreSet::range(0, 5);
        assert_eq!(set.lowest(2), CoreSet::from([0, 1]));
        assert_eq!(set.highest(2), CoreSet::from([4, 5]));
        assert_eq!(set.highest(10), set);
    }

    #[test]
    fn serde_uses_cpuset_strings() {
        let set = CoreSet::from([1, 2, 3]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"1-3\"");
        let back: CoreSet = serde_json::from_str("\"1,2,3\"").unwrap();
        assert_eq!(back, set);
    }
}
