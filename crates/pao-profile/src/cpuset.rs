//! Linux cpuset lists (`0-3,8,10-11`)

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Parsed set of CPU ids
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    /// Whether the set has no CPUs
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of CPUs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether any CPU is in both sets
    pub fn intersects(&self, other: &CpuSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    /// CPUs present in both sets
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.intersection(&other.0).copied().collect())
    }
}

impl FromStr for CpuSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cpus = BTreeSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parse = |v: &str| {
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| format!("invalid cpu id {v:?} in {s:?}"))
            };
            match part.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse(start)?, parse(end)?);
                    if start > end {
                        return Err(format!("invalid cpu range {part:?}: start after end"));
                    }
                    cpus.extend(start..=end);
                }
                None => {
                    cpus.insert(parse(part)?);
                }
            }
        }
        Ok(CpuSet(cpus))
    }
}

/// Canonical form: sorted, consecutive ids collapsed into ranges
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for &cpu in &self.0 {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == cpu => *end = cpu,
                _ => ranges.push((cpu, cpu)),
            }
        }
        let parts: Vec<String> = ranges
            .into_iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}
