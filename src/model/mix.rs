use std::fmt;
use std::str::FromStr;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::ConfigError;
use crate::model::profile::ProfileRegistry;

/// A weighted profile mix, parsed from `name=weight,name=weight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mix {
    entries: Vec<(String, u32)>,
}

impl FromStr for Mix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, weight) = part
                .split_once('=')
                .ok_or_else(|| ConfigError::MixEntry(part.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::MixEntry(part.to_string()));
            }
            let weight: u32 = weight.trim().parse().map_err(|_| ConfigError::MixWeight {
                profile: name.to_string(),
                weight: weight.trim().to_string(),
            })?;
            entries.push((name.to_string(), weight));
        }
        if entries.iter().all(|(_, w)| *w == 0) {
            return Err(ConfigError::EmptyMix);
        }
        Ok(Self { entries })
    }
}

impl fmt::Display for Mix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.entries.iter().map(|(n, w)| format!("{}={}", n, w)).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl Mix {
    /// Every named profile must exist in the registry.
    pub fn validate(&self, registry: &ProfileRegistry) -> Result<(), ConfigError> {
        for (name, _) in &self.entries {
            if registry.get(name).is_none() {
                return Err(ConfigError::UnknownProfile(name.clone()));
            }
        }
        Ok(())
    }

    /// Per-profile counts for `total` tasks: proportional floor, then the
    /// remainder one each in descending weight order (mix order on ties).
    pub fn counts(&self, total: usize) -> Vec<(String, usize)> {
        let total_weight: u64 = self.entries.iter().map(|(_, w)| *w as u64).sum::<u64>().max(1);
        let mut counts: Vec<(String, usize)> = self
            .entries
            .iter()
            .map(|(name, w)| (name.clone(), ((total as u64 * *w as u64) / total_weight) as usize))
            .collect();

        let assigned: usize = counts.iter().map(|(_, c)| *c).sum();
        let mut remainder = total.saturating_sub(assigned);
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        // stable: equal weights keep mix order
        order.sort_by(|a, b| self.entries[*b].1.cmp(&self.entries[*a].1));
        for idx in order {
            if remainder == 0 {
                break;
            }
            counts[idx].1 += 1;
            remainder -= 1;
        }
        counts
    }

    /// The ordered profile assignment for `total` tasks. Identical for the
    /// same (mix, total, seed).
    pub fn sample(&self, total: usize, seed: u64) -> Result<Vec<String>, ConfigError> {
        if total == 0 {
            return Err(ConfigError::ZeroTotal);
        }
        let mut sequence = Vec::with_capacity(total);
        for (name, count) in self.counts(total) {
            sequence.extend(std::iter::repeat_n(name, count));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        sequence.shuffle(&mut rng);
        Ok(sequence)
    }
}
