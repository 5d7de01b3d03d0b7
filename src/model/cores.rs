use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// A set of logical CPU indices, written in `taskset -c` list form ("0-3,6").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoreSet(BTreeSet<usize>);

impl CoreSet {
    pub fn range(start: usize, len: usize) -> Self {
        Self((start..start + len).collect())
    }

    pub fn from_cores(cores: impl IntoIterator<Item = usize>) -> Self {
        Self(cores.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, core: usize) -> bool {
        self.0.contains(&core)
    }

    pub fn is_disjoint(&self, other: &CoreSet) -> bool {
        self.0.is_disjoint(&other.0)
    }
}

impl FromStr for CoreSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::CoreList(s.to_string());
        let mut cores = BTreeSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((a, b)) => {
                    let start: usize = a.trim().parse().map_err(|_| bad())?;
                    let end: usize = b.trim().parse().map_err(|_| bad())?;
                    if start > end {
                        return Err(bad());
                    }
                    cores.extend(start..=end);
                }
                None => {
                    cores.insert(part.parse().map_err(|_| bad())?);
                }
            }
        }
        if cores.is_empty() {
            return Err(bad());
        }
        Ok(Self(cores))
    }
}

impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let mut iter = self.0.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }
        write!(f, "{}", parts.join(","))
    }
}
