use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::scheduler::NodeView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeigherKind {
    /// Tasks currently running on the node (`run_count:<node>`).
    Instances,
    /// CPU units in use (`cap_total - cap`).
    Vcpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeighOrder {
    #[default]
    Min,
    Max,
}

impl FromStr for WeigherKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "instances" => Ok(Self::Instances),
            "vcpu" => Ok(Self::Vcpu),
            _ => Err(ConfigError::UnknownWeigher(s.to_string())),
        }
    }
}

impl FromStr for WeighOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            _ => Err(ConfigError::UnknownOrder(s.to_string())),
        }
    }
}

/// Tie-break among feasible nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Weigher {
    pub kind: WeigherKind,
    pub order: WeighOrder,
}

impl fmt::Display for Weigher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            WeigherKind::Instances => "instances",
            WeigherKind::Vcpu => "vcpu",
        };
        let order = match self.order {
            WeighOrder::Min => "min",
            WeighOrder::Max => "max",
        };
        write!(f, "{}/{}", kind, order)
    }
}

impl Weigher {
    pub fn new(kind: WeigherKind, order: WeighOrder) -> Self {
        Self { kind, order }
    }

    pub fn metric(&self, node: &NodeView) -> i64 {
        match self.kind {
            WeigherKind::Instances => node.run_count,
            WeigherKind::Vcpu => node.used_units(),
        }
    }

    /// Extremal node per `order`. `feasible` must be sorted by node id;
    /// equal metrics keep the earliest id.
    pub fn choose<'a>(&self, feasible: &[&'a NodeView]) -> Option<&'a NodeView> {
        let mut best: Option<(&'a NodeView, i64)> = None;
        for node in feasible {
            let metric = self.metric(node);
            let better = match best {
                None => true,
                Some((_, current)) => match self.order {
                    WeighOrder::Min => metric < current,
                    WeighOrder::Max => metric > current,
                },
            };
            if better {
                best = Some((node, metric));
            }
        }
        best.map(|(node, _)| node)
    }
}
