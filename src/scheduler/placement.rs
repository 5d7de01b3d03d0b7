use std::collections::BTreeMap;

use crate::scheduler::weigher::Weigher;
use crate::store::{CoordinationStore, StoreResult, keys};

/// One node's counters as read at the start of a dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub id: String,
    pub cap: i64,
    pub cap_total: Option<i64>,
    pub run_count: i64,
    /// Declared parallelism; 0 means the node does not use slot tokens.
    pub slots_total: i64,
    /// Tokens for this node currently in `slots:available`.
    pub tokens: usize,
}

impl NodeView {
    pub fn uses_slots(&self) -> bool {
        self.slots_total > 0
    }

    pub fn used_units(&self) -> i64 {
        match self.cap_total {
            Some(total) if total > 0 => (total - self.cap).max(0),
            _ => 0,
        }
    }

    pub fn fits(&self, need: i64) -> bool {
        self.cap >= need
    }

    /// How this node takes a task needing `need` units under normal slot
    /// gating, if at all. A slot-bearing node needs a token of its own.
    pub fn admits(&self, need: i64) -> Option<PlacementMode> {
        if !self.fits(need) {
            None
        } else if !self.uses_slots() {
            Some(PlacementMode::Capacity)
        } else if self.tokens > 0 {
            Some(PlacementMode::Slot)
        } else {
            None
        }
    }
}

/// Snapshot of every known node, sorted by id.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub nodes: Vec<NodeView>,
    /// Tokens in the pool that name no known node.
    pub stale_tokens: usize,
}

impl ClusterView {
    /// Known nodes are those with a `cap:<node>` counter.
    pub async fn read(store: &dyn CoordinationStore) -> StoreResult<Self> {
        let mut ids: Vec<String> = store
            .keys_with_prefix(keys::CAP_PREFIX)
            .await?
            .iter()
            .filter_map(|k| keys::node_from_cap_key(k).map(str::to_string))
            .collect();
        ids.sort();
        ids.dedup();

        let mut token_counts: BTreeMap<String, usize> = BTreeMap::new();
        for token in store.range(keys::SLOTS).await? {
            *token_counts.entry(token).or_default() += 1;
        }

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let tokens = token_counts.remove(&id).unwrap_or(0);
            nodes.push(NodeView {
                cap: store.get(&keys::cap(&id)).await?.unwrap_or(0),
                cap_total: store.get(&keys::cap_total(&id)).await?,
                run_count: store.get(&keys::run_count(&id)).await?.unwrap_or(0),
                slots_total: store.get(&keys::slots_total(&id)).await?.unwrap_or(0),
                tokens,
                id,
            });
        }

        Ok(Self {
            nodes,
            stale_tokens: token_counts.values().sum(),
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeView> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Tokens in the pool across all nodes, stale ones included.
    pub fn pooled_tokens(&self) -> usize {
        self.nodes.iter().map(|n| n.tokens).sum::<usize>() + self.stale_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    /// Slot-bearing node; one of its tokens is consumed.
    Slot,
    /// Node does not use slot tokens.
    Capacity,
    /// No node could take the task under slot gating (pool empty, or its
    /// tokens name absent or full nodes). Dispatched on capacity alone.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node: String,
    pub mode: PlacementMode,
}

impl Placement {
    pub fn take_slot(&self) -> bool {
        self.mode == PlacementMode::Slot
    }
}

/// Picks a node for a task needing `need` units, or `None` if the head must wait.
///
/// Nodes that admit the task under slot gating are preferred. When there are
/// none, every node with `cap >= need` is considered on capacity alone, so an
/// empty or stale token pool never stalls the queue.
pub fn place(view: &ClusterView, need: i64, weigher: Option<&Weigher>) -> Option<Placement> {
    let choose = |feasible: Vec<&NodeView>| match weigher {
        Some(w) => w.choose(&feasible).map(|n| n.id.clone()),
        None => feasible.first().map(|n| n.id.clone()),
    };

    let gated: Vec<&NodeView> = view.nodes.iter().filter(|n| n.admits(need).is_some()).collect();
    if let Some(node) = choose(gated) {
        let mode = view.node(&node)?.admits(need)?;
        return Some(Placement { node, mode });
    }

    let fits: Vec<&NodeView> = view.nodes.iter().filter(|n| n.fits(need)).collect();
    choose(fits).map(|node| Placement {
        node,
        mode: PlacementMode::Fallback,
    })
}
