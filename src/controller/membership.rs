//! Live storage node registry and replica placement.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{Message, NodeId, Rejection};
use crate::utils::DfsError;

use rand::seq::SliceRandom;

use serde::Deserialize;

use tokio::sync::mpsc;

/// Replica placement policy for new files.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Nodes holding the fewest files first, ties broken by lowest NodeId.
    LeastLoaded,

    /// Uniformly random distinct nodes.
    Random,
}

impl Default for Placement {
    fn default() -> Self {
        Placement::LeastLoaded
    }
}

/// Handle to the control connection of one live storage node. Messages are
/// queued to the node's messenger task, which owns the write half.
#[derive(Debug, Clone)]
pub(crate) struct NodeHandle {
    tx_send: mpsc::UnboundedSender<Message>,
}

impl NodeHandle {
    pub(crate) fn new(tx_send: mpsc::UnboundedSender<Message>) -> Self {
        NodeHandle { tx_send }
    }

    /// Queues a control message to the node.
    pub(crate) fn send(&self, msg: Message) -> Result<(), DfsError> {
        self.tx_send.send(msg)?;
        Ok(())
    }

    /// The messenger task of this node has gone away.
    fn is_closed(&self) -> bool {
        self.tx_send.is_closed()
    }

    /// Both handles address the same control connection.
    pub(crate) fn same_conn(&self, other: &NodeHandle) -> bool {
        self.tx_send.same_channel(&other.tx_send)
    }
}

/// Directory of live storage nodes, keyed by NodeId.
#[derive(Debug, Default)]
pub(crate) struct Membership {
    nodes: BTreeMap<NodeId, NodeHandle>,
}

impl Membership {
    pub(crate) fn new() -> Self {
        Membership {
            nodes: BTreeMap::new(),
        }
    }

    /// Registers a newly joined node. Fails if the same NodeId is already
    /// live; a stale entry whose connection has closed is replaced.
    pub(crate) fn join(
        &mut self,
        id: NodeId,
        handle: NodeHandle,
    ) -> Result<(), DfsError> {
        if let Some(existing) = self.nodes.get(&id) {
            if !existing.is_closed() {
                return Err(DfsError::msg(format!(
                    "node {} is already live",
                    id
                )));
            }
        }
        self.nodes.insert(id, handle);
        Ok(())
    }

    /// Removes a node. Idempotent: returns false if it was not present.
    pub(crate) fn remove(&mut self, id: NodeId) -> bool {
        self.nodes.remove(&id).is_some()
    }

    /// Removes a node only if its entry still belongs to the given control
    /// connection.
    pub(crate) fn remove_conn(&mut self, id: NodeId, handle: &NodeHandle) -> bool {
        match self.nodes.get(&id) {
            Some(existing) if existing.same_conn(handle) => self.remove(id),
            _ => false,
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_live(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn handle(&self, id: NodeId) -> Option<&NodeHandle> {
        self.nodes.get(&id)
    }

    /// Live NodeIds in ascending order.
    pub(crate) fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Chooses `r` distinct live nodes for a new file. `loads` gives the
    /// number of files each node currently holds (absent means zero).
    pub(crate) fn pick_replicas(
        &self,
        r: usize,
        loads: &HashMap<NodeId, usize>,
        placement: Placement,
    ) -> Result<Vec<NodeId>, Rejection> {
        if self.live_count() < r {
            return Err(Rejection::NotEnoughDstores);
        }

        let mut picked: Vec<NodeId> = match placement {
            Placement::LeastLoaded => {
                let mut ranked = self.node_ids();
                ranked.sort_by_key(|id| {
                    (loads.get(id).copied().unwrap_or(0), *id)
                });
                ranked.truncate(r);
                ranked
            }
            Placement::Random => self
                .node_ids()
                .choose_multiple(&mut rand::thread_rng(), r)
                .copied()
                .collect(),
        };
        picked.sort();
        Ok(picked)
    }
}
