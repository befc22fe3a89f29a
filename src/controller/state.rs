//! Combined cluster state guarded as one unit. Every client-visible
//! operation is a single transaction against `ClusterState`.

use std::collections::{BTreeMap, BTreeSet};

use crate::controller::filestate::FileIndex;
use crate::controller::membership::{Membership, NodeHandle, Placement};
use crate::protocol::{NodeId, Rejection};
use crate::utils::DfsError;

/// Membership plus file index.
#[derive(Debug)]
pub(crate) struct ClusterState {
    /// Replication factor R.
    replication: usize,

    /// Placement policy for new files.
    placement: Placement,

    pub(crate) membership: Membership,

    pub(crate) index: FileIndex,
}

impl ClusterState {
    pub(crate) fn new(replication: usize, placement: Placement) -> Self {
        ClusterState {
            replication,
            placement,
            membership: Membership::new(),
            index: FileIndex::new(),
        }
    }

    fn check_capacity(&self) -> Result<(), Rejection> {
        if self.membership.live_count() < self.replication {
            Err(Rejection::NotEnoughDstores)
        } else {
            Ok(())
        }
    }

    /// Registers a joined node.
    pub(crate) fn node_joined(
        &mut self,
        id: NodeId,
        handle: NodeHandle,
    ) -> Result<(), DfsError> {
        self.membership.join(id, handle)
    }

    /// Removes a failed node from membership and from every replica set, if
    /// `handle` still owns its membership entry.
    pub(crate) fn node_failed(&mut self, id: NodeId, handle: &NodeHandle) -> bool {
        if self.membership.remove_conn(id, handle) {
            self.index.strip_node(id);
            true
        } else {
            false
        }
    }

    /// Admits a STORE: checks capacity and name, picks R replicas, and marks
    /// the name StoreInProgress.
    pub(crate) fn admit_store(
        &mut self,
        name: &str,
    ) -> Result<Vec<NodeId>, Rejection> {
        self.check_capacity()?;
        if self.index.contains(name) {
            return Err(Rejection::AlreadyExists);
        }
        let nodes = self.membership.pick_replicas(
            self.replication,
            &self.index.node_loads(),
            self.placement,
        )?;
        self.index.begin_store(name)?;
        Ok(nodes)
    }

    /// Commits a fully acknowledged STORE. Nodes that failed after
    /// acknowledging are left out of the replica set.
    pub(crate) fn finish_store(
        &mut self,
        name: &str,
        size: u64,
        nodes: &[NodeId],
    ) -> Result<(), DfsError> {
        let live: BTreeSet<NodeId> = nodes
            .iter()
            .copied()
            .filter(|id| self.membership.is_live(*id))
            .collect();
        self.index.commit_store(name, size, live)
    }

    pub(crate) fn abort_store(&mut self, name: &str) -> Result<(), DfsError> {
        self.index.abort_store(name)
    }

    /// Admits a REMOVE: checks capacity and visibility, marks the name
    /// RemoveInProgress, and returns its current replica set.
    pub(crate) fn admit_remove(
        &mut self,
        name: &str,
    ) -> Result<Vec<(NodeId, NodeHandle)>, Rejection> {
        self.check_capacity()?;
        let replicas = self.index.begin_remove(name)?;
        Ok(replicas
            .into_iter()
            .filter_map(|id| self.membership.handle(id).map(|h| (id, h.clone())))
            .collect())
    }

    pub(crate) fn finish_remove(&mut self, name: &str) -> Result<(), DfsError> {
        self.index.commit_remove(name)
    }

    pub(crate) fn revert_remove(
        &mut self,
        name: &str,
        deleted_on: &BTreeSet<NodeId>,
    ) -> Result<(), DfsError> {
        self.index.revert_remove(name, deleted_on)
    }

    /// Admits a LOAD or RELOAD: returns the first replica holder, in replica
    /// set order, not in `tried`, along with the file size.
    pub(crate) fn admit_load(
        &self,
        name: &str,
        tried: &[NodeId],
    ) -> Result<(NodeId, u64), Rejection> {
        self.check_capacity()?;
        let record = self.index.visible(name)?;
        if record.replicas.is_empty() {
            // every holder failed; nothing left to serve from
            return Err(Rejection::DoesNotExist);
        }
        record
            .replicas
            .iter()
            .find(|id| !tried.contains(id))
            .map(|id| (*id, record.size))
            .ok_or(Rejection::LoadFailed)
    }

    /// Admits a LIST: returns every StoreComplete filename.
    pub(crate) fn admit_list(&self) -> Result<Vec<String>, Rejection> {
        self.check_capacity()?;
        Ok(self.index.visible_names())
    }

    /// Whether a rebalance cycle may start now.
    pub(crate) fn rebalance_ready(&self) -> bool {
        self.membership.live_count() >= self.replication
            && !self.index.any_store_in_progress()
    }

    /// Reconciles the index against polled node inventories. Files present
    /// on no node are dropped from the index. Returns the surviving
    /// StoreComplete filenames and the orphan blobs (held by a node but
    /// unknown to the index) per node.
    pub(crate) fn reconcile(
        &mut self,
        inventory: &BTreeMap<NodeId, BTreeSet<String>>,
    ) -> (BTreeSet<String>, Vec<(NodeId, String)>) {
        let mut files = BTreeSet::new();
        for name in self.index.visible_names() {
            if inventory.values().any(|held| held.contains(&name)) {
                files.insert(name);
            } else {
                pf_warn!("c"; "file '{}' lost on every node, forgetting it", name);
                // visible_names() only yields StoreComplete records
                let _ = self.index.forget_lost(&name);
            }
        }

        let mut orphans = vec![];
        for (&id, held) in inventory {
            for name in held {
                if !self.index.contains(name) {
                    orphans.push((id, name.clone()));
                }
            }
        }
        (files, orphans)
    }

    /// Rewrites the replica set of every visible file from a per-node
    /// layout, keeping only live nodes.
    pub(crate) fn apply_layout(&mut self, layout: &BTreeMap<NodeId, BTreeSet<String>>) {
        for name in self.index.visible_names() {
            let holders: BTreeSet<NodeId> = layout
                .iter()
                .filter(|(id, held)| {
                    held.contains(&name) && self.membership.is_live(**id)
                })
                .map(|(id, _)| *id)
                .collect();
            if let Err(e) = self.index.set_replicas(&name, holders) {
                pf_error!("c"; "error applying layout: {}", e);
            }
        }
    }

    /// Live node handles, in NodeId order.
    pub(crate) fn live_handles(&self) -> Vec<(NodeId, NodeHandle)> {
        self.membership
            .node_ids()
            .into_iter()
            .filter_map(|id| self.membership.handle(id).map(|h| (id, h.clone())))
            .collect()
    }
}
