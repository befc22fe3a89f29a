//! Per-filename state machine and replica bookkeeping.
//!
//! A name without a record is Absent. Transitions:
//! `Absent -> StoreInProgress -> StoreComplete -> RemoveInProgress -> Absent`,
//! plus `StoreInProgress -> Absent` on store abort and
//! `RemoveInProgress -> StoreComplete` on remove timeout.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::protocol::{NodeId, Rejection};
use crate::utils::DfsError;

/// Status of a present filename.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileStatus {
    StoreInProgress,
    StoreComplete,
    RemoveInProgress,
}

/// Index entry of one filename.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct FileRecord {
    pub(crate) status: FileStatus,

    /// Byte count, set when the store completes.
    pub(crate) size: u64,

    /// Nodes holding a copy; empty until the store completes.
    pub(crate) replicas: BTreeSet<NodeId>,
}

/// Map from filename to its record.
#[derive(Debug, Default)]
pub(crate) struct FileIndex {
    records: BTreeMap<String, FileRecord>,
}

impl FileIndex {
    pub(crate) fn new() -> Self {
        FileIndex {
            records: BTreeMap::new(),
        }
    }

    fn expect_status(
        &mut self,
        name: &str,
        status: FileStatus,
    ) -> Result<&mut FileRecord, DfsError> {
        match self.records.get_mut(name) {
            Some(record) if record.status == status => Ok(record),
            Some(record) => Err(DfsError::msg(format!(
                "file '{}' is {:?}, expected {:?}",
                name, record.status, status
            ))),
            None => Err(DfsError::msg(format!(
                "file '{}' is absent, expected {:?}",
                name, status
            ))),
        }
    }

    /// Absent -> StoreInProgress.
    pub(crate) fn begin_store(&mut self, name: &str) -> Result<(), Rejection> {
        if self.records.contains_key(name) {
            return Err(Rejection::AlreadyExists);
        }
        self.records.insert(
            name.into(),
            FileRecord {
                status: FileStatus::StoreInProgress,
                size: 0,
                replicas: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// StoreInProgress -> StoreComplete.
    pub(crate) fn commit_store(
        &mut self,
        name: &str,
        size: u64,
        nodes: BTreeSet<NodeId>,
    ) -> Result<(), DfsError> {
        let record = self.expect_status(name, FileStatus::StoreInProgress)?;
        record.status = FileStatus::StoreComplete;
        record.size = size;
        record.replicas = nodes;
        Ok(())
    }

    /// StoreInProgress -> Absent; the name becomes storable again.
    pub(crate) fn abort_store(&mut self, name: &str) -> Result<(), DfsError> {
        self.expect_status(name, FileStatus::StoreInProgress)?;
        self.records.remove(name);
        Ok(())
    }

    /// StoreComplete -> RemoveInProgress. Returns the nodes to delete from.
    pub(crate) fn begin_remove(
        &mut self,
        name: &str,
    ) -> Result<BTreeSet<NodeId>, Rejection> {
        match self.records.get_mut(name) {
            Some(record) if record.status == FileStatus::StoreComplete => {
                record.status = FileStatus::RemoveInProgress;
                Ok(record.replicas.clone())
            }
            _ => Err(Rejection::DoesNotExist),
        }
    }

    /// RemoveInProgress -> Absent.
    pub(crate) fn commit_remove(&mut self, name: &str) -> Result<(), DfsError> {
        self.expect_status(name, FileStatus::RemoveInProgress)?;
        self.records.remove(name);
        Ok(())
    }

    /// RemoveInProgress -> StoreComplete, dropping the nodes that already
    /// deleted their copy.
    pub(crate) fn revert_remove(
        &mut self,
        name: &str,
        deleted_on: &BTreeSet<NodeId>,
    ) -> Result<(), DfsError> {
        let record = self.expect_status(name, FileStatus::RemoveInProgress)?;
        record.status = FileStatus::StoreComplete;
        record.replicas.retain(|id| !deleted_on.contains(id));
        Ok(())
    }

    /// Record of a client-visible (StoreComplete) file.
    pub(crate) fn visible(&self, name: &str) -> Result<&FileRecord, Rejection> {
        match self.records.get(name) {
            Some(record) if record.status == FileStatus::StoreComplete => {
                Ok(record)
            }
            _ => Err(Rejection::DoesNotExist),
        }
    }

    /// All client-visible filenames in order.
    pub(crate) fn visible_names(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| r.status == FileStatus::StoreComplete)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(crate) fn any_store_in_progress(&self) -> bool {
        self.records
            .values()
            .any(|r| r.status == FileStatus::StoreInProgress)
    }

    /// Strips a failed node from every replica set.
    pub(crate) fn strip_node(&mut self, id: NodeId) {
        for record in self.records.values_mut() {
            record.replicas.remove(&id);
        }
    }

    /// Number of files each node holds according to the replica sets.
    pub(crate) fn node_loads(&self) -> HashMap<NodeId, usize> {
        let mut loads = HashMap::new();
        for record in self.records.values() {
            for id in &record.replicas {
                *loads.entry(*id).or_insert(0) += 1;
            }
        }
        loads
    }

    /// Drops a StoreComplete record whose every copy has been lost.
    pub(crate) fn forget_lost(&mut self, name: &str) -> Result<(), DfsError> {
        self.expect_status(name, FileStatus::StoreComplete)?;
        self.records.remove(name);
        Ok(())
    }

    /// Overwrites the replica set of a StoreComplete record.
    pub(crate) fn set_replicas(
        &mut self,
        name: &str,
        nodes: BTreeSet<NodeId>,
    ) -> Result<(), DfsError> {
        let record = self.expect_status(name, FileStatus::StoreComplete)?;
        record.replicas = nodes;
        Ok(())
    }

    /// Whether the name has any record, in any status.
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }
}
