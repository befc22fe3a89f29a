//! Background rebalance cycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::controller::acks::{AckKey, QuorumOutcome};
use crate::controller::cluster::ControllerShared;
use crate::controller::membership::NodeHandle;
use crate::controller::planner::{plan_rebalance, Layout};
use crate::protocol::{Message, NodeId};

use tokio::time::{self, MissedTickBehavior};

/// How one rebalance cycle ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum CycleOutcome {
    /// Preconditions not met or client operations in flight.
    Skipped,

    /// Every addressed node completed within the timeout.
    Succeeded,

    /// Some node did not answer in time.
    Failed,
}

/// Polls every live node for its inventory. Returns `None` unless every
/// node answers within the timeout.
async fn poll_inventory(
    shared: &ControllerShared,
    nodes: &[(NodeId, NodeHandle)],
) -> Option<Layout> {
    let ids: Vec<NodeId> = nodes.iter().map(|(id, _)| *id).collect();
    let wait = shared.acks.expect(&ids, AckKey::List).await;
    for (id, handle) in nodes {
        if let Err(e) = handle.send(Message::List { files: vec![] }) {
            pf_warn!("c"; "error sending LIST to {}: {}", id, e);
        }
    }

    match wait.wait_all(shared.timeout).await {
        QuorumOutcome::Complete(acked) => {
            let mut inventory: Layout =
                ids.iter().map(|id| (*id, BTreeSet::new())).collect();
            for (id, files) in acked {
                inventory.entry(id).or_default().extend(files);
            }
            Some(inventory)
        }
        QuorumOutcome::TimedOut(acked) => {
            pf_warn!("c"; "inventory poll timed out, {} of {} answered",
                          acked.len(), ids.len());
            None
        }
    }
}

/// Orders orphan blobs deleted. Their absence from the index already keeps
/// them out of planning, so the outcome is only logged.
async fn remove_orphans(
    shared: &ControllerShared,
    orphans: Vec<(NodeId, String)>,
) {
    if orphans.is_empty() {
        return;
    }

    let pairs = orphans
        .iter()
        .map(|(id, name)| (*id, AckKey::Remove(name.clone())))
        .collect();
    let wait = shared.acks.expect_each(pairs).await;
    {
        let state = shared.state.lock().await;
        for (id, name) in &orphans {
            pf_debug!("c"; "removing orphan '{}' from {}", name, id);
            match state.membership.handle(*id) {
                Some(handle) => {
                    if let Err(e) =
                        handle.send(Message::Remove { name: name.clone() })
                    {
                        pf_warn!("c"; "error sending REMOVE to {}: {}", id, e);
                    }
                }
                None => pf_warn!("c"; "node {} gone before orphan cleanup", id),
            }
        }
    }

    if let QuorumOutcome::TimedOut(acked) = wait.wait_all(shared.timeout).await
    {
        pf_warn!("c"; "orphan cleanup timed out, {} of {} removed",
                      acked.len(), orphans.len());
    }
}

/// Runs one rebalance cycle: poll, reconcile, plan, instruct, and record the
/// resulting layout. Client requests are held off for the whole cycle.
pub(crate) async fn run_cycle(shared: &Arc<ControllerShared>) -> CycleOutcome {
    // never queue behind in-flight client operations
    let _gate = match shared.gate.try_write() {
        Ok(guard) => guard,
        Err(_) => return CycleOutcome::Skipped,
    };

    let nodes = {
        let state = shared.state.lock().await;
        if !state.rebalance_ready() {
            return CycleOutcome::Skipped;
        }
        state.live_handles()
    };

    let inventory = match poll_inventory(shared, &nodes).await {
        Some(inventory) => inventory,
        None => return CycleOutcome::Failed,
    };

    let (files, orphans) = shared.state.lock().await.reconcile(&inventory);
    remove_orphans(shared, orphans).await;

    let plan = plan_rebalance(&inventory, &files, shared.replication);
    if plan.instrs.is_empty() {
        shared.state.lock().await.apply_layout(&plan.target);
        return CycleOutcome::Succeeded;
    }

    let addressed: Vec<NodeId> = plan.instrs.keys().copied().collect();
    let wait = shared.acks.expect(&addressed, AckKey::Rebalance).await;
    for (id, instr) in &plan.instrs {
        pf_debug!("c"; "rebalance instr to {}: {:?}", id, instr);
        let sent = nodes
            .iter()
            .find(|(node, _)| node == id)
            .map(|(_, handle)| handle.send(Message::Rebalance(instr.clone())));
        if let Some(Err(e)) = sent {
            pf_warn!("c"; "error sending REBALANCE to {}: {}", id, e);
        }
    }

    match wait.wait_all(shared.timeout).await {
        QuorumOutcome::Complete(_) => {
            shared.state.lock().await.apply_layout(&plan.target);
            CycleOutcome::Succeeded
        }
        QuorumOutcome::TimedOut(acked) => {
            let completed: BTreeSet<NodeId> =
                acked.into_iter().map(|(id, _)| id).collect();
            pf_warn!("c"; "rebalance timed out, {} of {} completed",
                          completed.len(), addressed.len());
            let layout = plan.surviving_layout(&inventory, &completed);
            shared.state.lock().await.apply_layout(&layout);
            CycleOutcome::Failed
        }
    }
}

/// Rebalancer task: runs a cycle every `interval`, or earlier when kicked
/// by a node JOIN.
pub(crate) async fn rebalancer_thread(
    shared: Arc<ControllerShared>,
    interval: Duration,
) {
    pf_debug!("c"; "rebalancer thread spawned");

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = shared.rebalance_kick.notified() => {
                ticker.reset();
            },
        }

        let outcome = run_cycle(&shared).await;
        match outcome {
            CycleOutcome::Skipped => {
                pf_trace!("c"; "rebalance cycle skipped");
            }
            CycleOutcome::Succeeded => {
                pf_info!("c"; "rebalance cycle succeeded");
            }
            CycleOutcome::Failed => {
                pf_warn!("c"; "rebalance cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::controller::membership::Placement;
    use crate::controller::state::ClusterState;
    use crate::controller::acks::AckHub;
    use crate::protocol::Diagnostics;
    use crate::utils::DfsError;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{mpsc, Mutex, Notify, RwLock};

    type FakeDisks = Arc<StdMutex<Layout>>;

    async fn shared_of(r: usize) -> Result<Arc<ControllerShared>, DfsError> {
        Ok(Arc::new(ControllerShared {
            replication: r,
            timeout: Duration::from_millis(500),
            state: Mutex::new(ClusterState::new(r, Placement::LeastLoaded)),
            acks: Arc::new(AckHub::new()),
            gate: RwLock::new(()),
            diag: Diagnostics::new_and_setup("c", "").await?,
            rebalance_kick: Notify::new(),
        }))
    }

    /// Joins a fake node that obeys control messages against `disks`.
    async fn fake_node(shared: &Arc<ControllerShared>, id: u16, disks: &FakeDisks) {
        let id = NodeId(id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared
            .state
            .lock()
            .await
            .node_joined(id, NodeHandle::new(tx))
            .unwrap();
        disks.lock().unwrap().entry(id).or_default();

        let shared = shared.clone();
        let disks = disks.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let reply = {
                    let mut disks = disks.lock().unwrap();
                    match msg {
                        Message::List { .. } => Message::List {
                            files: disks[&id].iter().cloned().collect(),
                        },
                        Message::Remove { name } => {
                            disks.get_mut(&id).unwrap().remove(&name);
                            Message::RemoveAck { name }
                        }
                        Message::Rebalance(instr) => {
                            for (name, dests) in instr.sends {
                                for dest in dests {
                                    disks.get_mut(&dest).unwrap().insert(name.clone());
                                }
                            }
                            for name in instr.deletes {
                                disks.get_mut(&id).unwrap().remove(&name);
                            }
                            Message::RebalanceComplete
                        }
                        _ => continue,
                    }
                };
                shared.acks.deliver(id, &reply).await;
            }
        });
    }

    async fn put_file(shared: &Arc<ControllerShared>, disks: &FakeDisks, name: &str, on: &[u16]) {
        let mut state = shared.state.lock().await;
        state.index.begin_store(name).unwrap();
        let replicas = on.iter().map(|&id| NodeId(id)).collect();
        state.index.commit_store(name, 1, replicas).unwrap();
        let mut disks = disks.lock().unwrap();
        for &id in on {
            disks.entry(NodeId(id)).or_default().insert(name.into());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disjoint_files_spread() -> Result<(), DfsError> {
        let shared = shared_of(2).await?;
        let disks: FakeDisks = Arc::new(StdMutex::new(BTreeMap::new()));
        for id in [7001, 7002, 7003] {
            fake_node(&shared, id, &disks).await;
        }
        put_file(&shared, &disks, "a", &[7001]).await;
        put_file(&shared, &disks, "b", &[7002]).await;
        put_file(&shared, &disks, "c", &[7003]).await;

        assert_eq!(run_cycle(&shared).await, CycleOutcome::Succeeded);

        let disks = disks.lock().unwrap().clone();
        let state = shared.state.lock().await;
        for name in ["a", "b", "c"] {
            let record = state.index.visible(name).map_err(DfsError::msg)?;
            assert_eq!(record.replicas.len(), 2);
            for id in &record.replicas {
                assert!(disks[id].contains(name));
            }
        }
        assert!(disks.values().all(|held| held.len() == 2));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lost_file_forgotten_and_orphan_removed() -> Result<(), DfsError> {
        let shared = shared_of(1).await?;
        let disks: FakeDisks = Arc::new(StdMutex::new(BTreeMap::new()));
        fake_node(&shared, 7001, &disks).await;
        // indexed but held nowhere
        put_file(&shared, &disks, "lost", &[]).await;
        disks
            .lock()
            .unwrap()
            .get_mut(&NodeId(7001))
            .unwrap()
            .insert("stray".into());

        assert_eq!(run_cycle(&shared).await, CycleOutcome::Succeeded);
        assert_eq!(shared.state.lock().await.admit_list(), Ok(vec![]));
        assert!(disks.lock().unwrap()[&NodeId(7001)].is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skipped_while_client_busy() -> Result<(), DfsError> {
        let shared = shared_of(1).await?;
        let disks: FakeDisks = Arc::new(StdMutex::new(BTreeMap::new()));
        fake_node(&shared, 7001, &disks).await;
        {
            let _request = shared.gate.read().await;
            assert_eq!(run_cycle(&shared).await, CycleOutcome::Skipped);
        }
        assert_eq!(run_cycle(&shared).await, CycleOutcome::Succeeded);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skipped_below_replication() -> Result<(), DfsError> {
        let shared = shared_of(2).await?;
        let disks: FakeDisks = Arc::new(StdMutex::new(BTreeMap::new()));
        fake_node(&shared, 7001, &disks).await;
        assert_eq!(run_cycle(&shared).await, CycleOutcome::Skipped);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_node_fails_cycle() -> Result<(), DfsError> {
        let shared = shared_of(1).await?;
        let disks: FakeDisks = Arc::new(StdMutex::new(BTreeMap::new()));
        fake_node(&shared, 7001, &disks).await;
        // joined but never answers
        let (tx, _rx) = mpsc::unbounded_channel();
        shared
            .state
            .lock()
            .await
            .node_joined(NodeId(7002), NodeHandle::new(tx))?;
        assert_eq!(run_cycle(&shared).await, CycleOutcome::Failed);
        Ok(())
    }
}
