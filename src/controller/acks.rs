//! Fan-in of node acknowledgements into quorum waits.
//!
//! A coordinator registers the `(node, key)` pairs it needs before it sends
//! anything out, then blocks on a single bounded barrier. Node sessions
//! hand every reply line to `AckHub::deliver()`, which routes it to whoever
//! is waiting for it. Replies nobody waits for are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{Message, NodeId};

use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant};

/// What an acknowledgement is for.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub(crate) enum AckKey {
    Store(String),
    Remove(String),
    List,
    Rebalance,
}

impl AckKey {
    /// Maps a node-to-Controller reply to the key it acknowledges, plus the
    /// names it carries (inventory for LIST, empty otherwise).
    pub(crate) fn of_reply(msg: &Message) -> Option<(AckKey, Vec<String>)> {
        match msg {
            Message::StoreAck { name } => {
                Some((AckKey::Store(name.clone()), vec![]))
            }
            // "already absent" counts as a successful delete
            Message::RemoveAck { name } | Message::NoSuchFile { name } => {
                Some((AckKey::Remove(name.clone()), vec![]))
            }
            Message::List { files } => Some((AckKey::List, files.clone())),
            Message::RebalanceComplete => Some((AckKey::Rebalance, vec![])),
            _ => None,
        }
    }
}

type AckSender = mpsc::UnboundedSender<(NodeId, Vec<String>)>;

/// Registry of outstanding acknowledgement waiters.
#[derive(Debug, Default)]
pub(crate) struct AckHub {
    waiters: Mutex<HashMap<(NodeId, AckKey), AckSender>>,
}

impl AckHub {
    pub(crate) fn new() -> Self {
        AckHub {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in `key` from every node in `nodes`.
    pub(crate) async fn expect(
        self: &Arc<Self>,
        nodes: &[NodeId],
        key: AckKey,
    ) -> QuorumWait {
        let pairs: Vec<(NodeId, AckKey)> =
            nodes.iter().map(|&id| (id, key.clone())).collect();
        self.expect_each(pairs).await
    }

    /// Registers interest in an arbitrary set of `(node, key)` pairs.
    /// Duplicate pairs are counted once.
    pub(crate) async fn expect_each(
        self: &Arc<Self>,
        pairs: Vec<(NodeId, AckKey)>,
    ) -> QuorumWait {
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();
        let mut waiters = self.waiters.lock().await;
        let mut keys = HashSet::new();
        for pair in pairs {
            if keys.insert(pair.clone()) {
                if waiters.insert(pair.clone(), tx_ack.clone()).is_some() {
                    pf_warn!("c"; "waiter for {:?} replaced", pair);
                }
            }
        }

        QuorumWait {
            hub: self.clone(),
            keys,
            tx_ack,
            rx_ack,
        }
    }

    /// Routes a reply from `node` to its waiter. Returns false if the reply
    /// is not an acknowledgement at all.
    pub(crate) async fn deliver(&self, node: NodeId, msg: &Message) -> bool {
        let (key, names) = match AckKey::of_reply(msg) {
            Some(ack) => ack,
            None => return false,
        };

        let tx_ack = self.waiters.lock().await.remove(&(node, key.clone()));
        match tx_ack {
            Some(tx_ack) => {
                if tx_ack.send((node, names)).is_err() {
                    pf_debug!("c"; "late ack {:?} from {}", key, node);
                }
            }
            None => {
                pf_debug!("c"; "stray ack {:?} from {}", key, node);
            }
        }
        true
    }
}

/// Result of a bounded quorum wait.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QuorumOutcome {
    /// Every expected acknowledgement arrived.
    Complete(Vec<(NodeId, Vec<String>)>),

    /// The deadline passed; holds whatever did arrive.
    TimedOut(Vec<(NodeId, Vec<String>)>),
}

/// A registered "N of N, bounded by timeout" barrier.
#[derive(Debug)]
pub(crate) struct QuorumWait {
    hub: Arc<AckHub>,
    keys: HashSet<(NodeId, AckKey)>,
    tx_ack: AckSender,
    rx_ack: mpsc::UnboundedReceiver<(NodeId, Vec<String>)>,
}

impl QuorumWait {
    /// Waits until every expected acknowledgement has arrived or `timeout`
    /// elapses, whichever comes first. Unanswered registrations are removed
    /// afterwards so late replies count as stray.
    pub(crate) async fn wait_all(
        mut self,
        timeout: Duration,
    ) -> QuorumOutcome {
        let deadline = Instant::now() + timeout;
        let mut acked = Vec::with_capacity(self.keys.len());

        let complete = loop {
            if acked.len() >= self.keys.len() {
                break true;
            }
            match time::timeout_at(deadline, self.rx_ack.recv()).await {
                Ok(Some(ack)) => acked.push(ack),
                // tx_ack held by self, so the channel never closes here
                Ok(None) | Err(_) => break false,
            }
        };

        let mut waiters = self.hub.waiters.lock().await;
        for key in self.keys.drain() {
            if let Some(tx_ack) = waiters.get(&key) {
                if tx_ack.same_channel(&self.tx_ack) {
                    waiters.remove(&key);
                }
            }
        }

        if complete {
            QuorumOutcome::Complete(acked)
        } else {
            QuorumOutcome::TimedOut(acked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_ack(name: &str) -> Message {
        Message::StoreAck { name: name.into() }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn all_acks_complete() {
        let hub = Arc::new(AckHub::new());
        let wait = hub
            .expect(&[NodeId(7001), NodeId(7002)], AckKey::Store("f".into()))
            .await;
        let hub_ref = hub.clone();
        tokio::spawn(async move {
            assert!(hub_ref.deliver(NodeId(7002), &store_ack("f")).await);
            assert!(hub_ref.deliver(NodeId(7001), &store_ack("f")).await);
        });
        match wait.wait_all(Duration::from_secs(5)).await {
            QuorumOutcome::Complete(acked) => assert_eq!(acked.len(), 2),
            outcome => panic!("unexpected outcome {:?}", outcome),
        }
        assert!(hub.waiters.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_ack_times_out() {
        let hub = Arc::new(AckHub::new());
        let wait = hub
            .expect(&[NodeId(7001), NodeId(7002)], AckKey::Store("f".into()))
            .await;
        hub.deliver(NodeId(7001), &store_ack("f")).await;
        // wrong name, not counted
        hub.deliver(NodeId(7002), &store_ack("g")).await;
        assert_eq!(
            wait.wait_all(Duration::from_millis(100)).await,
            QuorumOutcome::TimedOut(vec![(NodeId(7001), vec![])])
        );
        assert!(hub.waiters.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_quorum_completes_immediately() {
        let hub = Arc::new(AckHub::new());
        let wait = hub.expect(&[], AckKey::Rebalance).await;
        assert_eq!(
            wait.wait_all(Duration::from_secs(5)).await,
            QuorumOutcome::Complete(vec![])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn absent_counts_as_removed() {
        let hub = Arc::new(AckHub::new());
        let wait = hub
            .expect(&[NodeId(7001), NodeId(7002)], AckKey::Remove("f".into()))
            .await;
        hub.deliver(NodeId(7001), &Message::RemoveAck { name: "f".into() })
            .await;
        hub.deliver(NodeId(7002), &Message::NoSuchFile { name: "f".into() })
            .await;
        assert!(matches!(
            wait.wait_all(Duration::from_secs(5)).await,
            QuorumOutcome::Complete(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_carries_inventory() {
        let hub = Arc::new(AckHub::new());
        let wait = hub.expect(&[NodeId(7001)], AckKey::List).await;
        let files = vec!["a".to_string(), "b".to_string()];
        hub.deliver(NodeId(7001), &Message::List { files: files.clone() })
            .await;
        assert_eq!(
            wait.wait_all(Duration::from_secs(5)).await,
            QuorumOutcome::Complete(vec![(NodeId(7001), files)])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_ack_not_delivered() {
        let hub = Arc::new(AckHub::new());
        assert!(!hub.deliver(NodeId(7001), &Message::StoreComplete).await);
        // stray but well-formed
        assert!(hub.deliver(NodeId(7001), &Message::RebalanceComplete).await);
    }
}
