//! Execution of a rebalance instruction on a storage node.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::dstore::node::NodeShared;
use crate::protocol::{push_blob, Message, RebalanceInstr};

use futures::future::join_all;

/// Ships every listed file to its destinations, then deletes the files
/// named for deletion, then reports completion to the Controller. A file
/// that failed to reach some destination is not deleted locally, and the
/// instruction is then not reported complete: the Controller's wait times
/// out and it keeps this node's holdings as they were.
pub(crate) async fn execute_rebalance(shared: Arc<NodeShared>, instr: RebalanceInstr) {
    let mut unshipped = HashSet::new();

    for (name, dests) in &instr.sends {
        let data = match shared.store.get(name).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                pf_warn!(shared.me; "rebalance source '{}' not held", name);
                unshipped.insert(name.clone());
                continue;
            }
            Err(e) => {
                pf_error!(shared.me; "error reading '{}': {}", name, e);
                unshipped.insert(name.clone());
                continue;
            }
        };

        let header = Message::RebalanceStore {
            name: name.clone(),
            size: data.len() as u64,
        };
        let pushes = dests.iter().map(|dest| {
            let addr = SocketAddr::new(shared.peer_host, dest.0);
            push_blob(addr, &header, &data, shared.timeout)
        });
        for (dest, result) in dests.iter().zip(join_all(pushes).await) {
            if let Err(e) = result {
                pf_warn!(shared.me; "error shipping '{}' to {}: {}", name, dest, e);
                unshipped.insert(name.clone());
            }
        }
    }

    for name in &instr.deletes {
        if unshipped.contains(name) {
            pf_warn!(shared.me; "keeping '{}' after failed shipping", name);
            continue;
        }
        if let Err(e) = shared.store.delete(name).await {
            pf_error!(shared.me; "error deleting '{}': {}", name, e);
        }
    }

    if !unshipped.is_empty() {
        pf_warn!(shared.me; "rebalance incomplete, {} of {} files unshipped",
                            unshipped.len(), instr.sends.len());
        return;
    }
    pf_debug!(shared.me; "rebalance done, {} files shipped", instr.sends.len());
    if let Err(e) = shared.tx_ctrl.send(Message::RebalanceComplete) {
        pf_error!(shared.me; "error reporting rebalance: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use crate::dstore::blobstore::{BlobStore, FolderStore};
    use crate::protocol::{Diagnostics, FrameReader, FrameWriter, NodeId};
    use crate::utils::{tcp_bind_with_retry, DfsError};

    use bytes::Bytes;
    use tokio::sync::mpsc;

    async fn node_with_file(
        me: u16,
        folder: &str,
    ) -> Result<(Arc<NodeShared>, mpsc::UnboundedReceiver<Message>), DfsError>
    {
        let store = FolderStore::new_and_setup(folder, true).await?;
        store.put("a", Bytes::from_static(b"hello")).await?;
        let (tx_ctrl, rx_ctrl) = mpsc::unbounded_channel();
        let shared = Arc::new(NodeShared {
            me,
            timeout: Duration::from_millis(500),
            peer_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_blob_size: 1 << 20,
            store: Arc::new(store),
            tx_ctrl,
            diag: Diagnostics::new_and_setup(me, "").await?,
        });
        Ok((shared, rx_ctrl))
    }

    fn move_a_to(dest: u16) -> RebalanceInstr {
        RebalanceInstr {
            sends: vec![("a".into(), vec![NodeId(dest)])],
            deletes: vec!["a".into()],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn move_reported_once_shipped() -> Result<(), DfsError> {
        let (shared, mut rx_ctrl) =
            node_with_file(47843, "/tmp/dfstore-rebalance-test-1").await?;
        let listener = tcp_bind_with_retry("127.0.0.1:47844".parse()?, 3).await?;
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let mut writer = FrameWriter::new(write_half);
            let header = reader.read_line().await?;
            writer.send(&Message::Ack).await?;
            let data = reader.read_payload(5).await?;
            Ok::<_, DfsError>((header, data))
        });

        execute_rebalance(shared.clone(), move_a_to(47844)).await;
        let (header, data) = peer.await.map_err(DfsError::msg)??;
        assert_eq!(header, Some("REBALANCE_STORE a 5".into()));
        assert_eq!(&data[..], b"hello");
        assert_eq!(shared.store.get("a").await?, None);
        assert_eq!(rx_ctrl.try_recv().ok(), Some(Message::RebalanceComplete));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_move_keeps_file_unreported() -> Result<(), DfsError> {
        let (shared, mut rx_ctrl) =
            node_with_file(47841, "/tmp/dfstore-rebalance-test-0").await?;

        // nothing listens on the destination port
        execute_rebalance(shared.clone(), move_a_to(47842)).await;
        assert_eq!(
            shared.store.get("a").await?,
            Some(Bytes::from_static(b"hello"))
        );
        assert!(rx_ctrl.try_recv().is_err());
        Ok(())
    }
}
