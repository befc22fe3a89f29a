//! Per-connection session handlers of the Controller.
//!
//! Every accepted connection starts as a client session. A connection whose
//! first line is `JOIN <port>` becomes the control session of a storage
//! node for the rest of its life.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::controller::acks::{AckKey, QuorumOutcome};
use crate::controller::cluster::ControllerShared;
use crate::controller::membership::NodeHandle;
use crate::protocol::{
    FrameReader, FrameWriter, Line, Message, NodeId, Rejection,
};
use crate::utils::DfsError;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Per-client session state.
struct ClientSession {
    shared: Arc<ControllerShared>,

    /// Peer address, for diagnostics.
    addr: SocketAddr,

    writer: FrameWriter<OwnedWriteHalf>,

    /// File being loaded in this session and the replicas already handed
    /// out for it.
    load_cursor: Option<(String, Vec<NodeId>)>,
}

/// Session task of one accepted connection.
pub(crate) async fn session_thread(
    shared: Arc<ControllerShared>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut session = ClientSession {
        shared,
        addr,
        writer: FrameWriter::new(write_half),
        load_cursor: None,
    };
    let mut first = true;

    loop {
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                pf_debug!("c"; "connection from '{}' closed", addr);
                break;
            }
            Err(e) => {
                pf_debug!("c"; "error reading from '{}': {}", addr, e);
                break;
            }
        };
        let msg = match line.parse_msg() {
            Ok(msg) => msg,
            Err(e) => {
                session.shared.diag.record(addr, &line, &e).await;
                continue;
            }
        };

        if let Message::Join { port } = msg {
            if first {
                let ClientSession { shared, writer, .. } = session;
                node_session(shared, reader, writer, addr, NodeId(port)).await;
                return;
            }
            let reason = DfsError::msg("JOIN after client requests");
            session.shared.diag.record(addr, &line, &reason).await;
            continue;
        }
        first = false;

        // suspended while a rebalance cycle holds the gate
        let shared = session.shared.clone();
        let _gate = shared.gate.read().await;
        if let Err(e) = session.handle_request(msg, &line).await {
            pf_warn!("c"; "client session '{}' ended: {}", addr, e);
            break;
        }
    }
}

// ClientSession request handlers
impl ClientSession {
    async fn reply(&mut self, msg: Message) -> Result<(), DfsError> {
        self.writer.send(&msg).await
    }

    async fn handle_request(
        &mut self,
        msg: Message,
        line: &Line,
    ) -> Result<(), DfsError> {
        match msg {
            Message::Store { name, size } => self.handle_store(name, size).await,
            Message::Load { name } => {
                self.load_cursor = Some((name.clone(), vec![]));
                self.handle_load(name).await
            }
            Message::Reload { name } => self.handle_load(name).await,
            Message::Remove { name } => self.handle_remove(name).await,
            Message::List { files } if files.is_empty() => {
                let listed = self.shared.state.lock().await.admit_list();
                match listed {
                    Ok(files) => self.reply(Message::List { files }).await,
                    Err(rej) => self.reply(Message::Rejected(rej)).await,
                }
            }
            _ => {
                let reason = DfsError::msg("unexpected on client session");
                self.shared.diag.record(self.addr, line, &reason).await;
                Ok(())
            }
        }
    }

    /// STORE: pick replicas, tell the client where to push, and commit only
    /// once every chosen node has acknowledged its copy.
    async fn handle_store(
        &mut self,
        name: String,
        size: u64,
    ) -> Result<(), DfsError> {
        let admitted = self.shared.state.lock().await.admit_store(&name);
        let nodes = match admitted {
            Ok(nodes) => nodes,
            Err(rej) => return self.reply(Message::Rejected(rej)).await,
        };

        // registered before the client can reach any node
        let wait = self
            .shared
            .acks
            .expect(&nodes, AckKey::Store(name.clone()))
            .await;
        if let Err(e) = self.reply(Message::StoreTo { nodes: nodes.clone() }).await
        {
            self.shared.state.lock().await.abort_store(&name)?;
            return Err(e);
        }

        match wait.wait_all(self.shared.timeout).await {
            QuorumOutcome::Complete(_) => {
                self.shared
                    .state
                    .lock()
                    .await
                    .finish_store(&name, size, &nodes)?;
                pf_info!("c"; "stored '{}' ({} bytes) on {:?}", name, size, nodes);
                self.reply(Message::StoreComplete).await
            }
            QuorumOutcome::TimedOut(acked) => {
                pf_warn!("c"; "store '{}' timed out, {} of {} acked",
                              name, acked.len(), nodes.len());
                self.shared.state.lock().await.abort_store(&name)
            }
        }
    }

    /// LOAD/RELOAD: hand out the next replica not yet tried for this name.
    async fn handle_load(&mut self, name: String) -> Result<(), DfsError> {
        let resumed = matches!(self.load_cursor,
                               Some((ref loading, _)) if *loading == name);
        if !resumed {
            // RELOAD without a matching LOAD starts afresh
            self.load_cursor = Some((name.clone(), vec![]));
        }
        let tried = self
            .load_cursor
            .as_ref()
            .map(|(_, tried)| tried.clone())
            .unwrap_or_default();

        let admitted = self.shared.state.lock().await.admit_load(&name, &tried);
        match admitted {
            Ok((node, size)) => {
                if let Some((_, ref mut tried)) = self.load_cursor {
                    tried.push(node);
                }
                self.reply(Message::LoadFrom { node, size }).await
            }
            Err(rej) => {
                if rej == Rejection::LoadFailed {
                    self.load_cursor = None;
                }
                self.reply(Message::Rejected(rej)).await
            }
        }
    }

    /// REMOVE: delete on every current holder, commit only on a full set of
    /// acknowledgements. On timeout the record goes back to StoreComplete
    /// without the nodes that already deleted it.
    async fn handle_remove(&mut self, name: String) -> Result<(), DfsError> {
        let admitted = self.shared.state.lock().await.admit_remove(&name);
        let targets = match admitted {
            Ok(targets) => targets,
            Err(rej) => return self.reply(Message::Rejected(rej)).await,
        };

        let ids: Vec<NodeId> = targets.iter().map(|(id, _)| *id).collect();
        let wait = self
            .shared
            .acks
            .expect(&ids, AckKey::Remove(name.clone()))
            .await;
        for (id, handle) in &targets {
            if let Err(e) = handle.send(Message::Remove { name: name.clone() }) {
                pf_warn!("c"; "error sending REMOVE to {}: {}", id, e);
            }
        }

        match wait.wait_all(self.shared.timeout).await {
            QuorumOutcome::Complete(_) => {
                self.shared.state.lock().await.finish_remove(&name)?;
                pf_info!("c"; "removed '{}' from {:?}", name, ids);
                self.reply(Message::RemoveComplete).await
            }
            QuorumOutcome::TimedOut(acked) => {
                let deleted_on: BTreeSet<NodeId> =
                    acked.into_iter().map(|(id, _)| id).collect();
                pf_warn!("c"; "remove '{}' timed out, {} of {} acked",
                              name, deleted_on.len(), ids.len());
                self.shared
                    .state
                    .lock()
                    .await
                    .revert_remove(&name, &deleted_on)
            }
        }
    }
}

/// Control session of a storage node that sent `JOIN`.
async fn node_session(
    shared: Arc<ControllerShared>,
    mut reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    addr: SocketAddr,
    id: NodeId,
) {
    let (tx_send, rx_send) = mpsc::unbounded_channel();
    let handle = NodeHandle::new(tx_send);
    let joined = shared.state.lock().await.node_joined(id, handle.clone());
    if let Err(e) = joined {
        pf_warn!("c"; "JOIN from '{}' refused: {}", addr, e);
        return;
    }
    pf_info!("c"; "node {} joined from '{}'", id, addr);

    let messenger_handle =
        tokio::spawn(node_messenger_thread(id, writer, rx_send));
    shared.rebalance_kick.notify_one();

    loop {
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                pf_warn!("c"; "node {} disconnected", id);
                break;
            }
            Err(e) => {
                pf_warn!("c"; "error reading from node {}: {}", id, e);
                break;
            }
        };

        match line.parse_msg() {
            Ok(msg) => {
                if !shared.acks.deliver(id, &msg).await {
                    let reason = DfsError::msg("unexpected on node session");
                    shared.diag.record(addr, &line, &reason).await;
                }
            }
            Err(e) => shared.diag.record(addr, &line, &e).await,
        }
    }

    if shared.state.lock().await.node_failed(id, &handle) {
        pf_info!("c"; "node {} removed from membership", id);
    }
    messenger_handle.abort();
}

/// Writer task of a storage node's control connection. Exits when the node
/// handle is dropped or a write fails.
async fn node_messenger_thread(
    id: NodeId,
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut rx_send: mpsc::UnboundedReceiver<Message>,
) {
    pf_debug!("c"; "node_messenger thread for {} spawned", id);

    while let Some(msg) = rx_send.recv().await {
        if let Err(e) = writer.send(&msg).await {
            pf_warn!("c"; "error sending to node {}: {}", id, e);
            break;
        }
    }

    pf_debug!("c"; "node_messenger thread for {} exitted", id);
}
